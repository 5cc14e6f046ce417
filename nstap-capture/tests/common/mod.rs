//! Shared helpers for capture integration tests

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

pub const ECHO_REQUEST: u8 = 128;
pub const ECHO_REPLY: u8 = 129;
pub const NEIGHBOR_SOLICITATION: u8 = 135;

/// Ethernet + IPv6 + ICMPv6 frame from `fc::<src>` to `fc::<dst>`
pub fn icmpv6_frame(src: u8, dst: u8, icmp_type: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + 40 + 8];
    frame[12] = 0x86;
    frame[13] = 0xdd;
    frame[14] = 0x60;
    frame[19] = 0x08; // payload length
    frame[20] = 58; // next header: ICMPv6
    frame[21] = 64;
    frame[23] = 0xfc;
    frame[37] = src;
    frame[39] = 0xfc;
    frame[53] = dst;
    frame[54] = icmp_type;
    frame
}

/// Poll `cond` until it holds or five seconds pass
pub fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
