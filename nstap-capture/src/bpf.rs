//! Classic BPF programs
//!
//! A [`BpfProgram`] is the kernel-level filter form. It is either built from
//! raw instructions or compiled from a libpcap filter expression, validated
//! once, and then attached to every tap socket with `SO_ATTACH_FILTER`. The
//! same program can be executed in-process by [`BpfProgram::run`], which
//! follows the Linux interpreter semantics.

use parking_lot::{const_mutex, Mutex};
use pcap::{Capture, Linktype};
use nstap_core::{Error, Result};
use std::fmt;

/// Maximum number of instructions the kernel accepts
pub const MAX_INSTRUCTIONS: usize = 4096;

/// Number of scratch memory slots
pub const MEMORY_WORDS: usize = 16;

// Instruction classes
const LD: u16 = 0x00;
const LDX: u16 = 0x01;
const ST: u16 = 0x02;
const STX: u16 = 0x03;
const ALU: u16 = 0x04;
const JMP: u16 = 0x05;
const RET: u16 = 0x06;
const MISC: u16 = 0x07;

// Load sizes
const W: u16 = 0x00;
const H: u16 = 0x08;
const B: u16 = 0x10;

// Addressing modes
const IMM: u16 = 0x00;
const ABS: u16 = 0x20;
const IND: u16 = 0x40;
const MEM: u16 = 0x60;
const LEN: u16 = 0x80;
const MSH: u16 = 0xa0;

// ALU operations
const ADD: u16 = 0x00;
const SUB: u16 = 0x10;
const MUL: u16 = 0x20;
const DIV: u16 = 0x30;
const OR: u16 = 0x40;
const AND: u16 = 0x50;
const LSH: u16 = 0x60;
const RSH: u16 = 0x70;
const NEG: u16 = 0x80;
const MOD: u16 = 0x90;
const XOR: u16 = 0xa0;

// Jump operations
const JA: u16 = 0x00;
const JEQ: u16 = 0x10;
const JGT: u16 = 0x20;
const JGE: u16 = 0x30;
const JSET: u16 = 0x40;

// Operand source
const K: u16 = 0x00;
const X: u16 = 0x08;

// Return value source
const RET_A: u16 = 0x10;

// Misc operations
const TAX: u16 = 0x00;
const TXA: u16 = 0x80;

/// libpcap's compiler is not reentrant on older releases
static COMPILER: Mutex<()> = const_mutex(());

/// One classic BPF instruction (`struct sock_filter`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BpfInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl BpfInstruction {
    /// Create an instruction from its raw fields
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// `ldh [offset]`
    pub const fn load_half(offset: u32) -> Self {
        Self::new(LD | H | ABS, 0, 0, offset)
    }

    /// `ldb [offset]`
    pub const fn load_byte(offset: u32) -> Self {
        Self::new(LD | B | ABS, 0, 0, offset)
    }

    /// `ld [offset]`
    pub const fn load_word(offset: u32) -> Self {
        Self::new(LD | W | ABS, 0, 0, offset)
    }

    /// `jeq #value, skip_true, skip_false`
    pub const fn jump_eq(value: u32, skip_true: u8, skip_false: u8) -> Self {
        Self::new(JMP | JEQ | K, skip_true, skip_false, value)
    }

    /// `ret #value`
    pub const fn ret(value: u32) -> Self {
        Self::new(RET | K, 0, 0, value)
    }

    fn class(&self) -> u16 {
        self.code & 0x07
    }

    fn size(&self) -> u16 {
        self.code & 0x18
    }

    fn mode(&self) -> u16 {
        self.code & 0xe0
    }

    fn op(&self) -> u16 {
        self.code & 0xf0
    }

    fn src(&self) -> u16 {
        self.code & 0x08
    }

    /// Parse the `code jt jf k` form printed by `tcpdump -ddd`
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(Error::filter(format!("malformed instruction '{}'", line)));
        }
        let bad = |_: std::num::ParseIntError| Error::filter(format!("malformed instruction '{}'", line));
        Ok(Self {
            code: fields[0].parse().map_err(bad)?,
            jt: fields[1].parse().map_err(bad)?,
            jf: fields[2].parse().map_err(bad)?,
            k: fields[3].parse().map_err(bad)?,
        })
    }
}

impl fmt::Display for BpfInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.code, self.jt, self.jf, self.k)
    }
}

/// A validated classic BPF program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfProgram {
    instructions: Vec<BpfInstruction>,
}

impl BpfProgram {
    /// Validate raw instructions into a program
    pub fn new(instructions: Vec<BpfInstruction>) -> Result<Self> {
        let program = Self { instructions };
        program.validate()?;
        Ok(program)
    }

    /// Program accepting every packet up to `snaplen` bytes
    pub fn accept_all(snaplen: u32) -> Self {
        Self {
            instructions: vec![BpfInstruction::ret(snaplen)],
        }
    }

    /// Compile a libpcap filter expression for Ethernet links
    ///
    /// Accepting return values are clamped to `snaplen`.
    pub fn compile(expression: &str, snaplen: u32) -> Result<Self> {
        let instructions = {
            let _guard = COMPILER.lock();
            let handle = Capture::dead(Linktype::ETHERNET)
                .map_err(|e| Error::filter(format!("cannot create compiler handle: {}", e)))?;
            let compiled = handle
                .compile(expression, true)
                .map_err(|e| Error::filter(format!("'{}': {}", expression, e)))?;
            compiled
                .get_instructions()
                .iter()
                .map(|insn| BpfInstruction::parse(&insn.to_string()))
                .collect::<Result<Vec<_>>>()?
        };

        let mut program = Self::new(instructions)?;
        program.clamp_snaplen(snaplen);
        Ok(program)
    }

    /// Lower every non-zero constant return to at most `snaplen`
    pub fn clamp_snaplen(&mut self, snaplen: u32) {
        for insn in &mut self.instructions {
            if insn.class() == RET && insn.src() == K && insn.k > snaplen {
                insn.k = snaplen;
            }
        }
    }

    /// Program instructions
    pub fn instructions(&self) -> &[BpfInstruction] {
        &self.instructions
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the program is empty (never true for a validated program)
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let len = self.instructions.len();
        if len == 0 || len > MAX_INSTRUCTIONS {
            return Err(Error::filter(format!(
                "program length {} outside 1..={}",
                len, MAX_INSTRUCTIONS
            )));
        }

        for (pc, insn) in self.instructions.iter().enumerate() {
            let invalid = |what: &str| -> Result<()> {
                Err(Error::filter(format!("instruction {}: {}", pc, what)))
            };

            match insn.class() {
                LD | LDX => {
                    let ok = match (insn.class(), insn.mode()) {
                        (LD, ABS) | (LD, IND) => matches!(insn.size(), W | H | B),
                        (_, IMM) | (_, LEN) => insn.size() == W,
                        (_, MEM) => {
                            if insn.k as usize >= MEMORY_WORDS {
                                return invalid("scratch memory index out of range");
                            }
                            insn.size() == W
                        }
                        (LDX, MSH) => insn.size() == B,
                        _ => false,
                    };
                    if !ok {
                        return invalid("unsupported load");
                    }
                }
                ST | STX => {
                    if insn.k as usize >= MEMORY_WORDS {
                        return invalid("scratch memory index out of range");
                    }
                }
                ALU => match insn.op() {
                    ADD | SUB | MUL | OR | AND | LSH | RSH | XOR | NEG => {}
                    DIV | MOD => {
                        if insn.src() == K && insn.k == 0 {
                            return invalid("division by zero");
                        }
                    }
                    _ => return invalid("unknown ALU operation"),
                },
                JMP => {
                    let remaining = len - pc - 1;
                    match insn.op() {
                        JA => {
                            if insn.k as usize >= remaining {
                                return invalid("jump out of range");
                            }
                        }
                        JEQ | JGT | JGE | JSET => {
                            if insn.jt as usize >= remaining || insn.jf as usize >= remaining {
                                return invalid("jump out of range");
                            }
                        }
                        _ => return invalid("unknown jump"),
                    }
                }
                RET => {
                    if !matches!(insn.code & 0x18, K | RET_A) {
                        return invalid("unknown return source");
                    }
                }
                MISC => {
                    if !matches!(insn.code & 0xf8, TAX | TXA) {
                        return invalid("unknown misc operation");
                    }
                }
                _ => unreachable!("class is masked to three bits"),
            }
        }

        match self.instructions.last() {
            Some(last) if last.class() == RET => Ok(()),
            _ => Err(Error::filter("program does not end with a return")),
        }
    }

    /// Execute the program against a frame
    ///
    /// Returns the number of bytes to keep; 0 drops the frame.
    pub fn run(&self, packet: &[u8]) -> u32 {
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut mem = [0u32; MEMORY_WORDS];
        let mut pc = 0usize;

        while let Some(insn) = self.instructions.get(pc) {
            pc += 1;
            let operand = if insn.src() == X { x } else { insn.k };

            match insn.class() {
                LD => {
                    a = match insn.mode() {
                        IMM => insn.k,
                        LEN => packet.len() as u32,
                        MEM => mem[insn.k as usize],
                        ABS | IND => {
                            let base = if insn.mode() == IND { x } else { 0 };
                            match load(packet, base.wrapping_add(insn.k), insn.size()) {
                                Some(v) => v,
                                None => return 0,
                            }
                        }
                        _ => return 0,
                    }
                }
                LDX => {
                    x = match insn.mode() {
                        IMM => insn.k,
                        LEN => packet.len() as u32,
                        MEM => mem[insn.k as usize],
                        MSH => match packet.get(insn.k as usize) {
                            Some(byte) => 4 * u32::from(byte & 0x0f),
                            None => return 0,
                        },
                        _ => return 0,
                    }
                }
                ST => mem[insn.k as usize] = a,
                STX => mem[insn.k as usize] = x,
                ALU => {
                    a = match insn.op() {
                        ADD => a.wrapping_add(operand),
                        SUB => a.wrapping_sub(operand),
                        MUL => a.wrapping_mul(operand),
                        DIV => match a.checked_div(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        MOD => match a.checked_rem(operand) {
                            Some(v) => v,
                            None => return 0,
                        },
                        OR => a | operand,
                        AND => a & operand,
                        XOR => a ^ operand,
                        LSH => a.checked_shl(operand).unwrap_or(0),
                        RSH => a.checked_shr(operand).unwrap_or(0),
                        NEG => a.wrapping_neg(),
                        _ => return 0,
                    }
                }
                JMP => {
                    let offset = match insn.op() {
                        JA => insn.k as usize,
                        JEQ => branch(a == operand, insn),
                        JGT => branch(a > operand, insn),
                        JGE => branch(a >= operand, insn),
                        JSET => branch((a & operand) != 0, insn),
                        _ => return 0,
                    };
                    pc += offset;
                }
                RET => {
                    return if insn.code & 0x18 == RET_A { a } else { insn.k };
                }
                MISC => {
                    if insn.code & 0xf8 == TXA {
                        a = x;
                    } else {
                        x = a;
                    }
                }
                _ => return 0,
            }
        }

        0
    }

    /// Whether the program accepts the frame
    pub fn matches(&self, packet: &[u8]) -> bool {
        self.run(packet) > 0
    }

    /// Instructions in the layout expected by `SO_ATTACH_FILTER`
    #[cfg(target_os = "linux")]
    pub fn to_sock_filters(&self) -> Vec<libc::sock_filter> {
        self.instructions
            .iter()
            .map(|insn| libc::sock_filter {
                code: insn.code,
                jt: insn.jt,
                jf: insn.jf,
                k: insn.k,
            })
            .collect()
    }
}

impl fmt::Display for BpfProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, insn) in self.instructions.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", insn)?;
        }
        Ok(())
    }
}

fn branch(taken: bool, insn: &BpfInstruction) -> usize {
    if taken {
        insn.jt as usize
    } else {
        insn.jf as usize
    }
}

fn load(packet: &[u8], offset: u32, size: u16) -> Option<u32> {
    let start = offset as usize;
    match size {
        W => packet
            .get(start..start.checked_add(4)?)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        H => packet
            .get(start..start.checked_add(2)?)
            .map(|b| u32::from(u16::from_be_bytes([b[0], b[1]]))),
        B => packet.get(start).map(|b| u32::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `icmp6[icmp6type]=icmp6-echo || icmp6[icmp6type]=icmp6-echoreply`, as
    /// emitted by `tcpdump -d` for Ethernet links
    fn icmp6_echo_program() -> BpfProgram {
        BpfProgram::new(vec![
            BpfInstruction::load_half(12),
            BpfInstruction::jump_eq(0x86dd, 0, 6),
            BpfInstruction::load_byte(20),
            BpfInstruction::jump_eq(0x3a, 0, 4),
            BpfInstruction::load_byte(54),
            BpfInstruction::jump_eq(0x80, 1, 0),
            BpfInstruction::jump_eq(0x81, 0, 1),
            BpfInstruction::ret(1600),
            BpfInstruction::ret(0),
        ])
        .unwrap()
    }

    fn ipv6_frame(next_header: u8, icmp_type: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 62];
        frame[12] = 0x86;
        frame[13] = 0xdd;
        frame[14] = 0x60;
        frame[20] = next_header;
        frame[54] = icmp_type;
        frame
    }

    #[test]
    fn test_echo_request_and_reply_accepted() {
        let program = icmp6_echo_program();
        assert_eq!(program.run(&ipv6_frame(58, 128)), 1600);
        assert_eq!(program.run(&ipv6_frame(58, 129)), 1600);
    }

    #[test]
    fn test_other_traffic_dropped() {
        let program = icmp6_echo_program();
        assert_eq!(program.run(&ipv6_frame(58, 135)), 0);
        assert_eq!(program.run(&ipv6_frame(17, 128)), 0);

        let mut ipv4 = ipv6_frame(58, 128);
        ipv4[12] = 0x08;
        ipv4[13] = 0x00;
        assert!(!program.matches(&ipv4));
    }

    #[test]
    fn test_out_of_bounds_load_drops() {
        let program = icmp6_echo_program();
        assert_eq!(program.run(&ipv6_frame(58, 128)[..40]), 0);
        assert_eq!(program.run(&[]), 0);
    }

    #[test]
    fn test_indirect_load_with_msh() {
        // IPv4 TCP destination port 80, via the IP header length in X
        let program = BpfProgram::new(vec![
            BpfInstruction::new(LDX | B | MSH, 0, 0, 14),
            BpfInstruction::new(LD | H | IND, 0, 0, 16),
            BpfInstruction::jump_eq(80, 0, 1),
            BpfInstruction::ret(u32::MAX),
            BpfInstruction::ret(0),
        ])
        .unwrap();

        let mut frame = vec![0u8; 54];
        frame[14] = 0x45;
        frame[36] = 0;
        frame[37] = 80;
        assert!(program.matches(&frame));

        frame[37] = 81;
        assert!(!program.matches(&frame));
    }

    #[test]
    fn test_alu_scratch_and_return_a() {
        let program = BpfProgram::new(vec![
            BpfInstruction::new(LD | W | LEN, 0, 0, 0),
            BpfInstruction::new(ST, 0, 0, 3),
            BpfInstruction::new(LDX | W | MEM, 0, 0, 3),
            BpfInstruction::new(ALU | MUL | K, 0, 0, 2),
            BpfInstruction::new(ALU | SUB | X, 0, 0, 0),
            BpfInstruction::new(MISC | TAX, 0, 0, 0),
            BpfInstruction::new(MISC | TXA, 0, 0, 0),
            BpfInstruction::new(RET | RET_A, 0, 0, 0),
        ])
        .unwrap();
        assert_eq!(program.run(&[0u8; 10]), 10);
    }

    #[test]
    fn test_runtime_division_by_zero_drops() {
        let program = BpfProgram::new(vec![
            BpfInstruction::new(LD | IMM, 0, 0, 10),
            BpfInstruction::new(LDX | IMM, 0, 0, 0),
            BpfInstruction::new(ALU | DIV | X, 0, 0, 0),
            BpfInstruction::ret(1),
        ])
        .unwrap();
        assert_eq!(program.run(&[1, 2, 3]), 0);
    }

    #[test]
    fn test_validation_rejects_bad_programs() {
        assert!(BpfProgram::new(vec![]).is_err());
        assert!(BpfProgram::new(vec![BpfInstruction::load_byte(0)]).is_err());
        assert!(BpfProgram::new(vec![BpfInstruction::jump_eq(1, 5, 0), BpfInstruction::ret(0)]).is_err());
        assert!(BpfProgram::new(vec![
            BpfInstruction::new(ALU | DIV | K, 0, 0, 0),
            BpfInstruction::ret(0)
        ])
        .is_err());
        assert!(BpfProgram::new(vec![BpfInstruction::new(ST, 0, 0, 16), BpfInstruction::ret(0)]).is_err());
        assert!(BpfProgram::new(vec![BpfInstruction::ret(1); MAX_INSTRUCTIONS + 1]).is_err());
    }

    #[test]
    fn test_parse_display_round_trip_of_line() {
        let insn = BpfInstruction::parse("21 0 6 34525").unwrap();
        assert_eq!(insn, BpfInstruction::jump_eq(0x86dd, 0, 6));
        assert_eq!(insn.to_string(), "21 0 6 34525");
        assert!(BpfInstruction::parse("21 0 6").is_err());
        assert!(BpfInstruction::parse("a b c d").is_err());
    }

    #[test]
    fn test_clamp_snaplen() {
        let mut program = BpfProgram::accept_all(262144);
        program.clamp_snaplen(1600);
        assert_eq!(program.run(&[0u8; 2000]), 1600);
    }

    #[test]
    fn test_compile_expression_matches_frames() {
        let program = BpfProgram::compile(
            "icmp6[icmp6type]=icmp6-echo || icmp6[icmp6type]=icmp6-echoreply",
            1600,
        )
        .unwrap();
        assert_eq!(program.run(&ipv6_frame(58, 128)), 1600);
        assert_eq!(program.run(&ipv6_frame(58, 129)), 1600);
        assert_eq!(program.run(&ipv6_frame(58, 135)), 0);
    }

    #[test]
    fn test_compile_rejects_syntax_errors() {
        let err = BpfProgram::compile("icmp6 and and", 1600).unwrap_err();
        assert!(matches!(err, Error::Filter(_)));
    }
}
