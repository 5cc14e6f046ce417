//! Persisted network state and bulk cleanup
//!
//! Every emulated network leaves a directory below a state root:
//!
//! ```text
//! <root>/<network>/nodes/<node>/
//! ```
//!
//! The directories let a later process find networks that were not torn
//! down cleanly (crashed test runs) and remove them together with the named
//! network namespaces of their nodes.

use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Default state root
pub const DEFAULT_STATE_DIR: &str = "/var/run/nstap";

/// Default location of named network namespaces (as used by `ip netns`)
pub const DEFAULT_NETNS_DIR: &str = "/run/netns";

/// Prefix of the named namespaces created for emulated nodes
pub const NETNS_PREFIX: &str = "nstap";

const NAME_ATTEMPTS: usize = 32;

const NAMES: &[&str] = &[
    "acorn", "amber", "anvil", "aspen", "badger", "basil", "beacon", "birch", "bison", "cedar",
    "cobalt", "comet", "coral", "crane", "delta", "dune", "ember", "falcon", "fern", "fjord",
    "flint", "gecko", "glade", "granite", "harbor", "hazel", "heron", "indigo", "iris", "jade",
    "juniper", "kestrel", "lagoon", "lark", "lotus", "lynx", "maple", "marble", "meadow", "mesa",
    "moss", "nebula", "nectar", "oak", "onyx", "orchid", "otter", "pebble", "pine", "plume",
    "quartz", "raven", "reef", "ridge", "sable", "sage", "spruce", "summit", "thistle", "tundra",
    "umber", "valley", "willow", "wren", "yarrow", "zephyr",
];

/// Removes the OS namespace belonging to one node
pub trait NamespaceRemover: Send + Sync {
    /// Remove the named namespace. An already absent namespace is success.
    fn remove(&self, name: &str) -> io::Result<()>;

    /// Remove a network's state directory once its namespaces are gone
    fn remove_state_dir(&self, dir: &Path) -> io::Result<()> {
        fs::remove_dir_all(dir)
    }
}

/// Named namespaces bind-mounted into a directory (`ip netns` layout)
#[derive(Debug, Clone)]
pub struct NetnsDir {
    dir: PathBuf,
}

impl NetnsDir {
    /// Namespaces below `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the namespace file for `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Default for NetnsDir {
    fn default() -> Self {
        Self::new(DEFAULT_NETNS_DIR)
    }
}

impl NamespaceRemover for NetnsDir {
    fn remove(&self, name: &str) -> io::Result<()> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;

            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
            let rc = unsafe { libc::umount2(c_path.as_ptr(), libc::MNT_DETACH) };
            if rc != 0 {
                // Not mounted is fine, the file is unlinked below
                debug!(
                    path = %path.display(),
                    error = %io::Error::last_os_error(),
                    "namespace was not mounted"
                );
            }
        }

        match fs::remove_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Root directory of persisted network state
pub struct StateRoot {
    root: PathBuf,
    namespaces: Box<dyn NamespaceRemover>,
}

impl StateRoot {
    /// State below `root`, namespaces in the default `ip netns` directory
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_remover(root, NetnsDir::default())
    }

    /// State below `root` with a custom namespace remover
    pub fn with_remover<P: AsRef<Path>, R: NamespaceRemover + 'static>(root: P, remover: R) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            namespaces: Box::new(remover),
        }
    }

    /// Root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory of one network
    pub fn network_dir(&self, network: &str) -> PathBuf {
        self.root.join(network)
    }

    /// Directory holding the node directories of one network
    pub fn nodes_dir(&self, network: &str) -> PathBuf {
        self.network_dir(network).join("nodes")
    }

    /// Name of the OS namespace of a node
    pub fn namespace_name(network: &str, node: &str) -> String {
        format!("{}-{}-{}", NETNS_PREFIX, network, node)
    }

    /// Create the state directory of a network
    pub fn create_network(&self, network: &str) -> Result<PathBuf> {
        let dir = self.nodes_dir(network);
        fs::create_dir_all(&dir)?;
        debug!(network, path = %dir.display(), "created network state");
        Ok(self.network_dir(network))
    }

    /// Create the state directory of a node
    pub fn create_node(&self, network: &str, node: &str) -> Result<PathBuf> {
        let dir = self.nodes_dir(network).join(node);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Names of all networks with persisted state, sorted
    pub fn network_names(&self) -> Vec<String> {
        list_dirs(&self.root)
    }

    /// Names of the nodes of a network, sorted
    pub fn node_names(&self, network: &str) -> Vec<String> {
        list_dirs(&self.nodes_dir(network))
    }

    /// Pick a network name that is not in use yet
    pub fn generate_network_name(&self) -> String {
        let existing = self.network_names();
        let mut rng = rand::thread_rng();

        for _ in 0..NAME_ATTEMPTS {
            let Some(candidate) = NAMES.choose(&mut rng) else {
                break;
            };
            if existing.binary_search_by(|n| n.as_str().cmp(candidate)).is_err() {
                return candidate.to_string();
            }
        }

        let base = NAMES.choose(&mut rng).copied().unwrap_or("net");
        format!("{}{}", base, rng.gen_range(1..=128))
    }

    /// Remove one network: node namespaces first, then the state directory
    ///
    /// Namespace removal is best-effort; failing to remove the state
    /// directory is returned.
    pub fn cleanup_network(&self, network: &str) -> Result<()> {
        let dir = self.network_dir(network);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("network '{}'", network)));
        }

        for node in self.node_names(network) {
            let ns = Self::namespace_name(network, &node);
            if let Err(e) = self.namespaces.remove(&ns) {
                warn!(network, node = %node, namespace = %ns, error = %e, "failed to remove namespace");
            }
        }

        self.namespaces.remove_state_dir(&dir).map_err(|source| Error::Cleanup {
            path: dir.clone(),
            source,
        })?;

        info!(network, "removed network state");
        Ok(())
    }

    /// Remove every network, continuing past failures
    ///
    /// Returns the first error after all networks were attempted.
    pub fn cleanup_all(&self) -> Result<()> {
        let mut first_error = None;

        for network in self.network_names() {
            if let Err(e) = self.cleanup_network(&network) {
                warn!(network = %network, error = %e, "cleanup failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn list_dirs(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
