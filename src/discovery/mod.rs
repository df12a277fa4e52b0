//! Name-based plugin discovery over a directory of Unix sockets.
//!
//! Every plugin binds a socket named after itself inside one shared
//! directory. [`DirDiscovery`] answers "is plugin X up, and where?" by looking
//! at that directory directly. There is no daemon, no cache and no lock: each
//! call reads the filesystem afresh and connect-probes what it finds.
//!
//! # Example
//!
//! ```no_run
//! use plugdir::discovery::DirDiscovery;
//!
//! # fn main() -> anyhow::Result<()> {
//! let discovery = DirDiscovery::new("/run/plugins")?;
//! match discovery.find("group") {
//!     Ok(endpoint) => println!("group at {}", endpoint.address()),
//!     Err(e) if e.is_not_found() => println!("group has not started yet"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod scanner;
pub mod watch;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

pub use scanner::{Scanner, Snapshot};
pub use watch::{Change, DirWatcher};

use crate::config::Config;
use crate::constants::POLL_INTERVAL;
use crate::plugin::{DiscoveryError, Endpoint, PluginName, Result};
use crate::probe::{probe, Probe};

/// Resolves plugin names to endpoints.
///
/// Implemented by [`DirDiscovery`]; callers that only need lookups can take
/// a `&dyn Discovery` and be tested against a fake.
pub trait Discovery: Send + Sync {
    /// Resolve one plugin by name.
    fn find(&self, name: &str) -> Result<Endpoint>;

    /// All plugins currently reachable, keyed by lookup name.
    fn list(&self) -> Result<BTreeMap<String, Endpoint>>;
}

/// Discovery backed by one directory of plugin sockets.
#[derive(Debug, Clone)]
pub struct DirDiscovery {
    scanner: Scanner,
    poll_interval: Duration,
}

impl DirDiscovery {
    /// Discovery over `dir`, which must already exist.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Io`] if `dir` is missing or not a directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let meta = fs::metadata(&dir).map_err(|e| DiscoveryError::io(&dir, e))?;
        if !meta.is_dir() {
            return Err(DiscoveryError::io(
                &dir,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        Ok(Self {
            scanner: Scanner::new(dir),
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Discovery configured from [`Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(&config.plugins_dir)?
            .with_probe_timeout(config.probe_timeout())
            .with_poll_interval(config.poll_interval()))
    }

    /// Override the per-socket probe budget.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.scanner = self.scanner.with_probe_timeout(timeout);
        self
    }

    /// Override the interval used by [`wait_for`](Self::wait_for) and
    /// [`wait_gone`](Self::wait_gone).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The discovery directory.
    pub fn dir(&self) -> &Path {
        self.scanner.dir()
    }

    /// Poll interval for the wait helpers.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resolve `name` against the directory as it is right now.
    ///
    /// Only the lookup part selects the socket; a subtype is carried through
    /// on the returned endpoint.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::InvalidName`] for malformed names
    /// - [`DiscoveryError::NotFound`] when nothing is at the derived path
    /// - [`DiscoveryError::NotASocket`] when something unusable is there
    pub fn find(&self, name: &str) -> Result<Endpoint> {
        let name = PluginName::parse(name)?;
        let path = name.path_in(self.dir());

        match probe(&path, self.scanner.probe_timeout()) {
            Probe::Live => Ok(Endpoint::new(name, path)),
            Probe::Absent => Err(DiscoveryError::NotFound {
                name: name.to_string(),
                path,
            }),
            Probe::Unusable(reason) => Err(DiscoveryError::NotASocket { path, reason }),
        }
    }

    /// Every reachable plugin, keyed by lookup name.
    ///
    /// The map is a snapshot; plugins may come and go right after it is
    /// built. An empty directory gives an empty map.
    pub fn list(&self) -> Result<BTreeMap<String, Endpoint>> {
        Ok(self.scanner.scan_once()?.endpoints)
    }

    /// Full scan including entries that are present but unusable.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.scanner.scan_once()
    }

    /// Poll until `name` resolves or `timeout` passes.
    ///
    /// Returns the last lookup error on timeout. Invalid names fail
    /// immediately.
    pub fn wait_for(&self, name: &str, timeout: Duration) -> Result<Endpoint> {
        let deadline = Instant::now() + timeout;
        loop {
            let err = match self.find(name) {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) if e.is_invalid_name() => return Err(e),
                Err(e) => e,
            };
            if !self.sleep_until_next_poll(deadline) {
                return Err(err);
            }
        }
    }

    /// Poll until `name` no longer resolves, or `timeout` passes.
    ///
    /// Returns `true` once the lookup reports NotFound.
    pub fn wait_gone(&self, name: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(name) {
                Err(e) if e.is_not_found() => return Ok(true),
                Err(e) if e.is_invalid_name() => return Err(e),
                _ => {}
            }
            if !self.sleep_until_next_poll(deadline) {
                return Ok(false);
            }
        }
    }

    /// Sleep one poll interval, clamped to the deadline. `false` once the
    /// deadline has passed.
    fn sleep_until_next_poll(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(self.poll_interval.min(deadline - now));
        true
    }
}

impl Discovery for DirDiscovery {
    fn find(&self, name: &str) -> Result<Endpoint> {
        DirDiscovery::find(self, name)
    }

    fn list(&self) -> Result<BTreeMap<String, Endpoint>> {
        DirDiscovery::list(self)
    }
}
