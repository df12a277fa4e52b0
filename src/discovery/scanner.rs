//! Directory scanner: turns the discovery directory into a snapshot.
//!
//! A scan lists the directory once and probes every entry. Plugins start and
//! stop while this happens; a scan is a best-effort snapshot, not a
//! transaction. Entries that vanish between listing and probing are dropped
//! silently. Entries that exist but cannot be used are kept aside in
//! [`Snapshot::invalid`] so a caller can tell "misconfigured" from "absent".

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::PROBE_TIMEOUT;
use crate::plugin::{DiscoveryError, Endpoint, PluginName, Result, Unusable};
use crate::probe::{probe, Probe};

/// Result of one directory scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Live plugins keyed by socket file name.
    pub endpoints: BTreeMap<String, Endpoint>,
    /// Entries present at scan time that cannot serve as endpoints.
    pub invalid: BTreeMap<String, Unusable>,
}

impl Snapshot {
    /// Whether the scan found no live plugins.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Reads one discovery directory. Holds no state between scans.
#[derive(Debug, Clone)]
pub struct Scanner {
    dir: PathBuf,
    probe_timeout: Duration,
}

impl Scanner {
    /// Scanner for `dir` using the default probe budget.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Override the per-entry probe budget.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// The scanned directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Per-entry probe budget.
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// List and classify every entry in the directory.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Io`] if the directory itself cannot be read.
    pub fn scan_once(&self) -> Result<Snapshot> {
        let entries = fs::read_dir(&self.dir).map_err(|e| DiscoveryError::io(&self.dir, e))?;
        let mut snapshot = Snapshot::default();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("Skipping unreadable entry in {}: {e}", self.dir.display());
                    continue;
                }
            };

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                log::debug!("Skipping non-UTF-8 entry {:?}", entry.path());
                continue;
            };
            // A file name never contains the separator, but it may still be
            // something no caller could look up (".", NUL, ...).
            let Ok(name) = PluginName::parse(file_name) else {
                log::debug!("Skipping entry {file_name:?}: not a valid plugin name");
                continue;
            };

            let path = entry.path();
            match probe(&path, self.probe_timeout) {
                Probe::Live => {
                    snapshot
                        .endpoints
                        .insert(file_name.to_string(), Endpoint::new(name, path));
                }
                Probe::Absent => {
                    log::debug!("{} vanished during scan", path.display());
                }
                Probe::Unusable(reason) => {
                    log::debug!("{} is not usable: {reason}", path.display());
                    snapshot.invalid.insert(file_name.to_string(), reason);
                }
            }
        }

        Ok(snapshot)
    }
}
