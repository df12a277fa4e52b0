//! Change notifications for a discovery directory.
//!
//! Wraps a `notify` watcher (inotify on Linux, kqueue on macOS) around the
//! directory so callers learn about plugins coming and going without
//! hammering it with scans. Notifications only decide *when* to rescan; what
//! changed is always computed by diffing two full scans, and a poll tick
//! forces a rescan even if no event arrived. If the OS watcher cannot be
//! created the watcher degrades to pure polling with identical results.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use super::DirDiscovery;
use crate::plugin::{Endpoint, Result};

/// One observed difference between two scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A plugin became reachable.
    Appeared(Endpoint),
    /// A previously reachable plugin is gone or unusable.
    Vanished(String),
}

/// Watches a discovery directory and reports plugin arrivals and departures.
pub struct DirWatcher {
    discovery: DirDiscovery,
    poll_interval: Duration,
    last: BTreeMap<String, Endpoint>,
    /// Kept alive for the event stream; `None` when running in polling mode.
    _watcher: Option<RecommendedWatcher>,
    rx: Option<mpsc::Receiver<notify::Result<Event>>>,
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher")
            .field("dir", &self.discovery.dir())
            .field("poll_interval", &self.poll_interval)
            .field("notify", &self.rx.is_some())
            .finish_non_exhaustive()
    }
}

impl DirWatcher {
    /// Start watching the directory behind `discovery`.
    ///
    /// The current contents become the baseline; only later differences are
    /// reported.
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline scan fails.
    pub fn new(discovery: DirDiscovery, poll_interval: Duration) -> Result<Self> {
        let (watcher, rx) = match Self::start_notify(&discovery) {
            Ok((watcher, rx)) => (Some(watcher), Some(rx)),
            Err(e) => {
                log::warn!(
                    "Directory notifications unavailable for {}, polling every {:?}: {e}",
                    discovery.dir().display(),
                    poll_interval
                );
                (None, None)
            }
        };

        let last = discovery.list()?;
        Ok(Self {
            discovery,
            poll_interval,
            last,
            _watcher: watcher,
            rx,
        })
    }

    /// Watcher that never uses OS notifications.
    pub fn polling(discovery: DirDiscovery, poll_interval: Duration) -> Result<Self> {
        let last = discovery.list()?;
        Ok(Self {
            discovery,
            poll_interval,
            last,
            _watcher: None,
            rx: None,
        })
    }

    fn start_notify(
        discovery: &DirDiscovery,
    ) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<notify::Result<Event>>)> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(discovery.dir(), RecursiveMode::NonRecursive)?;
        log::debug!("Watching {} for plugin changes", discovery.dir().display());
        Ok((watcher, rx))
    }

    /// Whether OS notifications are in use.
    pub fn uses_notifications(&self) -> bool {
        self.rx.is_some()
    }

    /// Plugins seen by the most recent scan.
    pub fn current(&self) -> &BTreeMap<String, Endpoint> {
        &self.last
    }

    /// Block until the set of reachable plugins changes or `timeout` passes.
    ///
    /// Returns an empty list on timeout.
    pub fn next_changes(&mut self, timeout: Duration) -> Result<Vec<Change>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            self.wait_for_trigger(self.poll_interval.min(deadline - now));

            let changes = self.rescan()?;
            if !changes.is_empty() {
                return Ok(changes);
            }
        }
    }

    /// Rescan right away and report differences from the previous scan.
    pub fn rescan(&mut self) -> Result<Vec<Change>> {
        let next = self.discovery.list()?;
        let changes = diff(&self.last, &next);
        self.last = next;
        Ok(changes)
    }

    /// Wait for a filesystem event or `wait`, whichever comes first, then
    /// drain any queued events so one burst causes one rescan.
    fn wait_for_trigger(&self, wait: Duration) {
        let Some(rx) = &self.rx else {
            std::thread::sleep(wait);
            return;
        };

        match rx.recv_timeout(wait) {
            Ok(Err(e)) => log::warn!("Directory watcher error: {e}"),
            Ok(Ok(_)) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
        }
        while rx.try_recv().is_ok() {}
    }
}

/// Changes that turn `before` into `after`.
fn diff(before: &BTreeMap<String, Endpoint>, after: &BTreeMap<String, Endpoint>) -> Vec<Change> {
    let vanished = before
        .keys()
        .filter(|name| !after.contains_key(*name))
        .map(|name| Change::Vanished(name.clone()));
    let appeared = after
        .iter()
        .filter(|(name, _)| !before.contains_key(*name))
        .map(|(_, endpoint)| Change::Appeared(endpoint.clone()));
    vanished.chain(appeared).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginName;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(
            PluginName::parse(name).unwrap(),
            PathBuf::from("/run/plugins").join(name),
        )
    }

    #[test]
    fn test_diff_reports_both_directions() {
        let before: BTreeMap<_, _> = [("a".to_string(), endpoint("a")), ("b".to_string(), endpoint("b"))].into();
        let after: BTreeMap<_, _> = [("b".to_string(), endpoint("b")), ("c".to_string(), endpoint("c"))].into();

        assert_eq!(
            diff(&before, &after),
            vec![Change::Vanished("a".to_string()), Change::Appeared(endpoint("c"))]
        );
    }

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let map: BTreeMap<_, _> = [("a".to_string(), endpoint("a"))].into();
        assert!(diff(&map, &map).is_empty());
    }

    #[test]
    fn test_polling_watcher_sees_appear_and_vanish() {
        let tmp = tempfile::TempDir::new().unwrap();
        let discovery = DirDiscovery::new(tmp.path()).unwrap();
        let mut watcher = DirWatcher::polling(discovery, Duration::from_millis(10)).unwrap();
        assert!(!watcher.uses_notifications());

        let path = tmp.path().join("group");
        let listener = UnixListener::bind(&path).unwrap();
        let changes = watcher.next_changes(Duration::from_secs(2)).unwrap();
        assert!(matches!(&changes[..], [Change::Appeared(e)] if e.name().as_str() == "group"));

        drop(listener);
        std::fs::remove_file(&path).unwrap();
        let changes = watcher.next_changes(Duration::from_secs(2)).unwrap();
        assert_eq!(changes, vec![Change::Vanished("group".to_string())]);
    }

    #[test]
    fn test_next_changes_times_out_quietly() {
        let tmp = tempfile::TempDir::new().unwrap();
        let discovery = DirDiscovery::new(tmp.path()).unwrap();
        let mut watcher = DirWatcher::new(discovery, Duration::from_millis(10)).unwrap();

        assert!(watcher.next_changes(Duration::from_millis(30)).unwrap().is_empty());
    }
}
