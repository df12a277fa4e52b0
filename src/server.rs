//! Plugin-side socket lifecycle: publish a listener, serve it, retract it.
//!
//! A plugin becomes discoverable the moment its socket file appears in the
//! discovery directory, and stops being discoverable when the file is gone.
//! [`PluginServer`] owns that file for the lifetime of the listener.
//!
//! # Stale sockets
//!
//! Processes that crash leave their socket file behind. Starting at such a
//! path probes it first: a refused connection means nobody is listening, so
//! the leftover file is removed and the path is reused. A live listener is
//! never displaced.
//!
//! ```text
//! existing entry      probe              action
//! ──────────────      ─────              ──────
//! none                -                  bind
//! socket              connect ok         AlreadyInUse
//! socket              timed out          AlreadyInUse
//! socket              refused (stale)    remove, bind
//! file/dir/denied     -                  NotASocket
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::constants::{ACCEPT_RETRY_DELAY, DEFAULT_SOCKET_MODE, MAX_SOCKET_PATH, PROBE_TIMEOUT};
use crate::plugin::{DiscoveryError, Result, Unusable};
use crate::probe::{probe, Probe};

/// Serves connections accepted on a plugin's socket.
///
/// Each accepted stream is handed to [`handle`](Self::handle) on its own
/// task. What travels over the stream is up to the plugin.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one client connection until it is done.
    async fn handle(&self, stream: UnixStream, conn_id: String);
}

/// Options for [`PluginServer::start_at_path_with`].
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Budget for probing an existing entry at the path.
    pub probe_timeout: Duration,
    /// Mode applied to the socket file after binding.
    pub socket_mode: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            socket_mode: DEFAULT_SOCKET_MODE,
        }
    }
}

/// A running plugin listener bound to one socket path.
///
/// Dropping the server stops it.
#[derive(Debug)]
pub struct PluginServer {
    socket_path: PathBuf,
    /// Device and inode of the file we bound, so we never remove a file
    /// some other process created at the same path.
    identity: (u64, u64),
    accept_handle: Option<JoinHandle<()>>,
}

impl PluginServer {
    /// Bind a listener at `path` with default options and start serving.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::AlreadyInUse`] if a live plugin owns the path
    /// - [`DiscoveryError::NotASocket`] if a non-socket entry is in the way
    /// - [`DiscoveryError::PathTooLong`] if the path exceeds the socket limit
    /// - [`DiscoveryError::Io`] for bind or filesystem failures
    pub fn start_at_path<H: ConnectionHandler>(path: impl Into<PathBuf>, handler: H) -> Result<Self> {
        Self::start_at_path_with(path, handler, ServerOptions::default())
    }

    /// Bind a listener at `path` and start serving.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_at_path_with<H: ConnectionHandler>(
        path: impl Into<PathBuf>,
        handler: H,
        options: ServerOptions,
    ) -> Result<Self> {
        let socket_path = path.into();

        let len = socket_path.as_os_str().len();
        if len >= MAX_SOCKET_PATH {
            return Err(DiscoveryError::PathTooLong {
                path: socket_path,
                len,
                max: MAX_SOCKET_PATH - 1,
            });
        }

        clear_stale_entry(&socket_path, options.probe_timeout)?;

        let listener = match std::os::unix::net::UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            // Another process bound between our probe and our bind.
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                return Err(DiscoveryError::AlreadyInUse { path: socket_path });
            }
            Err(e) => return Err(DiscoveryError::io(socket_path, e)),
        };

        fs::set_permissions(&socket_path, fs::Permissions::from_mode(options.socket_mode))
            .map_err(|e| DiscoveryError::io(&socket_path, e))?;
        let meta = fs::symlink_metadata(&socket_path).map_err(|e| DiscoveryError::io(&socket_path, e))?;

        listener
            .set_nonblocking(true)
            .map_err(|e| DiscoveryError::io(&socket_path, e))?;
        let listener = UnixListener::from_std(listener).map_err(|e| DiscoveryError::io(&socket_path, e))?;

        log::info!("Plugin listening on {}", socket_path.display());

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::new(handler),
            socket_path.clone(),
        ));

        Ok(Self {
            socket_path,
            identity: (meta.dev(), meta.ino()),
            accept_handle: Some(accept_handle),
        })
    }

    /// Accept loop, run as a tokio task.
    ///
    /// Connection tasks live in a `JoinSet` owned by this loop, so aborting
    /// the loop tears them down too.
    async fn accept_loop<H: ConnectionHandler>(listener: UnixListener, handler: Arc<H>, socket_path: PathBuf) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn_id = generate_conn_id();
                        log::debug!("[{}] connection {}", socket_path.display(), conn_id);
                        let handler = Arc::clone(&handler);
                        connections.spawn(async move { handler.handle(stream, conn_id).await });
                    }
                    Err(e) => {
                        if !socket_path.exists() {
                            log::info!("Socket {} removed, stopping accept loop", socket_path.display());
                            break;
                        }
                        log::error!("[{}] accept error: {e}", socket_path.display());
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Stop serving and remove the socket file.
    ///
    /// The file is unlinked while the listener is still open, so a concurrent
    /// lookup sees either a live plugin or nothing, never a stale socket.
    /// Idempotent: stopping twice, or after the file was already removed by
    /// someone else, is not an error.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.accept_handle.take() else {
            return Ok(());
        };
        let removed = self.remove_socket_file();
        handle.abort();
        removed
    }

    fn remove_socket_file(&self) -> Result<()> {
        match fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if (meta.dev(), meta.ino()) == self.identity => {
                match fs::remove_file(&self.socket_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(DiscoveryError::io(&self.socket_path, e)),
                }
                log::info!("Plugin stopped, removed {}", self.socket_path.display());
            }
            Ok(_) => {
                log::debug!(
                    "Socket {} was replaced by another process, leaving it in place",
                    self.socket_path.display()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Socket {} already gone", self.socket_path.display());
            }
            Err(e) => return Err(DiscoveryError::io(&self.socket_path, e)),
        }
        Ok(())
    }

    /// Whether the listener is still being served.
    pub fn is_running(&self) -> bool {
        self.accept_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop plugin at {}: {e}", self.socket_path.display());
        }
    }
}

/// Make `path` free for binding, removing a stale socket if one is there.
fn clear_stale_entry(path: &Path, probe_timeout: Duration) -> Result<()> {
    // Remember which file we probed so a socket created by a racing
    // process after our probe is not mistaken for the stale one.
    let probed = fs::symlink_metadata(path).ok().map(|m| (m.dev(), m.ino()));

    match probe(path, probe_timeout) {
        Probe::Absent => Ok(()),
        Probe::Live | Probe::Unusable(Unusable::TimedOut) => Err(DiscoveryError::AlreadyInUse {
            path: path.to_path_buf(),
        }),
        Probe::Unusable(Unusable::Stale) => {
            let current = fs::symlink_metadata(path).ok().map(|m| (m.dev(), m.ino()));
            if current.is_some() && current != probed {
                return Err(DiscoveryError::AlreadyInUse {
                    path: path.to_path_buf(),
                });
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    log::info!("Removed stale socket {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DiscoveryError::io(path, e)),
            }
        }
        Probe::Unusable(reason) => Err(DiscoveryError::NotASocket {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// Generate a connection ID using a monotonic counter + random suffix.
fn generate_conn_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("conn:{seq:x}{rand:04x}")
}
