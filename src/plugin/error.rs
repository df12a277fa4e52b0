//! Error kinds for plugin discovery and socket lifecycle.
//!
//! Callers branch on these: a plugin that has not started yet
//! ([`DiscoveryError::NotFound`]) is handled differently from a deployment
//! that left something unusable at the plugin's path
//! ([`DiscoveryError::NotASocket`]). Classification is therefore kept typed
//! all the way up, and the free predicates below also work through an
//! `anyhow::Error` or any other error chain.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for discovery operations.
pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;

/// What sits at a path when it is not a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symlink whose target could not be followed.
    Symlink,
    /// FIFO, device node, or anything else.
    Other,
}

impl FileKind {
    /// Classify a file type that is known not to be a socket.
    pub fn of(file_type: std::fs::FileType) -> Self {
        if file_type.is_file() {
            Self::File
        } else if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_symlink() {
            Self::Symlink
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "regular file"),
            Self::Directory => write!(f, "directory"),
            Self::Symlink => write!(f, "dangling symlink"),
            Self::Other => write!(f, "special file"),
        }
    }
}

/// Why an entry that exists cannot be used as a plugin endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unusable {
    /// The entry is not a Unix domain socket at all.
    NotSocket(FileKind),
    /// A socket file nobody is listening on (owner exited without cleanup).
    Stale,
    /// The entry could not be inspected or connected to.
    PermissionDenied,
    /// The connect probe did not complete within its budget.
    TimedOut,
    /// Connecting failed for another reason.
    Unreachable(String),
}

impl fmt::Display for Unusable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSocket(kind) => write!(f, "{kind}, not a socket"),
            Self::Stale => write!(f, "stale socket, no listener"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::TimedOut => write!(f, "connect probe timed out"),
            Self::Unreachable(msg) => write!(f, "unreachable: {msg}"),
        }
    }
}

/// Errors from naming, discovery and listener lifecycle.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The plugin name is malformed. Never worth retrying.
    #[error("invalid plugin name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Nothing exists at the plugin's path.
    #[error("plugin {name} not found at {}", .path.display())]
    NotFound {
        /// Name that was looked up.
        name: String,
        /// Derived socket path.
        path: PathBuf,
    },

    /// Something exists at the path but it cannot be used as an endpoint.
    #[error("{} is not a usable socket: {reason}", .path.display())]
    NotASocket {
        /// Offending path.
        path: PathBuf,
        /// Classification of the entry.
        reason: Unusable,
    },

    /// A live listener already owns the path.
    #[error("socket {} is already in use by a running plugin", .path.display())]
    AlreadyInUse {
        /// Contested path.
        path: PathBuf,
    },

    /// The socket path does not fit in `sockaddr_un`.
    #[error("socket path too long ({len} bytes, max {max}): {}", .path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Underlying filesystem or socket failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// The OS error.
        #[source]
        source: io::Error,
    },
}

impl DiscoveryError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for [`DiscoveryError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// `true` for [`DiscoveryError::NotASocket`].
    pub fn is_not_a_socket(&self) -> bool {
        matches!(self, Self::NotASocket { .. })
    }

    /// `true` for [`DiscoveryError::AlreadyInUse`].
    pub fn is_already_in_use(&self) -> bool {
        matches!(self, Self::AlreadyInUse { .. })
    }

    /// `true` for [`DiscoveryError::InvalidName`].
    pub fn is_invalid_name(&self) -> bool {
        matches!(self, Self::InvalidName { .. })
    }
}

/// Find the first [`DiscoveryError`] in an error's source chain.
pub fn find_discovery_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a DiscoveryError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<DiscoveryError>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// `true` if the error chain contains a [`DiscoveryError::NotFound`].
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    find_discovery_error(err).is_some_and(DiscoveryError::is_not_found)
}

/// `true` if the error chain contains a [`DiscoveryError::NotASocket`].
pub fn is_not_a_socket(err: &(dyn StdError + 'static)) -> bool {
    find_discovery_error(err).is_some_and(DiscoveryError::is_not_a_socket)
}
