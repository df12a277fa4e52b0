//! Bounded-time liveness probe for a single socket path.
//!
//! The filesystem keeps socket files around after their owner dies, so the
//! only way to tell a live plugin from a stale file is to connect. The probe
//! connects with a non-blocking socket and a deadline so one hung or
//! overloaded peer cannot stall a directory scan.
//!
//! # Outcomes
//!
//! | Observation                         | [`Probe`]                            |
//! |-------------------------------------|--------------------------------------|
//! | no entry (or vanished mid-probe)    | `Absent`                             |
//! | socket accepting connections        | `Live`                               |
//! | socket, connection refused          | `Unusable(Stale)`                    |
//! | regular file, directory, ...        | `Unusable(NotSocket(kind))`          |
//! | `EACCES` / `EPERM`                  | `Unusable(PermissionDenied)`         |
//! | deadline passed                     | `Unusable(TimedOut)`                 |

use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::constants::PROBE_RETRY_DELAY;
use crate::plugin::{FileKind, Unusable};

/// Result of probing one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Nothing at the path.
    Absent,
    /// A listener accepted the connection.
    Live,
    /// Something is there, but it cannot serve as an endpoint.
    Unusable(Unusable),
}

impl Probe {
    /// `true` for [`Probe::Live`].
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// Probe `path`, spending at most roughly `timeout` on the connect attempt.
pub fn probe(path: &Path, timeout: Duration) -> Probe {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // A symlink whose target is gone still occupies the name.
            return match fs::symlink_metadata(path) {
                Ok(_) => Probe::Unusable(Unusable::NotSocket(FileKind::Symlink)),
                Err(_) => Probe::Absent,
            };
        }
        Err(e) => return Probe::Unusable(classify_io(&e)),
    };

    if !meta.file_type().is_socket() {
        return Probe::Unusable(Unusable::NotSocket(FileKind::of(meta.file_type())));
    }

    match connect_within(path, timeout) {
        Ok(()) => Probe::Live,
        Err(e) => match e.raw_os_error() {
            Some(libc::ECONNREFUSED) => Probe::Unusable(Unusable::Stale),
            Some(libc::ENOENT) => Probe::Absent,
            _ => Probe::Unusable(classify_io(&e)),
        },
    }
}

fn classify_io(e: &io::Error) -> Unusable {
    match e.kind() {
        io::ErrorKind::PermissionDenied => Unusable::PermissionDenied,
        io::ErrorKind::TimedOut => Unusable::TimedOut,
        _ => Unusable::Unreachable(e.to_string()),
    }
}

/// Connect a throwaway stream socket to `path`, giving up at the deadline.
///
/// The connection is closed immediately; only reachability matters.
fn connect_within(path: &Path, timeout: Duration) -> io::Result<()> {
    let (addr, addr_len) = sockaddr_for(path)?;
    let deadline = Instant::now() + timeout;

    loop {
        let fd = nonblocking_stream_socket()?;

        // SAFETY: `addr` is a fully initialised sockaddr_un and `addr_len`
        // does not exceed its size; `fd` is a valid open socket.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                addr_len,
            )
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) => return wait_connected(&fd, deadline),
            // Linux reports a full listen backlog as EAGAIN on Unix sockets.
            Some(libc::EAGAIN) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                std::thread::sleep(PROBE_RETRY_DELAY.min(deadline - now));
            }
            Some(libc::EINTR) => {}
            _ => return Err(err),
        }
    }
}

/// Wait for an in-progress connect to finish and report its outcome.
fn wait_connected(fd: &OwnedFd, deadline: Instant) -> io::Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }

        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a single valid pollfd and nfds is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        match rc {
            0 => return Err(io::ErrorKind::TimedOut.into()),
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            _ => return socket_error(fd),
        }
    }
}

fn socket_error(fd: &OwnedFd) -> io::Result<()> {
    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: `so_error` and `len` are valid for writes and sized for SO_ERROR.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(so_error).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

fn nonblocking_stream_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: fcntl on a valid descriptor we own.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(fd)
}

fn sockaddr_for(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();

    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path does not fit in sockaddr_un",
        ));
    }
    if bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path contains a NUL byte",
        ));
    }

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: sun_path was zero-filled and `bytes` is shorter than it, so the
    // buffer is NUL-terminated.
    let path_len = unsafe { CStr::from_ptr(addr.sun_path.as_ptr()) }.to_bytes().len();
    let offset = std::mem::size_of_val(&addr) - std::mem::size_of_val(&addr.sun_path);
    let len = (offset + path_len + 1) as libc::socklen_t;
    Ok((addr, len))
}
