//! Resolved plugin endpoints.

use std::io;
use std::path::{Path, PathBuf};

use super::name::PluginName;

/// A plugin name paired with the socket it was reachable at.
///
/// An endpoint is a point-in-time answer: the socket accepted a connection
/// when it was resolved, but the plugin may stop at any moment afterwards.
/// Treat a failed [`connect`](Self::connect) the same as "not found".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: PluginName,
    path: PathBuf,
}

impl Endpoint {
    /// Create an endpoint for `name` listening at `path`.
    pub fn new(name: PluginName, path: PathBuf) -> Self {
        Self { name, path }
    }

    /// The name the endpoint was resolved for, subtype included.
    pub fn name(&self) -> &PluginName {
        &self.name
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address in `unix://` URL form, for logs and CLI output.
    pub fn address(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    /// Open a blocking stream to the plugin.
    pub fn connect(&self) -> io::Result<std::os::unix::net::UnixStream> {
        std::os::unix::net::UnixStream::connect(&self.path)
    }

    /// Open an async stream to the plugin.
    pub async fn connect_async(&self) -> io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.path).await
    }
}
