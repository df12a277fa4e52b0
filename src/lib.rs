//! Plugdir - Unix-socket plugin discovery.
//!
//! Plugins are separate processes that each bind a Unix domain socket named
//! after themselves inside one shared directory. Callers find a plugin by
//! resolving its name against that directory; there is no registry process.
//!
//! # Architecture
//!
//! - **Naming** - `lookup[/subtype]` names and the path derived from them
//! - **Server** - binds, serves and tears down one plugin's socket
//! - **Discovery** - point lookups, listings and change watching over the directory
//! - **Flavor** - the plugin interface served over those sockets
//!
//! # Modules
//!
//! - [`plugin`] - Names, endpoints and the error taxonomy
//! - [`probe`] - Bounded-time liveness check for a socket path
//! - [`server`] - Socket lifecycle for plugin processes
//! - [`discovery`] - Directory scanning and lookup
//! - [`flavor`] - Flavor plugin interface and the swarm worker flavor
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod discovery;
pub mod flavor;
pub mod plugin;
pub mod probe;
pub mod server;

// Re-export commonly used types
pub use config::Config;
pub use discovery::{DirDiscovery, Discovery};
pub use plugin::{DiscoveryError, Endpoint, PluginName};
pub use server::{ConnectionHandler, PluginServer, ServerOptions};
