//! Plugin identity: names, resolved endpoints, and error kinds.
//!
//! These types are shared by both sides of discovery. A plugin process uses
//! them to derive where to bind; callers use them to interpret what
//! [`DirDiscovery`](crate::discovery::DirDiscovery) hands back.

pub mod endpoint;
pub mod error;
pub mod name;

pub use endpoint::Endpoint;
pub use error::{is_not_a_socket, is_not_found, DiscoveryError, FileKind, Result, Unusable};
pub use name::{path_for, split_subtype, PluginName};
