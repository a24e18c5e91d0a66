//! Multi-tenant bridge over isolated MetaTrader 5 terminal instances
//!
//! Each API client supplies trading credentials; the bridge clones a
//! stripped terminal installation into a private data dir, spawns a worker
//! child process that drives the terminal, and relays commands to it over
//! line-delimited JSON. A registry multiplexes the shared API surface onto
//! the per-credential sessions and a background reaper reclaims idle ones.
//!
//! The moving parts, leaves first:
//!
//! - [`template`]: one-time canonical copy of the terminal installation
//! - [`provision`]: per-session clones of the template
//! - [`worker`]: the child-process side of the wire protocol
//! - [`handle`]: pipes, single-writer dispatch, and ordered teardown
//! - [`registry`]: the session map, idle eviction, and global shutdown
//! - [`server`]: the thin HTTP/WebSocket surface over the registry

pub mod config;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod provision;
pub mod registry;
pub mod server;
pub mod template;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{SessionError, SessionResult};
pub use handle::{SessionHandle, SessionInfo, WorkerSpec};
pub use protocol::{CommandRequest, CommandResponse, CredentialsMessage, InitMessage};
pub use registry::SessionRegistry;
pub use template::TemplateBuilder;
