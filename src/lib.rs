//! Dynamic context pruning engine.
//!
//! Sits between a host chat runtime and its session store, deciding what
//! prior tool output and conversation history can drop out of the
//! outbound prompt without losing anything the model still needs. See
//! `DcpEngine` for the entry point a host embeds.

pub mod compress;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod ids;
pub mod model;
pub mod persist;
pub mod prune;
pub mod rewrite;
pub mod router;
pub mod session;
pub mod toolcache;
pub mod tokens;

pub use compress::{CompressArgs, CompressOutcome};
pub use config::EngineConfig;
pub use engine::{DcpEngine, EngineStats};
pub use error::DcpError;
pub use host::{HostApi, HostSessionInfo, PermissionReply};
pub use model::{Message, Part, Role, ToolPart, ToolState};
pub use prune::PruneOutcome;
pub use router::{HostEvent, RouteOutcome};
pub use session::{SessionHandle, SessionState, SessionStore};
