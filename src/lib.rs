//! Per-connection session core for a realtime collaborative-document server.
//!
//! An [`Agent`] owns one client connection end to end: it reads
//! and validates wire requests, dispatches them to a [`Backend`]
//! façade (storage, operational transform, and live queries — out of scope
//! here), fans every push source it subscribes to back onto the connection,
//! and tears down cleanly on disconnect. Transport framing is equally out of
//! scope; [`transport::MessageStream`] is the seam a WebSocket/TCP adapter
//! plugs into.

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod transport;
pub mod wire;

pub use agent::Agent;
pub use backend::{AgentHandle, Backend};
pub use config::AgentConfig;
pub use error::{BackendError, ValidationError};
pub use transport::MessageStream;
