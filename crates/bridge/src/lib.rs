//! JSON-RPC bridge that puts several independently operated MCP tool servers behind one endpoint.
//!
//! Listing methods fan out to every backend and merge namespaced results; `tools/call` routes by
//! qualified name either inline or through a persisted background task.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod http;
pub mod identity;
pub mod invoke;
pub mod registry;
pub mod state;
pub mod status;
pub mod store;
pub mod timeouts;
pub mod transport;
