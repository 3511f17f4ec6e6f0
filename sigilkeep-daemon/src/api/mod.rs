//! JSON-RPC API for the Sigilkeep daemon.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::{ApiState, SigilkeepApiImpl, SigilkeepApiServer};
pub use server::{ServerHandle, start_server};
pub use types::*;
