//! MCP (Model Context Protocol) provider sessions over stdio.
//!
//! Each configured provider is launched as a child process and spoken to with
//! newline-delimited JSON-RPC 2.0. [`connect_all`] brings up every provider
//! from the config and reports the ones that failed.

mod connect;
mod protocol;
mod session;

pub use connect::{connect_all, ConnectReport};
pub use session::StdioSession;
