//! Out-of-process tool execution for Ferrule.
//!
//! Tool providers are child processes speaking JSON-RPC 2.0 over
//! newline-delimited stdio (the MCP wire protocol). Each provider is owned
//! by a [`Connection`]; the [`ToolSubstrate`] aggregates every configured
//! provider's tools into one flat namespace and routes calls to the right
//! process.

pub mod connection;
pub mod protocol;
pub mod substrate;

pub use connection::Connection;
pub use substrate::ToolSubstrate;
