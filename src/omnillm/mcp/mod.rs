//! Model Context Protocol endpoints: JSON-RPC 2.0 over HTTP.
//!
//! [`server`] hosts tools, resources, and prompts behind the MCP method
//! set with a hardened HTTP pipeline ([`http`]); [`client`] consumes
//! remote MCP servers without ever throwing on transport failures.

pub mod client;
pub mod http;
pub mod protocol;
pub mod server;
