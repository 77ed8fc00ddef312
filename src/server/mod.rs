//! Server Frontend: frames tool requests from a transport, forwards to
//! the Dispatcher, serializes responses. Corresponds to spec.md §4.9.

pub mod http;
pub mod jsonrpc;
pub mod stdio;
