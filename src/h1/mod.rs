//! HTTP/1.x: zero-copy request head parsing, body framing, and the
//! keep-alive request loop.

pub mod connection;
pub mod message_body;
pub mod parser;

pub use connection::serve;
