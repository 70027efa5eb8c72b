//! HTTP/2: frame codec, flow control, header validation, and the
//! connection state machine.

pub mod connection;
pub mod consts;
pub mod flow_control;
pub mod framing;
pub mod header_validation;
pub mod settings;
pub(crate) mod stream;

pub use connection::serve;
