pub mod body;
pub mod buf;
pub mod connection;
pub mod context;
pub mod h1;
pub mod h2;
pub mod timeout;
pub mod transport;
pub mod types;

pub use body::RequestBody;
pub use buf::RecvBuffer;
pub use connection::{Connection, ServerConfig};
pub use context::{Application, Capabilities, Request, RequestContext, Response};
pub use timeout::{TimeoutControl, TimeoutReason};
pub use transport::{AlpnInfo, Transport};
pub use types::*;
