pub mod error;
pub mod frame;
pub mod header;
pub mod limits;
pub mod protocol;

pub use error::*;
pub use frame::*;
pub use header::*;
pub use limits::*;
pub use protocol::*;
