pub mod errors;
pub mod frame;
pub mod transport;

pub use errors::SessionError;
pub use frame::Frame;
pub use transport::Transport;
