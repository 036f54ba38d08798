pub mod handlers;
pub mod registry;
pub mod server;
pub mod session;
mod ws;

pub use registry::SessionRegistry;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{Session, SessionHandle, SessionHandler, SessionState};
