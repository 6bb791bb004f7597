pub mod http;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod ws;

pub use registry::ChannelRegistry;
pub use server::{start, AppState, ServerConfig, ServerHandle};
