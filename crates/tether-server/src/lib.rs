pub mod connection;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use orchestrator::{TurnOrchestrator, TurnStart, BUSY_MESSAGE};
pub use registry::{ConnectionRegistry, RegistrySnapshot, SessionHandle};
pub use server::{start, AppState, ServerConfig, ServerError, ServerHandle};
pub use tunnel::{CloudflareTunnel, Tunnel, TunnelError, TunnelEvent};
