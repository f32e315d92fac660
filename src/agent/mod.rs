pub mod orchestrator;
pub mod persona;
pub mod realtime;

pub use orchestrator::SessionOrchestrator;
pub use persona::Persona;
pub use realtime::{ClientEvent, ConnectError, RealtimeSession, ServerEvent, SessionHandle};
