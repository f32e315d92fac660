pub mod registry;
pub mod transfer;

pub use registry::{CallRegistry, CallState, PendingTransfer, RegistryError};
pub use transfer::{ToolResult, TransferCoordinator, TransferError, TransferPhase};
