//! 核心层：错误分类、恢复策略、状态投影、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::{ErrorCategory, GenerationError, OrchestratorError};
pub use recovery::RecoveryPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::WorkflowView;
