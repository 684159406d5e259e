//! 事件与恢复：发布/订阅、错误分类、恢复点与自动重试

pub mod manager;
pub mod types;

pub use manager::{
    EventHandler, EventRecoveryManager, HandlerContext, RecoveryConfig, SubscriptionId,
};
pub use types::{
    ErrorReport, EventType, RecoveryDirective, RecoveryOption, RecoveryOptionKind, RecoveryPoint,
    RecoverySeverity, WorkflowError, WorkflowEvent,
};
