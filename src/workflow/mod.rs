//! 工作流编排：类型、状态转换表、副作用执行引擎、检查点

pub mod checkpoint;
pub mod engine;
pub mod machine;
pub mod types;

pub use checkpoint::{CheckpointSnapshot, CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use engine::{EngineSettings, WorkflowEngine};
pub use machine::{
    transition, Effect, EffectSignal, MachineInput, RetryGuard, WorkflowCommand, WorkflowMachine,
};
pub use types::*;
#[cfg(feature = "async-sqlite")]
pub use checkpoint::SqliteCheckpointStore;
