//! 进程关闭
//!
//! runner 结束、出错或收到 Ctrl+C / SIGTERM 时记录关闭原因（先到者为准），
//! 随后按注册顺序执行清理：先为未结束的工作流写检查点，再停止引擎。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::workflow::engine::WorkflowEngine;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// runner 正常结束
    RunFinished,
    /// runner 以错误结束
    RunFailed(String),
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Interrupted => "interrupted",
            ShutdownReason::Terminated => "terminated",
            ShutdownReason::RunFinished => "run_finished",
            ShutdownReason::RunFailed(_) => "run_failed",
        }
    }
}

/// 关闭触发器
#[derive(Default)]
pub struct ShutdownManager {
    triggered: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录原因并触发关闭；已触发时返回 false，原因保持不变
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        info!(reason = reason.as_str(), "shutdown triggered");
        *slot = Some(reason);
        self.triggered.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn triggered(&self) {
        self.triggered.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.trigger(ShutdownReason::Terminated);
                }
            });
        }
    }
}

/// 关闭时执行的一步清理
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每步有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Box::new(step));
    }

    /// 执行全部清理；返回未成功完成的步骤名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let reason = self
            .manager
            .reason()
            .map_or("unspecified", |r| r.as_str());
        info!(reason, steps = self.steps.len(), "running shutdown cleanup");

        let mut unfinished = Vec::new();
        for step in &self.steps {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => info!(step = name, "cleanup step done"),
                Ok(Err(e)) => {
                    warn!(step = name, error = %e, "cleanup step failed");
                    unfinished.push(name);
                }
                Err(_) => {
                    warn!(
                        step = name,
                        timeout_ms = self.step_timeout.as_millis() as u64,
                        "cleanup step timed out"
                    );
                    unfinished.push(name);
                }
            }
        }
        unfinished
    }
}

/// 为所有未终止的工作流写检查点
pub struct CheckpointFlushCleanup {
    engine: Arc<WorkflowEngine>,
}

impl CheckpointFlushCleanup {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ShutdownCleanup for CheckpointFlushCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let saved = self.engine.checkpoint_all().await?;
        info!(saved, "checkpoints flushed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "checkpoint_flush"
    }
}

/// 取消待执行的自动重试，等待进行中的副作用结束
pub struct EngineDrainCleanup {
    engine: Arc<WorkflowEngine>,
}

impl EngineDrainCleanup {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ShutdownCleanup for EngineDrainCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let pending = self.engine.events().pending_retries();
        if pending > 0 {
            info!(pending, "dropping scheduled retries");
        }
        self.engine.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "engine_drain"
    }
}

/// 运行 runner，直到其结束或收到关闭信号；记录关闭原因后执行清理。
/// 被信号打断时返回 Ok
pub async fn run_with_graceful_shutdown<A, C, Fut>(
    manager: Arc<ShutdownManager>,
    app: A,
    cleanup: C,
) -> anyhow::Result<()>
where
    A: Future<Output = anyhow::Result<()>>,
    C: FnOnce() -> Fut,
    Fut: Future,
{
    manager.listen_for_signals();

    let outcome = tokio::select! {
        result = app => {
            let reason = match &result {
                Ok(()) => ShutdownReason::RunFinished,
                Err(e) => ShutdownReason::RunFailed(format!("{e:#}")),
            };
            manager.trigger(reason);
            result
        }
        _ = manager.triggered() => Ok(()),
    };

    cleanup().await;
    outcome
}
