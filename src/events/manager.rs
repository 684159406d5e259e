//! 事件与恢复管理器
//!
//! - 每个事件写入有界事件日志（最近 N 条），按优先级依次运行该类型的处理器，最后通知订阅者
//! - 处理器出错不影响其它处理器，并重新发出 error 事件；处理 error 事件时出错只记录日志
//! - error 事件：分类、写入错误历史、创建恢复点；可自动恢复时按指数退避安排重试
//! - 恢复点按时间窗口保留，工作流完成时清空；步骤离开 error/qualityFailed（暂停除外）时清掉该步骤的待处理恢复点
//!
//! 管理器不直接修改工作流实例：恢复动作以 `RecoveryDirective` 形式交给编排器执行。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::error::OrchestratorError;
use crate::core::recovery::{classify, is_recoverable, RecoveryPolicy};
use crate::events::types::{
    ErrorReport, EventType, RecoveryDirective, RecoveryOption, RecoveryOptionKind, RecoveryPoint,
    RecoverySeverity, WorkflowError, WorkflowEvent,
};
use crate::quality::LOW_SCORE_RECOVERY;
use crate::workflow::checkpoint::CheckpointSnapshot;
use crate::workflow::machine::{RetryGuard, WorkflowCommand};
use crate::workflow::types::{Step, StepPhase};

const EVENT_STREAM_CAPACITY: usize = 256;

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// 管理器参数
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub policy: RecoveryPolicy,
    /// 恢复点与错误历史的保留窗口
    pub retention: chrono::Duration,
    pub event_log_capacity: usize,
    pub error_history_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::default(),
            retention: chrono::Duration::hours(24),
            event_log_capacity: 1000,
            error_history_capacity: 500,
        }
    }
}

/// 处理器运行时可用的上下文
pub struct HandlerContext<'a> {
    pub manager: &'a EventRecoveryManager,
    /// 发出事件时附带的快照（用于恢复点）
    pub snapshot: Option<&'a CheckpointSnapshot>,
}

/// 内部事件处理器
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()>;
}

struct RegisteredHandler {
    priority: i32,
    handler: Arc<dyn EventHandler>,
}

struct Subscription {
    id: SubscriptionId,
    event_type: Option<EventType>,
    callback: Callback,
    once: bool,
}

struct Inner {
    config: RecoveryConfig,
    handlers: RwLock<HashMap<EventType, Vec<RegisteredHandler>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    event_log: Mutex<VecDeque<WorkflowEvent>>,
    errors: Mutex<VecDeque<WorkflowError>>,
    points: Mutex<Vec<RecoveryPoint>>,
    stream: broadcast::Sender<WorkflowEvent>,
    directives: mpsc::UnboundedSender<RecoveryDirective>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 事件与恢复管理器（可克隆句柄，进程内共享）
#[derive(Clone)]
pub struct EventRecoveryManager {
    inner: Arc<Inner>,
}

impl EventRecoveryManager {
    /// 创建管理器，返回 (管理器, 恢复指令接收端)；接收端交给编排器消费
    pub fn new(config: RecoveryConfig) -> (Self, mpsc::UnboundedReceiver<RecoveryDirective>) {
        let (directives, rx) = mpsc::unbounded_channel();
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                handlers: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                event_log: Mutex::new(VecDeque::new()),
                errors: Mutex::new(VecDeque::new()),
                points: Mutex::new(Vec::new()),
                stream,
                directives,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        };
        manager.register_builtin_handlers();
        (manager, rx)
    }

    fn register_builtin_handlers(&self) {
        let logging: Arc<dyn EventHandler> = Arc::new(LoggingHandler);
        for ty in [
            EventType::StateChange,
            EventType::Error,
            EventType::QualityCheckComplete,
            EventType::AiGeneration,
            EventType::StepCompleted,
            EventType::WorkflowStarted,
            EventType::WorkflowCompleted,
        ] {
            self.register_handler(ty, 1000, logging.clone());
        }
        self.register_handler(EventType::Error, 100, Arc::new(ErrorRecoveryHandler));
        self.register_handler(
            EventType::QualityCheckComplete,
            100,
            Arc::new(QualityRecoveryHandler),
        );
        self.register_handler(EventType::StepCompleted, 100, Arc::new(StepSnapshotHandler));
        self.register_handler(EventType::StateChange, 100, Arc::new(FailureResolvedHandler));
        self.register_handler(
            EventType::WorkflowCompleted,
            100,
            Arc::new(CompletionCleanupHandler),
        );
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// 注册处理器；优先级高的先运行，同优先级按注册顺序
    pub fn register_handler(
        &self,
        event_type: EventType,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(event_type).or_default();
        list.push(RegisteredHandler { priority, handler });
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map(|list| list.iter().map(|r| r.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// 发出事件（同步执行处理器，随后通知订阅者）
    pub fn emit(&self, event: WorkflowEvent, snapshot: Option<&CheckpointSnapshot>) {
        self.push_log(event.clone());

        let ctx = HandlerContext {
            manager: self,
            snapshot,
        };
        for handler in self.handlers_for(event.event_type()) {
            if let Err(e) = handler.handle(&event, &ctx) {
                if event.event_type() == EventType::Error {
                    tracing::error!(
                        handler = handler.name(),
                        workflow_id = %event.workflow_id(),
                        error = %e,
                        "handler failed while handling error event"
                    );
                } else {
                    warn!(
                        handler = handler.name(),
                        workflow_id = %event.workflow_id(),
                        error = %e,
                        "event handler failed"
                    );
                    self.emit(
                        WorkflowEvent::Error(ErrorReport {
                            workflow_id: event.workflow_id().to_string(),
                            step: None,
                            message: format!("event handler {} failed: {}", handler.name(), e),
                            retry_count: 0,
                            max_retries: 0,
                            epoch: 0,
                            fatal: false,
                        }),
                        None,
                    );
                }
            }
        }

        self.notify_subscribers(&event);
        let _ = self.inner.stream.send(event);
    }

    fn push_log(&self, event: WorkflowEvent) {
        let capacity = self.inner.config.event_log_capacity.max(1);
        let mut log = lock(&self.inner.event_log);
        while log.len() >= capacity {
            log.pop_front();
        }
        log.push_back(event);
    }

    fn notify_subscribers(&self, event: &WorkflowEvent) {
        let ty = event.event_type();
        let callbacks: Vec<Callback> = {
            let mut subs = lock(&self.inner.subscriptions);
            let matched: Vec<Callback> = subs
                .iter()
                .filter(|s| s.event_type.map_or(true, |t| t == ty))
                .map(|s| s.callback.clone())
                .collect();
            subs.retain(|s| !(s.once && s.event_type.map_or(true, |t| t == ty)));
            matched
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// 订阅事件；event_type 为 None 时接收所有类型；once 为 true 时触发一次后自动退订
    pub fn subscribe<F>(&self, event_type: Option<EventType>, callback: F, once: bool) -> SubscriptionId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscriptions).push(Subscription {
            id,
            event_type,
            callback: Arc::new(callback),
            once,
        });
        id
    }

    /// 退订；返回是否存在该订阅
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.inner.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// 以 broadcast 流的方式订阅所有事件
    pub fn subscribe_stream(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.stream.subscribe()
    }

    pub fn event_log(&self) -> Vec<WorkflowEvent> {
        lock(&self.inner.event_log).iter().cloned().collect()
    }

    pub fn error_history(&self, workflow_id: Option<&str>) -> Vec<WorkflowError> {
        lock(&self.inner.errors)
            .iter()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .cloned()
            .collect()
    }

    pub fn recovery_points(&self, workflow_id: &str) -> Vec<RecoveryPoint> {
        lock(&self.inner.points)
            .iter()
            .filter(|p| p.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    pub fn recovery_point(&self, point_id: &str) -> Option<RecoveryPoint> {
        lock(&self.inner.points)
            .iter()
            .find(|p| p.id == point_id)
            .cloned()
    }

    /// 该工作流最近一个带恢复选项的恢复点
    pub fn latest_actionable_point(&self, workflow_id: &str) -> Option<RecoveryPoint> {
        lock(&self.inner.points)
            .iter()
            .rev()
            .find(|p| p.workflow_id == workflow_id && !p.recovery_options.is_empty())
            .cloned()
    }

    /// 按保留窗口清理恢复点与错误历史
    pub fn prune_expired(&self, now: DateTime<Utc>) {
        let retention = self.inner.config.retention;
        lock(&self.inner.points).retain(|p| now - p.timestamp < retention);
        lock(&self.inner.errors).retain(|e| now - e.timestamp < retention);
    }

    pub fn clear_workflow(&self, workflow_id: &str) {
        lock(&self.inner.points).retain(|p| p.workflow_id != workflow_id);
    }

    /// 移除恢复点；返回是否存在
    pub fn discard_point(&self, point_id: &str) -> bool {
        let mut points = lock(&self.inner.points);
        let before = points.len();
        points.retain(|p| p.id != point_id);
        points.len() != before
    }

    fn record_error(&self, record: WorkflowError) {
        self.prune_expired(Utc::now());
        let capacity = self.inner.config.error_history_capacity.max(1);
        let mut errors = lock(&self.inner.errors);
        while errors.len() >= capacity {
            errors.pop_front();
        }
        errors.push_back(record);
    }

    fn store_point(&self, point: RecoveryPoint) {
        self.prune_expired(Utc::now());
        lock(&self.inner.points).push(point);
    }

    fn new_point(
        workflow_id: &str,
        step: Option<Step>,
        snapshot: Option<&CheckpointSnapshot>,
        error: Option<WorkflowError>,
        recovery_options: Vec<RecoveryOption>,
    ) -> RecoveryPoint {
        RecoveryPoint {
            id: format!("rp_{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            workflow_id: workflow_id.to_string(),
            step,
            context_snapshot: snapshot.cloned(),
            error,
            recovery_options,
        }
    }

    /// 取出恢复点上的选项并生成指令（恢复点随之移除）
    pub fn resolve_recovery_option(
        &self,
        point_id: &str,
        option_id: &str,
    ) -> Result<RecoveryDirective, OrchestratorError> {
        let mut points = lock(&self.inner.points);
        let idx = points
            .iter()
            .position(|p| p.id == point_id)
            .ok_or_else(|| OrchestratorError::RecoveryPointNotFound(point_id.to_string()))?;
        let option = points[idx]
            .option(option_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::RecoveryOptionNotFound(option_id.to_string()))?;
        if !option.enabled {
            return Err(OrchestratorError::RecoveryOptionUnavailable(option.id));
        }
        let point = points.remove(idx);
        Ok(RecoveryDirective {
            workflow_id: point.workflow_id,
            recovery_point_id: point.id,
            option: option.kind,
            command: option.kind.command(),
            automatic: false,
        })
    }

    /// 执行恢复选项：指令经通道交给编排器
    pub fn execute_recovery_option(
        &self,
        point_id: &str,
        option_id: &str,
    ) -> Result<(), OrchestratorError> {
        let directive = self.resolve_recovery_option(point_id, option_id)?;
        info!(
            workflow_id = %directive.workflow_id,
            option = directive.option.as_str(),
            "recovery option executed"
        );
        self.inner
            .directives
            .send(directive)
            .map_err(|_| OrchestratorError::RecoveryPointNotFound(point_id.to_string()))
    }

    fn handle_error_report(&self, report: &ErrorReport, snapshot: Option<&CheckpointSnapshot>) {
        let category = classify(&report.message);
        let recoverable = !report.fatal && is_recoverable(category, &report.message);
        let record = WorkflowError {
            id: format!("err_{}", uuid::Uuid::new_v4()),
            workflow_id: report.workflow_id.clone(),
            step: report.step,
            category,
            message: report.message.clone(),
            timestamp: Utc::now(),
            retry_count: report.retry_count,
            recoverable,
        };
        self.record_error(record.clone());

        let Some(step) = report.step else {
            return;
        };

        let retry_available = recoverable && report.retry_count < report.max_retries;
        let point = Self::new_point(
            &report.workflow_id,
            Some(step),
            snapshot,
            Some(record),
            error_options(step, retry_available),
        );

        let policy = &self.inner.config.policy;
        if policy.should_auto_retry(
            category,
            recoverable,
            report.fatal,
            report.retry_count,
            report.max_retries,
        ) {
            let delay = policy.backoff(report.retry_count);
            info!(
                workflow_id = %report.workflow_id,
                step = %step,
                category = %category,
                retry = report.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling automatic retry"
            );
            let guard = RetryGuard {
                step,
                epoch: report.epoch,
                retry_count: report.retry_count,
            };
            let point_id = point.id.clone();
            self.store_point(point);
            self.schedule_retry(report.workflow_id.clone(), point_id, guard, delay);
        } else {
            warn!(
                workflow_id = %report.workflow_id,
                step = %step,
                category = %category,
                recoverable,
                "manual recovery required"
            );
            self.store_point(point);
        }
    }

    /// 退避到期后发出带 guard 的重试指令；恢复点留到编排器接受指令后才移除
    fn schedule_retry(
        &self,
        workflow_id: String,
        point_id: String,
        guard: RetryGuard,
        delay: Duration,
    ) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(%workflow_id, "no async runtime, automatic retry left for manual recovery");
                return;
            }
        };
        let manager = self.clone();
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%workflow_id, "pending retry dropped on shutdown");
                    }
                    _ = tokio::time::sleep(delay) => {
                        if manager.recovery_point(&point_id).is_none() {
                            debug!(%workflow_id, "recovery point already resolved");
                            return;
                        }
                        let directive = RecoveryDirective {
                            workflow_id: workflow_id.clone(),
                            recovery_point_id: point_id,
                            option: RecoveryOptionKind::Retry,
                            command: WorkflowCommand::RetryStep { guard: Some(guard) },
                            automatic: true,
                        };
                        if manager.inner.directives.send(directive).is_err() {
                            warn!(%workflow_id, "directive receiver closed, retry dropped");
                        }
                    }
                }
            },
            &handle,
        );
    }

    fn handle_quality_check(
        &self,
        event: &WorkflowEvent,
        snapshot: Option<&CheckpointSnapshot>,
    ) {
        let WorkflowEvent::QualityCheckComplete {
            workflow_id,
            step,
            score,
            passed,
            retry_count,
            max_retries,
            ..
        } = event
        else {
            return;
        };
        if *passed || *score >= LOW_SCORE_RECOVERY {
            return;
        }
        let options = vec![
            RecoveryOption::new(
                RecoveryOptionKind::Regenerate,
                "Regenerate with improvements",
                "Run the step again with the reviewer suggestions added to the prompt",
                RecoverySeverity::Low,
                retry_count < max_retries,
            ),
            RecoveryOption::new(
                RecoveryOptionKind::OverrideQuality,
                "Override quality check",
                "Accept the current output despite the low score",
                RecoverySeverity::High,
                true,
            ),
        ];
        self.store_point(Self::new_point(
            workflow_id,
            Some(*step),
            snapshot,
            None,
            options,
        ));
    }

    fn handle_step_completed(&self, event: &WorkflowEvent, snapshot: Option<&CheckpointSnapshot>) {
        if let WorkflowEvent::StepCompleted {
            workflow_id, step, ..
        } = event
        {
            self.store_point(Self::new_point(
                workflow_id,
                Some(*step),
                snapshot,
                None,
                Vec::new(),
            ));
        }
    }

    fn handle_state_change(&self, event: &WorkflowEvent) {
        let WorkflowEvent::StateChange {
            workflow_id,
            from,
            to,
        } = event
        else {
            return;
        };
        if to == "paused" {
            return;
        }
        let Some(step) = failure_step(from) else {
            return;
        };
        let mut points = lock(&self.inner.points);
        let before = points.len();
        points.retain(|p| {
            !(p.workflow_id == *workflow_id
                && p.step == Some(step)
                && !p.recovery_options.is_empty())
        });
        if points.len() != before {
            debug!(
                %workflow_id,
                step = %step,
                dropped = before - points.len(),
                "failure resolved, pending recovery points dropped"
            );
        }
    }

    /// 取消所有等待中的自动重试并等待任务退出
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// 等待中的自动重试数量
    pub fn pending_retries(&self) -> usize {
        self.inner.tracker.len()
    }
}

/// `planning.error` / `drafting.qualityFailed` 这类标签对应的步骤
fn failure_step(label: &str) -> Option<Step> {
    let (step, phase) = label.split_once('.')?;
    if phase != StepPhase::Error.as_str() && phase != StepPhase::QualityFailed.as_str() {
        return None;
    }
    Step::ALL.into_iter().find(|s| s.as_str() == step)
}

fn error_options(step: Step, retry_available: bool) -> Vec<RecoveryOption> {
    vec![
        RecoveryOption::new(
            RecoveryOptionKind::Retry,
            "Retry step",
            "Run the step again with the same input",
            RecoverySeverity::Low,
            retry_available,
        ),
        RecoveryOption::new(
            RecoveryOptionKind::Skip,
            "Skip step",
            "Continue without this step's output",
            RecoverySeverity::Medium,
            step.is_skippable(),
        ),
        RecoveryOption::new(
            RecoveryOptionKind::RestartStep,
            "Restart step",
            "Reset the retry counter and run the step from scratch",
            RecoverySeverity::Medium,
            true,
        ),
        RecoveryOption::new(
            RecoveryOptionKind::Manual,
            "Enter content manually",
            "Provide the step's content yourself and continue",
            RecoverySeverity::High,
            true,
        ),
    ]
}

struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    fn handle(&self, event: &WorkflowEvent, _ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        match event {
            WorkflowEvent::Error(report) => warn!(
                workflow_id = %report.workflow_id,
                step = ?report.step,
                retry_count = report.retry_count,
                fatal = report.fatal,
                message = %report.message,
                "workflow error"
            ),
            other => debug!(
                workflow_id = %other.workflow_id(),
                event = ?other.event_type(),
                "workflow event"
            ),
        }
        Ok(())
    }
}

struct ErrorRecoveryHandler;

impl EventHandler for ErrorRecoveryHandler {
    fn name(&self) -> &str {
        "error_recovery"
    }

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        if let WorkflowEvent::Error(report) = event {
            ctx.manager.handle_error_report(report, ctx.snapshot);
        }
        Ok(())
    }
}

struct QualityRecoveryHandler;

impl EventHandler for QualityRecoveryHandler {
    fn name(&self) -> &str {
        "quality_recovery"
    }

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        ctx.manager.handle_quality_check(event, ctx.snapshot);
        Ok(())
    }
}

struct StepSnapshotHandler;

impl EventHandler for StepSnapshotHandler {
    fn name(&self) -> &str {
        "step_snapshot"
    }

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        ctx.manager.handle_step_completed(event, ctx.snapshot);
        Ok(())
    }
}

struct FailureResolvedHandler;

impl EventHandler for FailureResolvedHandler {
    fn name(&self) -> &str {
        "failure_resolved"
    }

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        ctx.manager.handle_state_change(event);
        Ok(())
    }
}

struct CompletionCleanupHandler;

impl EventHandler for CompletionCleanupHandler {
    fn name(&self) -> &str {
        "completion_cleanup"
    }

    fn handle(&self, event: &WorkflowEvent, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        ctx.manager.clear_workflow(event.workflow_id());
        Ok(())
    }
}
