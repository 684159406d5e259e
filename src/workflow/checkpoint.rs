//! 检查点：运行实例 + 累积数据的可恢复快照，以及持久化存储
//!
//! 内置三种存储：内存、每个工作流一个 JSON 文件、SQLite（需要 `async-sqlite` feature）。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::quality::QualityMetrics;
use crate::workflow::types::{
    Step, StepResult, WorkflowConfig, WorkflowData, WorkflowId, WorkflowInstance,
};

/// 交给持久化服务的快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub document_id: String,
    pub workflow_id: WorkflowId,
    pub current_step: Option<Step>,
    pub step_progress: u8,
    pub overall_progress: u8,
    pub step_data: BTreeMap<Step, String>,
    pub step_results: BTreeMap<Step, StepResult>,
    pub quality_metrics: BTreeMap<Step, QualityMetrics>,
    pub config: WorkflowConfig,
    pub timestamp: DateTime<Utc>,
    /// 保存时的状态标签（如 `drafting.completed`）
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub manual_mode: bool,
    #[serde(default)]
    pub user_override: bool,
}

impl CheckpointSnapshot {
    pub fn capture(
        instance: &WorkflowInstance,
        data: &WorkflowData,
        state: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: instance.document_id.clone(),
            workflow_id: instance.workflow_id.clone(),
            current_step: instance.current_step,
            step_progress: instance.step_progress,
            overall_progress: instance.overall_progress,
            step_data: data.step_data.clone(),
            step_results: data.step_results.clone(),
            quality_metrics: data.quality_metrics.clone(),
            config: instance.config.clone(),
            timestamp,
            state: state.into(),
            retry_count: instance.retry_count,
            max_retries: instance.max_retries,
            manual_mode: instance.manual_mode,
            user_override: instance.user_override,
        }
    }

    pub fn data(&self) -> WorkflowData {
        WorkflowData {
            step_data: self.step_data.clone(),
            step_results: self.step_results.clone(),
            quality_metrics: self.quality_metrics.clone(),
        }
    }
}

/// 持久化服务接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()>;

    async fn load(&self, workflow_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>>;
}

/// 内存存储（测试与单进程运行）
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    snapshots: RwLock<HashMap<WorkflowId, CheckpointSnapshot>>,
    saves: RwLock<usize>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计保存次数
    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.workflow_id.clone(), snapshot.clone());
        *self.saves.write().await += 1;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
        Ok(self.snapshots.read().await.get(workflow_id).cloned())
    }
}

/// JSON 文件存储：`<dir>/<workflow_id>.json`，先写临时文件再重命名
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        let safe: String = workflow_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create checkpoint dir {}", self.dir.display()))?;
        let path = self.path_for(&snapshot.workflow_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
        let path = self.path_for(workflow_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("parse checkpoint {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
}

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::{CheckpointSnapshot, CheckpointStore};

    /// SQLite 存储：每个工作流保留最新一份快照
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl SqliteCheckpointStore {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;
            let store = Self { pool };
            store.init_tables().await?;
            Ok(store)
        }

        pub fn from_pool(pool: SqlitePool) -> Self {
            Self { pool }
        }

        async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                    workflow_id TEXT PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    snapshot TEXT NOT NULL,
                    saved_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
            let body = serde_json::to_string(snapshot)?;
            sqlx::query(
                "INSERT OR REPLACE INTO workflow_checkpoints (workflow_id, document_id, state, snapshot, saved_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&snapshot.workflow_id)
            .bind(&snapshot.document_id)
            .bind(&snapshot.state)
            .bind(&body)
            .bind(snapshot.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn load(&self, workflow_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
            let row = sqlx::query("SELECT snapshot FROM workflow_checkpoints WHERE workflow_id = ?")
                .bind(workflow_id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let body: String = row.get("snapshot");
                    Ok(Some(serde_json::from_str(&body)?))
                }
                None => Ok(None),
            }
        }
    }

}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqliteCheckpointStore;
