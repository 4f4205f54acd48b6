pub mod repository;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::mpsc;

use crate::server::fanout::SyncPacket;
use crate::tasks::TaskData;

pub type DbPool = SqlitePool;

pub async fn init_database(path: &Path) -> crate::Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    repository::create_schema(&pool).await?;
    Ok(pool)
}

#[derive(Debug)]
enum StorageOp {
    TaskInsert(TaskData),
    TaskDelete(String),
    ConsoleInsert(String, SyncPacket),
}

/// Non-blocking persistence handle. Router operations enqueue writes here;
/// a single writer task owns the pool and applies them in order. Worker
/// errors are logged and dropped so persistence failures never reach
/// operators.
#[derive(Debug, Clone)]
pub struct Storage {
    tx: Option<mpsc::UnboundedSender<StorageOp>>,
}

impl Storage {
    /// No-op storage for servers running without a database.
    pub fn null() -> Self {
        Self { tx: None }
    }

    pub async fn sqlite(path: &Path) -> crate::Result<Self> {
        let pool = init_database(path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer(pool, rx));
        Ok(Self { tx: Some(tx) })
    }

    pub fn task_insert(&self, task: &TaskData) {
        self.enqueue(StorageOp::TaskInsert(task.clone()));
    }

    pub fn task_delete(&self, task_id: &str) {
        self.enqueue(StorageOp::TaskDelete(task_id.to_string()));
    }

    pub fn console_insert(&self, agent_id: &str, packet: &SyncPacket) {
        self.enqueue(StorageOp::ConsoleInsert(
            agent_id.to_string(),
            packet.clone(),
        ));
    }

    fn enqueue(&self, op: StorageOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                tracing::warn!("storage writer is gone, dropping write");
            }
        }
    }
}

async fn writer(pool: DbPool, mut rx: mpsc::UnboundedReceiver<StorageOp>) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            StorageOp::TaskInsert(task) => repository::task_insert(&pool, &task).await,
            StorageOp::TaskDelete(task_id) => repository::task_delete(&pool, &task_id).await,
            StorageOp::ConsoleInsert(agent_id, packet) => {
                repository::console_insert(&pool, &agent_id, &packet).await
            }
        };
        if let Err(e) = result {
            tracing::warn!("database write failed: {}", e);
        }
    }
}
