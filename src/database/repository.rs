use chrono::Utc;

use super::DbPool;
use crate::server::fanout::SyncPacket;
use crate::tasks::TaskData;

pub async fn create_schema(pool: &DbPool) -> crate::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id      TEXT PRIMARY KEY,
            agent_id     TEXT NOT NULL,
            client       TEXT NOT NULL,
            cmdline      TEXT NOT NULL,
            computer     TEXT NOT NULL,
            user         TEXT NOT NULL,
            start_date   INTEGER NOT NULL,
            finish_date  INTEGER NOT NULL,
            task_type    TEXT NOT NULL,
            completed    INTEGER NOT NULL,
            message      TEXT NOT NULL,
            clear_text   TEXT NOT NULL,
            message_type TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS console (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id   TEXT NOT NULL,
            packet     TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn task_insert(pool: &DbPool, task: &TaskData) -> crate::Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tasks
            (task_id, agent_id, client, cmdline, computer, user,
             start_date, finish_date, task_type, completed,
             message, clear_text, message_type)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&task.task_id)
    .bind(&task.agent_id)
    .bind(&task.client)
    .bind(&task.cmdline)
    .bind(&task.computer)
    .bind(&task.user)
    .bind(task.start_date)
    .bind(task.finish_date)
    .bind(task.task_type.to_string())
    .bind(task.completed)
    .bind(&task.message)
    .bind(&task.clear_text)
    .bind(task.message_type.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn task_delete(pool: &DbPool, task_id: &str) -> crate::Result<()> {
    sqlx::query(r#"DELETE FROM tasks WHERE task_id = ?"#)
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn console_insert(pool: &DbPool, agent_id: &str, packet: &SyncPacket) -> crate::Result<()> {
    let encoded =
        serde_json::to_string(packet).map_err(|e| crate::UmbraError::Decode(e.to_string()))?;

    sqlx::query(r#"INSERT INTO console (agent_id, packet, created_at) VALUES (?1, ?2, ?3)"#)
        .bind(agent_id)
        .bind(encoded)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;

    Ok(())
}
