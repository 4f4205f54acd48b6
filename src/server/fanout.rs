use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::tasks::{ConsoleMessage, TaskData, TaskType};

/// Task state mirrored to operator clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub agent_id: String,
    pub task_id: String,
    pub client: String,
    pub user: String,
    pub computer: String,
    pub cmdline: String,
    pub start_date: i64,
    pub finish_date: i64,
    pub task_type: TaskType,
    pub completed: bool,
    pub message: String,
    pub clear_text: String,
    pub message_type: ConsoleMessage,
}

impl From<&TaskData> for TaskSnapshot {
    fn from(task: &TaskData) -> Self {
        Self {
            agent_id: task.agent_id.clone(),
            task_id: task.task_id.clone(),
            client: task.client.clone(),
            user: task.user.clone(),
            computer: task.computer.clone(),
            cmdline: task.cmdline.clone(),
            start_date: task.start_date,
            finish_date: task.finish_date,
            task_type: task.task_type,
            completed: task.completed,
            message: task.message.clone(),
            clear_text: task.clear_text.clone(),
            message_type: task.message_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "packet", rename_all = "snake_case")]
pub enum SyncPacket {
    AgentTaskSync(TaskSnapshot),
    AgentTaskUpdate(TaskSnapshot),
    AgentTaskRemove { agent_id: String, task_id: String },
    AgentTaskSend { task_ids: Vec<String> },
    AgentConsoleTaskSync(TaskSnapshot),
    AgentConsoleTaskUpd(TaskSnapshot),
}

impl SyncPacket {
    pub fn task_sync(task: &TaskData) -> Self {
        Self::AgentTaskSync(task.into())
    }

    pub fn task_update(task: &TaskData) -> Self {
        Self::AgentTaskUpdate(task.into())
    }

    pub fn task_remove(task: &TaskData) -> Self {
        Self::AgentTaskRemove {
            agent_id: task.agent_id.clone(),
            task_id: task.task_id.clone(),
        }
    }

    pub fn task_send(task_ids: Vec<String>) -> Self {
        Self::AgentTaskSend { task_ids }
    }

    pub fn console_task_sync(task: &TaskData) -> Self {
        Self::AgentConsoleTaskSync(task.into())
    }

    pub fn console_task_upd(task: &TaskData) -> Self {
        Self::AgentConsoleTaskUpd(task.into())
    }
}

/// Broadcast of state changes to connected operator clients. Senders are
/// unbounded so a slow client can never stall a router operation; a client
/// that dropped its receiver is pruned on the next broadcast.
pub struct ClientFanout {
    clients: DashMap<String, mpsc::UnboundedSender<SyncPacket>>,
}

impl Default for ClientFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFanout {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn connect(&self, client_id: &str) -> mpsc::UnboundedReceiver<SyncPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client_id.to_string(), tx);
        rx
    }

    pub fn disconnect(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn sync_all(&self, packet: &SyncPacket) {
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(packet.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for client_id in dead {
            self.clients.remove(&client_id);
            tracing::debug!(client_id = %client_id, "pruned disconnected client");
        }
    }

    pub fn send_to(&self, client_id: &str, packet: SyncPacket) {
        if let Some(tx) = self.clients.get(client_id) {
            let _ = tx.send(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskData {
        let mut t = TaskData::with_type(TaskType::Task);
        t.task_id = "deadbeef".to_string();
        t.agent_id = "0a0b0c0d".to_string();
        t
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let fanout = ClientFanout::new();
        let mut rx1 = fanout.connect("op1");
        let mut rx2 = fanout.connect("op2");

        fanout.sync_all(&SyncPacket::task_sync(&task()));

        assert!(matches!(
            rx1.recv().await,
            Some(SyncPacket::AgentTaskSync(_))
        ));
        assert!(matches!(
            rx2.recv().await,
            Some(SyncPacket::AgentTaskSync(_))
        ));
    }

    #[tokio::test]
    async fn dropped_client_is_pruned() {
        let fanout = ClientFanout::new();
        let rx = fanout.connect("op1");
        drop(rx);

        fanout.sync_all(&SyncPacket::task_remove(&task()));
        assert_eq!(fanout.client_count(), 0);
    }

    #[test]
    fn packets_serialize() {
        let packet = SyncPacket::task_send(vec!["deadbeef".to_string()]);
        let encoded = serde_json::to_string(&packet).unwrap();
        assert!(encoded.contains("agent_task_send"));
    }
}
