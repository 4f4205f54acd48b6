use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::server::fanout::SyncPacket;
use crate::tasks::queue::TaskQueue;
use crate::tasks::TaskData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Windows,
    Linux,
    Mac,
    Unknown,
}

impl OsKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Windows,
            2 => Self::Linux,
            3 => Self::Mac,
            _ => Self::Unknown,
        }
    }
}

/// Immutable-ish identity of an agent; `impersonated` is the only field the
/// router rewrites after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentData {
    pub id: String,
    pub name: String,
    pub watermark: String,
    pub listener: String,
    pub os: OsKind,
    pub computer: String,
    pub username: String,
    pub impersonated: Option<String>,
    pub external_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotLink {
    pub pivot_id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
}

/// Per-agent mutable state. Queue ownership: only the task router moves
/// tasks between the queue and the running/completed tables.
pub struct Agent {
    data: RwLock<AgentData>,
    active: AtomicBool,
    mark: Mutex<String>,

    pub tasks_queue: TaskQueue<TaskData>,
    pub running_tasks: DashMap<String, TaskData>,
    pub completed_tasks: DashMap<String, TaskData>,
    pub tunnel_connect_tasks: TaskQueue<TaskData>,
    pub tunnel_queue: TaskQueue<TaskData>,
    pub pivot_children: TaskQueue<PivotLink>,
    pub out_console: TaskQueue<SyncPacket>,
}

impl Agent {
    pub fn new(data: AgentData) -> Self {
        Self {
            data: RwLock::new(data),
            active: AtomicBool::new(true),
            mark: Mutex::new(String::new()),
            tasks_queue: TaskQueue::new(),
            running_tasks: DashMap::new(),
            completed_tasks: DashMap::new(),
            tunnel_connect_tasks: TaskQueue::new(),
            tunnel_queue: TaskQueue::new(),
            pivot_children: TaskQueue::new(),
            out_console: TaskQueue::new(),
        }
    }

    pub fn data(&self) -> AgentData {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_impersonated(&self, impersonated: Option<String>) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .impersonated = impersonated;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// An empty mark reactivates the agent; any other value (for instance
    /// "Disconnect") deactivates it and records the reason.
    pub fn set_mark(&self, mark: &str) {
        let mut current = self.mark.lock().unwrap_or_else(PoisonError::into_inner);
        *current = mark.to_string();
        self.active.store(mark.is_empty(), Ordering::SeqCst);
    }

    pub fn mark(&self) -> String {
        self.mark
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True when the task id is present in any queue or table.
    pub fn owns_task(&self, task_id: &str) -> bool {
        self.tasks_queue.contains_where(|t| t.task_id == task_id)
            || self.running_tasks.contains_key(task_id)
            || self.completed_tasks.contains_key(task_id)
            || self
                .tunnel_connect_tasks
                .contains_where(|t| t.task_id == task_id)
            || self.tunnel_queue.contains_where(|t| t.task_id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_data() -> AgentData {
        AgentData {
            id: "0a0b0c0d".to_string(),
            name: "beacon".to_string(),
            watermark: "11223344".to_string(),
            listener: "tcp-main".to_string(),
            os: OsKind::Linux,
            computer: "host-1".to_string(),
            username: "svc".to_string(),
            impersonated: None,
            external_ip: "10.0.0.5".to_string(),
        }
    }

    #[test]
    fn mark_toggles_active() {
        let agent = Agent::new(agent_data());
        assert!(agent.is_active());
        agent.set_mark("Disconnect");
        assert!(!agent.is_active());
        assert_eq!(agent.mark(), "Disconnect");
        agent.set_mark("");
        assert!(agent.is_active());
    }

    #[test]
    fn owns_task_sees_all_tables() {
        let agent = Agent::new(agent_data());
        let mut task = crate::tasks::TaskData::with_type(crate::tasks::TaskType::Task);
        task.task_id = "aaaa0001".to_string();
        agent.tasks_queue.put(task.clone());
        assert!(agent.owns_task("aaaa0001"));
        assert!(!agent.owns_task("aaaa0002"));

        agent.tasks_queue.pop_front();
        agent.running_tasks.insert("aaaa0001".to_string(), task);
        assert!(agent.owns_task("aaaa0001"));
    }
}
