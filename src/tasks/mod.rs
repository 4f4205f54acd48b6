pub mod queue;
pub mod router;

use serde::{Deserialize, Serialize};
use std::fmt;

pub const TASK_ID_LEN: usize = 8;

/// Transport batch ceiling used by the reference listener pump.
pub const HOSTED_TASKS_BUDGET: usize = 0x1900000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Browser,
    Job,
    Tunnel,
    ProxyData,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Browser => "browser",
            Self::Job => "job",
            Self::Tunnel => "tunnel",
            Self::ProxyData => "proxy_data",
        };
        write!(f, "{}", s)
    }
}

/// Console classification carried by task output. `Error` is sticky for
/// job tasks: once set it is never downgraded by later updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleMessage {
    #[default]
    Info,
    Success,
    Error,
}

impl fmt::Display for ConsoleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub task_id: String,
    pub agent_id: String,
    pub client: String,
    pub cmdline: String,
    pub computer: String,
    pub user: String,
    pub start_date: i64,
    pub finish_date: i64,
    pub task_type: TaskType,
    pub sync: bool,
    pub completed: bool,
    pub data: Vec<u8>,
    pub message: String,
    pub clear_text: String,
    pub message_type: ConsoleMessage,
}

impl TaskData {
    pub fn with_type(task_type: TaskType) -> Self {
        Self {
            task_id: String::new(),
            agent_id: String::new(),
            client: String::new(),
            cmdline: String::new(),
            computer: String::new(),
            user: String::new(),
            start_date: 0,
            finish_date: 0,
            task_type,
            sync: false,
            completed: false,
            data: Vec::new(),
            message: String::new(),
            clear_text: String::new(),
            message_type: ConsoleMessage::Info,
        }
    }
}

/// What an agent module yields when it unpacks a reply from the wire.
/// The teamserver feeds these back into the task router.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    TaskUpdate(TaskData),
    TaskCreate(TaskData),
}
