use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::server::agent::{AgentData, OsKind};
use crate::server::Teamserver;
use crate::tasks::{AgentEvent, TaskData};
use crate::{Result, UmbraError};

/// Per-command argument bag; each agent module destructures it against its
/// own schema and surfaces validation failures as command errors.
pub type CommandArgs = serde_json::Map<String, serde_json::Value>;

/// Feature bits gating the optional agent-module operations per
/// (listener type, operating system).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    pub downloads_state: bool,
    pub file_browser: bool,
    pub file_browser_upload: bool,
    pub file_browser_download: bool,
    pub file_browser_disks: bool,
    pub process_browser: bool,
    pub sessions_menu_exit: bool,
    pub tasks_job_kill: bool,
}

impl FeatureSet {
    pub fn all() -> Self {
        Self {
            downloads_state: true,
            file_browser: true,
            file_browser_upload: true,
            file_browser_download: true,
            file_browser_disks: true,
            process_browser: true,
            sessions_menu_exit: true,
            tasks_job_kill: true,
        }
    }
}

pub type SupportMatrix = HashMap<String, HashMap<OsKind, FeatureSet>>;

/// Capability object implemented by agent modules. The registry treats it
/// as opaque; the optional operations are only reachable through the
/// support-matrix gate in the extender.
pub trait AgentModule: Send + Sync {
    fn supports(&self) -> &SupportMatrix;

    fn generate(
        &self,
        config: &str,
        os: OsKind,
        listener_name: &str,
        listener_profile: &[u8],
    ) -> Result<(Vec<u8>, String)>;

    fn create_agent(&self, beacon: &[u8]) -> Result<AgentData>;

    fn command(
        &self,
        client: &str,
        cmdline: &str,
        agent: &AgentData,
        args: &CommandArgs,
    ) -> Result<TaskData>;

    /// Decrypt and unpack one reply from the wire into task events.
    fn process_data(&self, agent: &AgentData, packed: &[u8]) -> Result<Vec<AgentEvent>>;

    /// Pack and encrypt an outbound batch assembled by the router.
    fn pack_tasks(&self, agent: &AgentData, tasks: &[TaskData], max_size: usize)
        -> Result<Vec<u8>>;

    /// Wrap a child agent's packed batch for relay through a pivot.
    fn pivot_pack(&self, pivot_id: &str, data: &[u8]) -> Result<TaskData>;

    fn download_change_state(
        &self,
        _agent: &AgentData,
        _new_state: u32,
        _file_id: &str,
    ) -> Result<TaskData> {
        Err(UmbraError::NotSupported("DownloadChangeState"))
    }

    fn browser_disks(&self, _agent: &AgentData) -> Result<TaskData> {
        Err(UmbraError::NotSupported("BrowserDisks"))
    }

    fn browser_process(&self, _agent: &AgentData) -> Result<TaskData> {
        Err(UmbraError::NotSupported("ProcessBrowser"))
    }

    fn browser_files(&self, _agent: &AgentData, _path: &str) -> Result<TaskData> {
        Err(UmbraError::NotSupported("FileBrowser"))
    }

    fn browser_upload(&self, _agent: &AgentData, _path: &str, _content: &[u8]) -> Result<TaskData> {
        Err(UmbraError::NotSupported("FileBrowserUpload"))
    }

    fn browser_download(&self, _agent: &AgentData, _path: &str) -> Result<TaskData> {
        Err(UmbraError::NotSupported("FileBrowserDownload"))
    }

    fn ctx_exit(&self, _agent: &AgentData) -> Result<TaskData> {
        Err(UmbraError::NotSupported("SessionsMenuExit"))
    }

    fn job_kill(&self, _task_id: &str) -> Result<TaskData> {
        Err(UmbraError::NotSupported("TasksJobKill"))
    }
}

/// Capability object implemented by listener modules. The teamserver handle
/// is threaded in at start time; modules hold no global state.
pub trait ListenerModule: Send + Sync {
    /// Parse the profile, bind, and spawn the accept loop. Must be called
    /// from within a tokio runtime.
    fn start(&self, name: &str, profile: &[u8], ts: Arc<Teamserver>) -> Result<()>;

    fn stop(&self, name: &str) -> Result<()>;

    fn active(&self, name: &str) -> bool;
}

/// `InitPlugin` equivalent for statically linked modules: the factory kind
/// must match the config's `extender_type`.
pub enum ModuleFactory {
    Listener(fn(module_dir: &std::path::Path, state_dir: &std::path::Path) -> Arc<dyn ListenerModule>),
    Agent(fn(module_dir: &std::path::Path, watermark: &str) -> Arc<dyn AgentModule>),
}
