use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::extender::{AgentModule, CommandArgs, FeatureSet, SupportMatrix};
use crate::server::agent::{AgentData, OsKind};
use crate::tasks::{AgentEvent, ConsoleMessage, TaskData, TaskType};
use crate::{Result, UmbraError};

/// `InitPlugin` equivalent for the built-in beacon agent family.
pub fn init_plugin(_module_dir: &Path, watermark: &str) -> Arc<dyn AgentModule> {
    Arc::new(BeaconModule::new(watermark))
}

/// First-party beacon agent module. The wire key is derived from the
/// watermark; every batch and reply crosses the transport as
/// AES-256-GCM-wrapped MsgPack.
pub struct BeaconModule {
    watermark: String,
    key: [u8; crypto::KEY_LEN],
    supports: SupportMatrix,
}

/// Identity blob carried in the INIT beacon.
#[derive(Debug, Serialize, Deserialize)]
pub struct BeaconInfo {
    pub computer: String,
    pub username: String,
    pub os: u32,
}

/// One task on the wire, stripped to what the agent needs.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireTask {
    pub id: String,
    pub data: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskBatch {
    pub tasks: Vec<WireTask>,
}

/// One result in a reply frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireReply {
    pub task_id: String,
    pub message_type: u32,
    pub message: String,
    pub clear_text: String,
    pub completed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyBatch {
    pub replies: Vec<WireReply>,
}

/// Child batch relayed through a pivot parent.
#[derive(Debug, Serialize, Deserialize)]
pub struct PivotFrame {
    pub pivot_id: String,
    pub data: Bytes,
}

/// Command payload executed by the agent. One struct covers every command;
/// the agent dispatches on `name`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl CommandSpec {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| UmbraError::Decode(e.to_string()))
    }
}

/// Implant build profile emitted by `generate`.
#[derive(Debug, Serialize, Deserialize)]
struct BuildProfile {
    watermark: String,
    listener: String,
    profile: Bytes,
    sleep_ms: u64,
}

impl BeaconModule {
    pub fn new(watermark: &str) -> Self {
        let mut by_os = std::collections::HashMap::new();
        by_os.insert(OsKind::Windows, FeatureSet::all());
        by_os.insert(OsKind::Linux, FeatureSet::all());
        by_os.insert(OsKind::Mac, FeatureSet::all());

        let mut supports = SupportMatrix::new();
        supports.insert("tcp".to_string(), by_os);

        Self {
            watermark: watermark.to_string(),
            key: crypto::derive_key(watermark.as_bytes()),
            supports,
        }
    }

    pub fn watermark(&self) -> &str {
        &self.watermark
    }

    fn task_with_payload(task_type: TaskType, spec: &CommandSpec) -> Result<TaskData> {
        let mut task = TaskData::with_type(task_type);
        task.sync = true;
        task.data = spec.encode()?;
        Ok(task)
    }

    fn arg_str<'a>(args: &'a CommandArgs, key: &str) -> Result<&'a str> {
        args.get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| UmbraError::Command(format!("missing string argument {:?}", key)))
    }

    fn arg_u64(args: &CommandArgs, key: &str) -> Result<u64> {
        args.get(key)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| UmbraError::Command(format!("missing integer argument {:?}", key)))
    }
}

impl AgentModule for BeaconModule {
    fn supports(&self) -> &SupportMatrix {
        &self.supports
    }

    fn generate(
        &self,
        config: &str,
        os: OsKind,
        listener_name: &str,
        listener_profile: &[u8],
    ) -> Result<(Vec<u8>, String)> {
        let options: serde_json::Value = if config.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(config).map_err(|e| UmbraError::Command(e.to_string()))?
        };
        let sleep_ms = options
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(5000);

        let profile = BuildProfile {
            watermark: self.watermark.clone(),
            listener: listener_name.to_string(),
            profile: Bytes::copy_from_slice(listener_profile),
            sleep_ms,
        };
        let encoded =
            rmp_serde::to_vec_named(&profile).map_err(|e| UmbraError::Decode(e.to_string()))?;

        let suffix = match os {
            OsKind::Windows => "windows",
            OsKind::Linux => "linux",
            OsKind::Mac => "mac",
            OsKind::Unknown => "unknown",
        };
        Ok((encoded, format!("beacon_{}.bin", suffix)))
    }

    fn create_agent(&self, beacon: &[u8]) -> Result<AgentData> {
        let info: BeaconInfo =
            rmp_serde::from_slice(beacon).map_err(|e| UmbraError::Decode(e.to_string()))?;
        Ok(AgentData {
            id: String::new(),
            name: String::new(),
            watermark: self.watermark.clone(),
            listener: String::new(),
            os: OsKind::from_u32(info.os),
            computer: info.computer,
            username: info.username,
            impersonated: None,
            external_ip: String::new(),
        })
    }

    fn command(
        &self,
        _client: &str,
        cmdline: &str,
        _agent: &AgentData,
        args: &CommandArgs,
    ) -> Result<TaskData> {
        let command = cmdline.split_whitespace().next().unwrap_or("");
        match command {
            "shell" => {
                let mut spec = CommandSpec::named("shell");
                spec.cmd = Some(Self::arg_str(args, "cmd")?.to_string());
                Self::task_with_payload(TaskType::Job, &spec)
            }
            "pwd" => Self::task_with_payload(TaskType::Task, &CommandSpec::named("pwd")),
            "sleep" => {
                let mut spec = CommandSpec::named("sleep");
                spec.ms = Some(Self::arg_u64(args, "ms")?);
                Self::task_with_payload(TaskType::Task, &spec)
            }
            "exit" => Self::task_with_payload(TaskType::Task, &CommandSpec::named("exit")),
            other => Err(UmbraError::Command(format!("unknown command {:?}", other))),
        }
    }

    fn process_data(&self, _agent: &AgentData, packed: &[u8]) -> Result<Vec<AgentEvent>> {
        let plain = crypto::decrypt_data(&self.key, packed)?;
        let batch: ReplyBatch =
            rmp_serde::from_slice(&plain).map_err(|e| UmbraError::Decode(e.to_string()))?;

        let now = Utc::now().timestamp();
        let mut events = Vec::with_capacity(batch.replies.len());
        for reply in batch.replies {
            let mut update = TaskData::with_type(TaskType::Task);
            update.task_id = reply.task_id;
            update.message_type = match reply.message_type {
                1 => ConsoleMessage::Success,
                2 => ConsoleMessage::Error,
                _ => ConsoleMessage::Info,
            };
            update.message = reply.message;
            update.clear_text = reply.clear_text;
            update.completed = reply.completed;
            update.finish_date = now;
            events.push(AgentEvent::TaskUpdate(update));
        }
        Ok(events)
    }

    fn pack_tasks(
        &self,
        _agent: &AgentData,
        tasks: &[TaskData],
        _max_size: usize,
    ) -> Result<Vec<u8>> {
        let batch = TaskBatch {
            tasks: tasks
                .iter()
                .map(|t| WireTask {
                    id: t.task_id.clone(),
                    data: Bytes::copy_from_slice(&t.data),
                })
                .collect(),
        };
        let plain =
            rmp_serde::to_vec_named(&batch).map_err(|e| UmbraError::Decode(e.to_string()))?;
        Ok(crypto::encrypt_data(&self.key, &plain)?)
    }

    fn pivot_pack(&self, pivot_id: &str, data: &[u8]) -> Result<TaskData> {
        let frame = PivotFrame {
            pivot_id: pivot_id.to_string(),
            data: Bytes::copy_from_slice(data),
        };
        let mut task = TaskData::with_type(TaskType::Task);
        task.task_id = crypto::generate_uid(crate::tasks::TASK_ID_LEN);
        task.data =
            rmp_serde::to_vec_named(&frame).map_err(|e| UmbraError::Decode(e.to_string()))?;
        Ok(task)
    }

    fn download_change_state(
        &self,
        _agent: &AgentData,
        new_state: u32,
        file_id: &str,
    ) -> Result<TaskData> {
        let mut spec = CommandSpec::named("download-state");
        spec.state = Some(new_state);
        spec.file_id = Some(file_id.to_string());
        Self::task_with_payload(TaskType::Task, &spec)
    }

    fn browser_disks(&self, _agent: &AgentData) -> Result<TaskData> {
        Self::task_with_payload(TaskType::Browser, &CommandSpec::named("disks"))
    }

    fn browser_process(&self, _agent: &AgentData) -> Result<TaskData> {
        Self::task_with_payload(TaskType::Browser, &CommandSpec::named("ps"))
    }

    fn browser_files(&self, _agent: &AgentData, path: &str) -> Result<TaskData> {
        let mut spec = CommandSpec::named("ls");
        spec.path = Some(path.to_string());
        Self::task_with_payload(TaskType::Browser, &spec)
    }

    fn browser_upload(&self, _agent: &AgentData, path: &str, content: &[u8]) -> Result<TaskData> {
        let mut spec = CommandSpec::named("upload");
        spec.path = Some(path.to_string());
        spec.content = Some(Bytes::copy_from_slice(content));
        Self::task_with_payload(TaskType::Browser, &spec)
    }

    fn browser_download(&self, _agent: &AgentData, path: &str) -> Result<TaskData> {
        let mut spec = CommandSpec::named("download");
        spec.path = Some(path.to_string());
        Self::task_with_payload(TaskType::Browser, &spec)
    }

    fn ctx_exit(&self, _agent: &AgentData) -> Result<TaskData> {
        Self::task_with_payload(TaskType::Task, &CommandSpec::named("exit"))
    }

    fn job_kill(&self, task_id: &str) -> Result<TaskData> {
        let mut spec = CommandSpec::named("job-kill");
        spec.task = Some(task_id.to_string());
        Self::task_with_payload(TaskType::Task, &spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentData {
        AgentData {
            id: "0a0b0c0d".to_string(),
            name: "beacon".to_string(),
            watermark: "11223344".to_string(),
            listener: "tcp-main".to_string(),
            os: OsKind::Linux,
            computer: "host".to_string(),
            username: "svc".to_string(),
            impersonated: None,
            external_ip: "10.0.0.2".to_string(),
        }
    }

    #[test]
    fn create_agent_parses_beacon() {
        let module = BeaconModule::new("11223344");
        let beacon = rmp_serde::to_vec_named(&BeaconInfo {
            computer: "ws01".to_string(),
            username: "alice".to_string(),
            os: 2,
        })
        .unwrap();
        let data = module.create_agent(&beacon).unwrap();
        assert_eq!(data.computer, "ws01");
        assert_eq!(data.username, "alice");
        assert_eq!(data.os, OsKind::Linux);
    }

    #[test]
    fn pack_then_process_roundtrip() {
        let module = BeaconModule::new("11223344");
        let mut task = TaskData::with_type(TaskType::Task);
        task.task_id = "aaaa0001".to_string();
        task.data = vec![1, 2, 3];

        let packed = module.pack_tasks(&agent(), &[task], 1024).unwrap();
        let plain = crypto::decrypt_data(&crypto::derive_key(b"11223344"), &packed).unwrap();
        let batch: TaskBatch = rmp_serde::from_slice(&plain).unwrap();
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].id, "aaaa0001");
    }

    #[test]
    fn command_validates_arguments() {
        let module = BeaconModule::new("11223344");
        let args = CommandArgs::new();
        let err = module
            .command("op", "shell", &agent(), &args)
            .unwrap_err();
        assert!(matches!(err, UmbraError::Command(_)));

        let mut args = CommandArgs::new();
        args.insert("cmd".to_string(), serde_json::json!("id"));
        let task = module.command("op", "shell id", &agent(), &args).unwrap();
        assert_eq!(task.task_type, TaskType::Job);
        assert!(task.sync);
    }

    #[test]
    fn unknown_command_rejected() {
        let module = BeaconModule::new("11223344");
        let err = module
            .command("op", "frobnicate", &agent(), &CommandArgs::new())
            .unwrap_err();
        assert!(matches!(err, UmbraError::Command(_)));
    }

    #[test]
    fn pivot_pack_wraps_child_bytes() {
        let module = BeaconModule::new("11223344");
        let task = module.pivot_pack("7", b"child-batch").unwrap();
        assert_eq!(task.task_id.len(), 8);
        let frame: PivotFrame = rmp_serde::from_slice(&task.data).unwrap();
        assert_eq!(frame.pivot_id, "7");
        assert_eq!(frame.data.as_ref(), b"child-batch");
    }
}
