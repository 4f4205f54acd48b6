pub mod agent;
pub mod fanout;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::database::Storage;
use crate::extender::{CommandArgs, Extender};
use crate::server::agent::{Agent, AgentData, PivotLink};
use crate::server::fanout::{ClientFanout, SyncPacket};
use crate::tasks::{AgentEvent, TaskData};
use crate::{Result, UmbraError};

/// Point-in-time view of one agent's task tables.
#[derive(Debug, Clone)]
pub struct TaskListing {
    pub queued: Vec<TaskData>,
    pub running: Vec<TaskData>,
    pub completed: Vec<TaskData>,
}

/// A started listener: maps the operator-chosen instance name back to the
/// module that runs it. The profile is retained for implant generation.
#[derive(Debug, Clone)]
pub struct ListenerInstance {
    pub name: String,
    pub registry_key: String,
    pub listener_type: String,
    pub protocol: String,
    pub profile: Vec<u8>,
}

/// Central owner of agent records, the module registry, started listeners
/// and the operator fan-out. Everything mutable is behind concurrent
/// containers; the registry itself is read-only after startup.
pub struct Teamserver {
    pub(crate) agents: DashMap<String, Arc<Agent>>,
    pub(crate) extender: Extender,
    pub(crate) listeners: DashMap<String, ListenerInstance>,
    pub(crate) fanout: ClientFanout,
    pub(crate) storage: Storage,
}

impl Teamserver {
    pub fn new(extender: Extender, storage: Storage) -> Self {
        Self {
            agents: DashMap::new(),
            extender,
            listeners: DashMap::new(),
            fanout: ClientFanout::new(),
            storage,
        }
    }

    pub fn extender(&self) -> &Extender {
        &self.extender
    }

    pub(crate) fn agent(&self, agent_id: &str) -> Result<Arc<Agent>> {
        self.agents
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| UmbraError::AgentNotFound(agent_id.to_string()))
    }

    // ----- listeners -----

    pub fn ts_listener_start(
        self: Arc<Self>,
        name: &str,
        registry_key: &str,
        profile: &[u8],
    ) -> Result<()> {
        if self.listeners.contains_key(name) {
            return Err(UmbraError::Config(format!(
                "listener name {} already in use",
                name
            )));
        }

        let info = self
            .extender
            .listener_info(registry_key)
            .ok_or_else(|| UmbraError::ModuleNotFound(registry_key.to_string()))?
            .clone();
        let module = self.extender.listener_module(registry_key)?;

        module.start(name, profile, Arc::clone(&self))?;

        self.listeners.insert(
            name.to_string(),
            ListenerInstance {
                name: name.to_string(),
                registry_key: registry_key.to_string(),
                listener_type: info.listener_type,
                protocol: info.protocol,
                profile: profile.to_vec(),
            },
        );
        tracing::info!(listener = %name, module = %registry_key, "listener started");
        Ok(())
    }

    pub fn ts_listener_stop(&self, name: &str) -> Result<()> {
        let (_, instance) = self
            .listeners
            .remove(name)
            .ok_or_else(|| UmbraError::ListenerNotFound(name.to_string()))?;
        let module = self.extender.listener_module(&instance.registry_key)?;
        module.stop(name)?;
        tracing::info!(listener = %name, "listener stopped");
        Ok(())
    }

    pub fn listener_type_by_name(&self, name: &str) -> Result<String> {
        self.listeners
            .get(name)
            .map(|entry| entry.listener_type.clone())
            .ok_or_else(|| UmbraError::ListenerNotFound(name.to_string()))
    }

    // ----- agents -----

    pub fn ts_agent_is_exists(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Register an agent from its first INIT beacon. `agent_watermark` is the
    /// 8-hex module watermark from the wire; the matching agent module parses
    /// the beacon blob into host identity.
    pub fn ts_agent_create(
        &self,
        agent_watermark: &str,
        agent_id: &str,
        beacon: &[u8],
        listener_name: &str,
        external_ip: &str,
    ) -> Result<()> {
        if self.agents.contains_key(agent_id) {
            tracing::debug!(agent_id = %agent_id, "agent already registered");
            return Ok(());
        }
        if !self.listeners.contains_key(listener_name) {
            return Err(UmbraError::ListenerNotFound(listener_name.to_string()));
        }

        let module_name = self
            .extender
            .agent_name_by_watermark(agent_watermark)
            .ok_or_else(|| UmbraError::ModuleNotFound(agent_watermark.to_string()))?;

        let mut data = self.extender.agent_create(&module_name, beacon)?;
        data.id = agent_id.to_string();
        data.name = module_name;
        data.watermark = agent_watermark.to_string();
        data.listener = listener_name.to_string();
        data.external_ip = external_ip.to_string();

        tracing::info!(
            agent_id = %agent_id,
            module = %data.name,
            listener = %listener_name,
            computer = %data.computer,
            "agent registered"
        );
        self.agents
            .insert(agent_id.to_string(), Arc::new(Agent::new(data)));
        Ok(())
    }

    /// Register a prebuilt agent record directly (tests, explicit import).
    /// The same invariants hold: the listener instance and agent module must
    /// both be registered.
    pub fn ts_agent_reg(&self, data: AgentData) -> Result<()> {
        if !self.listeners.contains_key(&data.listener) {
            return Err(UmbraError::ListenerNotFound(data.listener.clone()));
        }
        self.extender.agent_module(&data.name)?;
        self.agents
            .insert(data.id.clone(), Arc::new(Agent::new(data)));
        Ok(())
    }

    pub fn ts_agent_is_active(&self, agent_id: &str) -> Result<bool> {
        Ok(self.agent(agent_id)?.is_active())
    }

    pub fn ts_agent_mark(&self, agent_id: &str) -> Result<String> {
        Ok(self.agent(agent_id)?.mark())
    }

    pub fn ts_agent_set_mark(&self, agent_id: &str, mark: &str) -> Result<()> {
        let agent = self.agent(agent_id)?;
        agent.set_mark(mark);
        if !mark.is_empty() {
            tracing::info!(agent_id = %agent_id, mark = %mark, "agent marked");
        }
        Ok(())
    }

    pub fn ts_agent_remove(&self, agent_id: &str) -> Result<()> {
        self.agents
            .remove(agent_id)
            .ok_or_else(|| UmbraError::AgentNotFound(agent_id.to_string()))?;
        tracing::info!(agent_id = %agent_id, "agent removed");
        Ok(())
    }

    pub fn agent_data(&self, agent_id: &str) -> Result<AgentData> {
        Ok(self.agent(agent_id)?.data())
    }

    /// Snapshot of an agent's task tables for operator listings.
    pub fn ts_task_list(&self, agent_id: &str) -> Result<TaskListing> {
        let agent = self.agent(agent_id)?;
        Ok(TaskListing {
            queued: agent.tasks_queue.snapshot(),
            running: agent
                .running_tasks
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
            completed: agent
                .completed_tasks
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        })
    }

    /// Run an operator command through the agent's module; the produced task
    /// enters the router.
    pub fn ts_agent_command(
        &self,
        client: &str,
        cmdline: &str,
        agent_id: &str,
        args: &CommandArgs,
    ) -> Result<()> {
        let data = self.agent(agent_id)?.data();
        let task = self.extender.agent_command(client, cmdline, &data, args)?;
        self.task_create(agent_id, cmdline, client, task);
        Ok(())
    }

    /// Build an implant for the given module against a started listener; the
    /// listener's stored profile is handed to the module.
    pub fn ts_agent_generate(
        &self,
        agent_name: &str,
        config: &str,
        os: agent::OsKind,
        listener_name: &str,
    ) -> Result<(Vec<u8>, String)> {
        let profile = self
            .listeners
            .get(listener_name)
            .map(|entry| entry.profile.clone())
            .ok_or_else(|| UmbraError::ListenerNotFound(listener_name.to_string()))?;
        self.extender
            .agent_generate(agent_name, config, os, listener_name, &profile)
    }

    /// Assemble the next byte-budgeted batch for an agent and have its module
    /// pack and encrypt it. Empty batch yields empty bytes.
    pub fn ts_agent_get_hosted_tasks(&self, agent_id: &str, max_size: usize) -> Result<Vec<u8>> {
        let data = self.agent(agent_id)?.data();
        let tasks = self.task_get_available(agent_id, max_size)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.extender.agent_pack_data(&data, &tasks, max_size)
    }

    /// Feed one reply frame from the transport through the agent's module and
    /// route the resulting events.
    pub fn ts_agent_process_data(&self, agent_id: &str, packed: &[u8]) -> Result<()> {
        let data = self.agent(agent_id)?.data();
        let events = self.extender.agent_process_data(&data, packed)?;
        for event in events {
            match event {
                AgentEvent::TaskUpdate(update) => self.task_update(agent_id, update),
                AgentEvent::TaskCreate(task) => {
                    let cmdline = task.cmdline.clone();
                    let client = task.client.clone();
                    self.task_create(agent_id, &cmdline, &client, task);
                }
            }
        }
        Ok(())
    }

    // ----- pivots -----

    /// Link a child agent behind a parent. Rejects links that would make the
    /// pivot graph cyclic, otherwise batch assembly would never terminate.
    pub fn ts_pivot_create(
        &self,
        pivot_id: &str,
        parent_agent_id: &str,
        child_agent_id: &str,
    ) -> Result<()> {
        let parent = self.agent(parent_agent_id)?;
        self.agent(child_agent_id)?;

        if parent_agent_id == child_agent_id
            || self.pivot_reachable(child_agent_id, parent_agent_id)
        {
            return Err(UmbraError::Config(format!(
                "pivot {} would create a cycle",
                pivot_id
            )));
        }

        parent.pivot_children.put(PivotLink {
            pivot_id: pivot_id.to_string(),
            parent_agent_id: parent_agent_id.to_string(),
            child_agent_id: child_agent_id.to_string(),
        });
        tracing::info!(
            pivot_id = %pivot_id,
            parent = %parent_agent_id,
            child = %child_agent_id,
            "pivot linked"
        );
        Ok(())
    }

    pub fn ts_pivot_remove(&self, pivot_id: &str) -> Result<()> {
        for entry in self.agents.iter() {
            if entry
                .value()
                .pivot_children
                .remove_where(|link| link.pivot_id == pivot_id)
                .is_some()
            {
                return Ok(());
            }
        }
        Err(UmbraError::TaskNotFound(pivot_id.to_string()))
    }

    /// True when `target` is reachable from `from` through pivot links.
    fn pivot_reachable(&self, from: &str, target: &str) -> bool {
        let Ok(agent) = self.agent(from) else {
            return false;
        };
        for link in agent.pivot_children.snapshot() {
            if link.child_agent_id == target
                || self.pivot_reachable(&link.child_agent_id, target)
            {
                return true;
            }
        }
        false
    }

    // ----- operator clients -----

    /// Attach an operator client to the fan-out and replay buffered console
    /// history so late joiners see past task output.
    pub fn ts_client_connect(&self, client_id: &str) -> mpsc::UnboundedReceiver<SyncPacket> {
        let rx = self.fanout.connect(client_id);
        for entry in self.agents.iter() {
            for packet in entry.value().out_console.snapshot() {
                self.fanout.send_to(client_id, packet);
            }
        }
        rx
    }

    pub fn ts_client_disconnect(&self, client_id: &str) {
        self.fanout.disconnect(client_id);
    }

    pub fn ts_sync_all_clients(&self, packet: &SyncPacket) {
        self.fanout.sync_all(packet);
    }

    // ----- gated agent-module operations -----

    pub fn ts_agent_download_change_state(
        &self,
        agent_id: &str,
        new_state: u32,
        file_id: &str,
    ) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender
            .agent_download_change_state(&listener_type, &data, new_state, file_id)
    }

    pub fn ts_agent_browser_disks(&self, agent_id: &str) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender.agent_browser_disks(&listener_type, &data)
    }

    pub fn ts_agent_browser_process(&self, agent_id: &str) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender.agent_browser_process(&listener_type, &data)
    }

    pub fn ts_agent_browser_files(&self, agent_id: &str, path: &str) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender
            .agent_browser_files(&listener_type, &data, path)
    }

    pub fn ts_agent_browser_upload(
        &self,
        agent_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender
            .agent_browser_upload(&listener_type, &data, path, content)
    }

    pub fn ts_agent_browser_download(&self, agent_id: &str, path: &str) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender
            .agent_browser_download(&listener_type, &data, path)
    }

    pub fn ts_agent_ctx_exit(&self, agent_id: &str) -> Result<TaskData> {
        let data = self.agent(agent_id)?.data();
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender.agent_ctx_exit(&listener_type, &data)
    }

    pub(crate) fn ts_agent_job_kill(&self, data: &AgentData, task_id: &str) -> Result<TaskData> {
        let listener_type = self.listener_type_by_name(&data.listener)?;
        self.extender.agent_job_kill(&listener_type, data, task_id)
    }
}
