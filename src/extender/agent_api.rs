use super::{Extender, FeatureSet, SupportMatrix};
use crate::server::agent::{AgentData, OsKind};
use crate::tasks::{AgentEvent, TaskData};
use crate::{Result, UmbraError};

/// Check the (listener type, OS) gate for an optional operation. Checks run
/// in order: listener-type entry, OS entry, feature bit.
fn check_support(
    matrix: &SupportMatrix,
    listener_type: &str,
    os: OsKind,
    feature: fn(&FeatureSet) -> bool,
    name: &'static str,
) -> Result<()> {
    let by_os = matrix
        .get(listener_type)
        .ok_or(UmbraError::NotSupported(name))?;
    let features = by_os.get(&os).ok_or(UmbraError::NotSupported(name))?;
    if !feature(features) {
        return Err(UmbraError::NotSupported(name));
    }
    Ok(())
}

impl Extender {
    pub fn agent_generate(
        &self,
        agent_name: &str,
        config: &str,
        os: OsKind,
        listener_name: &str,
        listener_profile: &[u8],
    ) -> Result<(Vec<u8>, String)> {
        self.agent_module(agent_name)?
            .generate(config, os, listener_name, listener_profile)
    }

    pub fn agent_create(&self, agent_name: &str, beacon: &[u8]) -> Result<AgentData> {
        self.agent_module(agent_name)?.create_agent(beacon)
    }

    pub fn agent_command(
        &self,
        client: &str,
        cmdline: &str,
        agent: &AgentData,
        args: &super::CommandArgs,
    ) -> Result<TaskData> {
        self.agent_module(&agent.name)?
            .command(client, cmdline, agent, args)
    }

    pub fn agent_process_data(&self, agent: &AgentData, packed: &[u8]) -> Result<Vec<AgentEvent>> {
        self.agent_module(&agent.name)?.process_data(agent, packed)
    }

    pub fn agent_pack_data(
        &self,
        agent: &AgentData,
        tasks: &[TaskData],
        max_size: usize,
    ) -> Result<Vec<u8>> {
        self.agent_module(&agent.name)?
            .pack_tasks(agent, tasks, max_size)
    }

    pub fn agent_pivot_pack(
        &self,
        agent_name: &str,
        pivot_id: &str,
        data: &[u8],
    ) -> Result<TaskData> {
        self.agent_module(agent_name)?.pivot_pack(pivot_id, data)
    }

    pub fn agent_download_change_state(
        &self,
        listener_type: &str,
        agent: &AgentData,
        new_state: u32,
        file_id: &str,
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.downloads_state,
            "DownloadChangeState",
        )?;
        module.download_change_state(agent, new_state, file_id)
    }

    pub fn agent_browser_disks(&self, listener_type: &str, agent: &AgentData) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.file_browser_disks,
            "BrowserDisks",
        )?;
        module.browser_disks(agent)
    }

    pub fn agent_browser_process(
        &self,
        listener_type: &str,
        agent: &AgentData,
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.process_browser,
            "ProcessBrowser",
        )?;
        module.browser_process(agent)
    }

    pub fn agent_browser_files(
        &self,
        listener_type: &str,
        agent: &AgentData,
        path: &str,
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.file_browser,
            "FileBrowser",
        )?;
        module.browser_files(agent, path)
    }

    pub fn agent_browser_upload(
        &self,
        listener_type: &str,
        agent: &AgentData,
        path: &str,
        content: &[u8],
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.file_browser_upload,
            "FileBrowserUpload",
        )?;
        module.browser_upload(agent, path, content)
    }

    pub fn agent_browser_download(
        &self,
        listener_type: &str,
        agent: &AgentData,
        path: &str,
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.file_browser_download,
            "FileBrowserDownload",
        )?;
        module.browser_download(agent, path)
    }

    pub fn agent_ctx_exit(&self, listener_type: &str, agent: &AgentData) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.sessions_menu_exit,
            "SessionsMenuExit",
        )?;
        module.ctx_exit(agent)
    }

    pub fn agent_job_kill(
        &self,
        listener_type: &str,
        agent: &AgentData,
        task_id: &str,
    ) -> Result<TaskData> {
        let module = self.agent_module(&agent.name)?;
        check_support(
            module.supports(),
            listener_type,
            agent.os,
            |f| f.tasks_job_kill,
            "TasksJobKill",
        )?;
        module.job_kill(task_id)
    }
}
