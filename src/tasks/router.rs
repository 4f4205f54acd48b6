use chrono::Utc;

use crate::crypto;
use crate::server::agent::Agent;
use crate::server::fanout::SyncPacket;
use crate::server::Teamserver;
use crate::tasks::{ConsoleMessage, TaskData, TaskType, TASK_ID_LEN};
use crate::{Result, UmbraError};

impl Teamserver {
    pub fn task_running_exists(&self, agent_id: &str, task_id: &str) -> bool {
        match self.agent(agent_id) {
            Ok(agent) => agent.running_tasks.contains_key(task_id),
            Err(_) => {
                tracing::error!(agent_id = %agent_id, "task running check: agent not found");
                false
            }
        }
    }

    /// Route a freshly built task. Unknown or inactive agents drop the task;
    /// the caller already got its answer through the command path.
    pub fn task_create(&self, agent_id: &str, cmdline: &str, client: &str, mut task: TaskData) {
        let Ok(agent) = self.agent(agent_id) else {
            tracing::error!(agent_id = %agent_id, "task create: agent not found");
            return;
        };
        if !agent.is_active() {
            return;
        }

        if task.task_id.is_empty() {
            task.task_id = crypto::generate_uid(TASK_ID_LEN);
        }
        task.agent_id = agent_id.to_string();
        task.cmdline = cmdline.to_string();
        task.client = client.to_string();

        let data = agent.data();
        task.computer = data.computer.clone();
        task.user = data.username.clone();
        if let Some(impersonated) = &data.impersonated {
            task.user.push_str(&format!(" [{}]", impersonated));
        }
        task.start_date = Utc::now().timestamp();
        if task.completed {
            task.finish_date = task.start_date;
        }

        match task.task_type {
            TaskType::Task | TaskType::Job => {
                if task.sync {
                    self.fanout.sync_all(&SyncPacket::task_sync(&task));

                    let console = SyncPacket::console_task_sync(&task);
                    self.fanout.sync_all(&console);
                    agent.out_console.put(console.clone());
                    self.storage.console_insert(agent_id, &console);
                }
                agent.tasks_queue.put(task);
            }

            TaskType::Browser => {
                agent.tasks_queue.put(task);
            }

            // Tunnel setup tasks never transit the queue: they land directly
            // in the running or completed table.
            TaskType::Tunnel => {
                if task.sync {
                    if task.completed {
                        agent
                            .completed_tasks
                            .insert(task.task_id.clone(), task.clone());
                    } else {
                        agent
                            .running_tasks
                            .insert(task.task_id.clone(), task.clone());
                    }

                    self.fanout.sync_all(&SyncPacket::task_sync(&task));

                    let console = SyncPacket::console_task_sync(&task);
                    self.fanout.sync_all(&console);
                    agent.out_console.put(console.clone());
                    self.storage.console_insert(agent_id, &console);

                    if task.completed {
                        self.storage.task_insert(&task);
                    }
                }
            }

            // No handler yet; kept as an explicit drop until semantics exist.
            TaskType::ProxyData => {
                tracing::debug!(agent_id = %agent_id, "proxy data task dropped");
            }
        }
    }

    /// Merge a result coming back from the agent into the running task and
    /// re-home it. An update for a task that is not running is ignored.
    pub fn task_update(&self, agent_id: &str, update: TaskData) {
        let Ok(agent) = self.agent(agent_id) else {
            tracing::error!(agent_id = %agent_id, "task update: agent not found");
            return;
        };

        let Some((_, mut task)) = agent.running_tasks.remove(&update.task_id) else {
            return;
        };

        task.data.clear();
        task.finish_date = update.finish_date;
        task.completed = update.completed;

        match task.task_type {
            TaskType::Job => {
                // Error classification is sticky for jobs.
                if task.message_type != ConsoleMessage::Error {
                    task.message_type = update.message_type;
                }

                let kept_message = if task.message.is_empty() {
                    update.message.clone()
                } else {
                    task.message.clone()
                };
                let prior_text = task.clear_text.clone();

                // The packets carry the delta, the stored task the
                // accumulated output.
                task.message = update.message.clone();
                task.clear_text = update.clear_text.clone();
                let packet = SyncPacket::task_update(&task);
                let console = SyncPacket::console_task_upd(&task);

                task.message = kept_message;
                task.clear_text = prior_text + &update.clear_text;

                if task.sync {
                    self.rehome(&agent, &task);

                    self.fanout.sync_all(&packet);
                    self.fanout.sync_all(&console);
                    agent.out_console.put(console.clone());
                    self.storage.console_insert(agent_id, &console);
                }
            }

            TaskType::Tunnel => {
                let kept_message = if task.message.is_empty() {
                    update.message.clone()
                } else {
                    task.message.clone()
                };
                let prior_text = task.clear_text.clone();

                task.message_type = update.message_type;
                task.message = update.message.clone();
                task.clear_text = update.clear_text.clone();
                let packet = SyncPacket::task_update(&task);
                let console = SyncPacket::console_task_upd(&task);

                task.message = kept_message;
                task.clear_text = prior_text + &update.clear_text;

                if task.sync {
                    self.rehome(&agent, &task);

                    self.fanout.sync_all(&packet);
                    self.fanout.sync_all(&console);
                    agent.out_console.put(console.clone());
                    self.storage.console_insert(agent_id, &console);
                }
            }

            TaskType::Task | TaskType::Browser => {
                task.message_type = update.message_type;
                task.message = update.message;
                task.clear_text = update.clear_text;

                if task.sync {
                    self.rehome(&agent, &task);

                    self.fanout.sync_all(&SyncPacket::task_update(&task));

                    let console = SyncPacket::console_task_upd(&task);
                    self.fanout.sync_all(&console);
                    agent.out_console.put(console.clone());
                    self.storage.console_insert(agent_id, &console);
                }
            }

            TaskType::ProxyData => {}
        }
    }

    fn rehome(&self, agent: &Agent, task: &TaskData) {
        if task.completed {
            agent
                .completed_tasks
                .insert(task.task_id.clone(), task.clone());
            self.storage.task_insert(task);
        } else {
            agent
                .running_tasks
                .insert(task.task_id.clone(), task.clone());
        }
    }

    /// Cancel a task. Queued tasks are removed outright; a running job is
    /// asked to die through the module's job-kill path; any other running
    /// task is a conflict.
    pub fn task_stop(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let agent = self.agent(agent_id)?;

        if let Some(task) = agent.tasks_queue.remove_where(|t| t.task_id == task_id) {
            self.fanout.sync_all(&SyncPacket::task_remove(&task));
            return Ok(());
        }

        let task_type = match agent.running_tasks.get(task_id) {
            Some(entry) => entry.value().task_type,
            None => return Ok(()),
        };
        if task_type != TaskType::Job {
            return Err(UmbraError::TaskInProcess(task_id.to_string()));
        }

        let data = agent.data();
        let kill_task = self.ts_agent_job_kill(&data, task_id)?;
        self.task_create(agent_id, &format!("job kill {}", task_id), "", kill_task);
        Ok(())
    }

    /// Delete a terminal task from the completed table. Tasks still queued or
    /// running are a conflict and state is left untouched.
    pub fn task_delete(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let agent = self.agent(agent_id)?;

        if agent.tasks_queue.contains_where(|t| t.task_id == task_id) {
            return Err(UmbraError::TaskInProcess(task_id.to_string()));
        }
        if agent.running_tasks.contains_key(task_id) {
            return Err(UmbraError::TaskInProcess(task_id.to_string()));
        }

        let Some((_, task)) = agent.completed_tasks.remove(task_id) else {
            return Err(UmbraError::TaskNotFound(task_id.to_string()));
        };

        self.storage.task_delete(&task.task_id);
        self.fanout.sync_all(&SyncPacket::task_remove(&task));
        Ok(())
    }

    /// Assemble the next outbound batch under a strict byte budget
    /// (`sum + next < budget` keeps headroom for transport framing).
    ///
    /// Order: tasks queue, tunnel connect queue, tunnel frame queue, then one
    /// wrapped batch per pivot child assembled recursively from the remaining
    /// budget. A queue's traversal stops at the first element that does not
    /// fit, so later smaller elements are never reordered past it.
    pub fn task_get_available(&self, agent_id: &str, budget: usize) -> Result<Vec<TaskData>> {
        let agent = self.agent(agent_id)?;

        let mut tasks: Vec<TaskData> = Vec::new();
        let mut size = 0usize;

        let picked = agent.tasks_queue.drain_while(|t| {
            if size + t.data.len() < budget {
                size += t.data.len();
                true
            } else {
                false
            }
        });

        let mut sent_ids = Vec::with_capacity(picked.len());
        for task in &picked {
            if task.sync || task.task_type == TaskType::Browser {
                agent
                    .running_tasks
                    .insert(task.task_id.clone(), task.clone());
            }
            sent_ids.push(task.task_id.clone());
        }
        tasks.extend(picked);

        if !sent_ids.is_empty() {
            self.fanout.sync_all(&SyncPacket::task_send(sent_ids));
        }

        tasks.extend(agent.tunnel_connect_tasks.drain_while(|t| {
            if size + t.data.len() < budget {
                size += t.data.len();
                true
            } else {
                false
            }
        }));

        tasks.extend(agent.tunnel_queue.drain_while(|t| {
            if size + t.data.len() < budget {
                size += t.data.len();
                true
            } else {
                false
            }
        }));

        // Pivot children: each child's batch is packed by this agent's module
        // and may exceed the residual in one step; failures are swallowed so
        // one broken child cannot starve its siblings.
        let parent_name = agent.data().name;
        for link in agent.pivot_children.snapshot() {
            let remaining = budget.saturating_sub(size);
            if remaining == 0 {
                break;
            }
            let child_data = match self.ts_agent_get_hosted_tasks(&link.child_agent_id, remaining) {
                Ok(data) => data,
                Err(e) => {
                    tracing::debug!(pivot_id = %link.pivot_id, "pivot batch skipped: {}", e);
                    continue;
                }
            };
            if child_data.is_empty() {
                continue;
            }
            let wrapped = match self
                .extender
                .agent_pivot_pack(&parent_name, &link.pivot_id, &child_data)
            {
                Ok(task) => task,
                Err(e) => {
                    tracing::debug!(pivot_id = %link.pivot_id, "pivot pack skipped: {}", e);
                    continue;
                }
            };
            size += wrapped.data.len();
            tasks.push(wrapped);
        }

        Ok(tasks)
    }

    /// Queue a tunnel-channel setup task. These wait behind the main task
    /// queue but ahead of raw tunnel frames.
    pub fn ts_tunnel_connect_enqueue(&self, agent_id: &str, task: TaskData) -> Result<()> {
        self.agent(agent_id)?.tunnel_connect_tasks.put(task);
        Ok(())
    }

    /// Queue one tunnel data frame for transport.
    pub fn ts_tunnel_data_enqueue(&self, agent_id: &str, task: TaskData) -> Result<()> {
        self.agent(agent_id)?.tunnel_queue.put(task);
        Ok(())
    }

    /// True when the agent or any recursive pivot descendant has pending
    /// outbound content. `first` skips the top agent's own queues so a
    /// listener can ask specifically about downstream traffic.
    pub fn tasks_pivot_exists(&self, agent_id: &str, first: bool) -> bool {
        let Ok(agent) = self.agent(agent_id) else {
            return false;
        };

        if !first && (!agent.tasks_queue.is_empty() || !agent.tunnel_queue.is_empty()) {
            return true;
        }

        agent
            .pivot_children
            .snapshot()
            .iter()
            .any(|link| self.tasks_pivot_exists(&link.child_agent_id, false))
    }
}
