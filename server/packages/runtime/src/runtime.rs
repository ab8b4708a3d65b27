use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::Stream;
use mcp_studio_error::StudioError;
use tokio::task::JoinHandle;

use crate::artifacts::{AgentRecord, ArtifactStore, SaveAgent};
use crate::config::RuntimeConfig;
use crate::process::{AgentProcess, InputOutcome, ViewerAttachment};
use crate::reaper::Reaper;
use crate::registry::ProcessRegistry;
use crate::stream::{viewer_frames, StreamTiming, ViewerFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Everything the HTTP layer needs to run agents: registry, reaper and artifacts.
#[derive(Debug)]
pub struct StudioRuntime {
    config: RuntimeConfig,
    registry: Arc<ProcessRegistry>,
    artifacts: ArtifactStore,
    reaper_task: StdMutex<Option<JoinHandle<()>>>,
}

impl StudioRuntime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            artifacts: ArtifactStore::new(&config),
            registry: Arc::new(ProcessRegistry::new()),
            config,
            reaper_task: StdMutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.registry.clone(), self.config.idle_timeout)
    }

    /// Starts the periodic sweep. Calling it again is a no-op.
    pub fn start_reaper(&self) {
        let mut task = self
            .reaper_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(self.reaper().spawn(self.config.reap_interval));
            tracing::info!(
                interval_secs = self.config.reap_interval.as_secs(),
                idle_timeout_secs = self.config.idle_timeout.as_secs(),
                "agent reaper started"
            );
        }
    }

    /// Launches the agent, replacing any previous run. A failed spawn is only
    /// logged; callers find out through `attach` or `send_input`.
    pub async fn run(&self, agent_id: &str) -> Result<(), StudioError> {
        let launch = self.artifacts.launch_spec(agent_id).await?;

        if let Some(previous) = self.registry.remove(agent_id).await {
            tracing::info!(agent_id = %agent_id, pid = ?previous.pid(), "stopping previous run");
            previous.terminate();
        }

        match AgentProcess::spawn(agent_id, &launch, &self.config) {
            Ok(process) => self.registry.register(process).await,
            Err(err) => {
                tracing::error!(agent_id = %agent_id, error = %err, "failed to start agent process");
            }
        }
        Ok(())
    }

    /// Claims the viewer slot for `agent_id`, displacing any current viewer.
    pub async fn attach(
        &self,
        agent_id: &str,
    ) -> Result<(Arc<AgentProcess>, ViewerAttachment), StudioError> {
        let process = self.lookup(agent_id).await?;

        if process.pid().is_none() {
            self.registry.remove_if_same(&process).await;
            process.kill();
            return Err(StudioError::ProcessInvalid {
                agent_id: agent_id.to_string(),
            });
        }

        if process.exit_delivered() {
            self.registry.remove_if_same(&process).await;
            return Err(exited(&process));
        }

        if !process.has_exited() && !process.has_stdin() {
            return Err(StudioError::StdinUnavailable {
                agent_id: agent_id.to_string(),
                message: "Process stdin is not available".to_string(),
            });
        }

        match process.attach_viewer() {
            Ok(attachment) => {
                if process.exit_delivered() {
                    // the backlog carries the exit event; nobody can attach again
                    self.registry.remove_if_same(&process).await;
                }
                Ok((process, attachment))
            }
            Err(err) => {
                self.registry.remove_if_same(&process).await;
                Err(err)
            }
        }
    }

    pub async fn stream(
        &self,
        agent_id: &str,
    ) -> Result<impl Stream<Item = ViewerFrame> + Send + 'static, StudioError> {
        let (process, attachment) = self.attach(agent_id).await?;
        let timing = StreamTiming {
            heartbeat: self.config.heartbeat_interval,
            exit_grace: self.config.exit_grace,
        };
        Ok(viewer_frames(process, attachment, timing))
    }

    pub async fn send_input(&self, agent_id: &str, input: &str) -> Result<InputOutcome, StudioError> {
        let process = self.lookup(agent_id).await?;

        if process.has_exited() {
            self.registry.remove_if_same(&process).await;
            return Err(exited(&process));
        }
        if !process.has_stdin() {
            return Err(StudioError::StdinUnavailable {
                agent_id: agent_id.to_string(),
                message: "Process stdin is not available".to_string(),
            });
        }

        let outcome = process
            .write_input(input, self.config.input_queue_timeout)
            .await;
        if let Err(StudioError::AgentProcessExited { .. }) = &outcome {
            // broken pipe: the process is gone even if its exit is not in yet
            self.registry.remove_if_same(&process).await;
            process.terminate();
        }
        outcome
    }

    /// Idempotent; stopping an unknown agent reports `NotRunning`.
    pub async fn stop(&self, agent_id: &str) -> Result<StopOutcome, StudioError> {
        match self.registry.remove(agent_id).await {
            Some(process) => {
                tracing::info!(agent_id = %agent_id, pid = ?process.pid(), "stopping agent process");
                process.terminate();
                Ok(StopOutcome::Stopped)
            }
            None => Ok(StopOutcome::NotRunning),
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, StudioError> {
        self.artifacts.list().await
    }

    pub async fn save_agent(&self, request: SaveAgent) -> Result<AgentRecord, StudioError> {
        self.artifacts.save(request).await
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self
            .reaper_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.registry.terminate_all().await;
    }

    async fn lookup(&self, agent_id: &str) -> Result<Arc<AgentProcess>, StudioError> {
        self.registry
            .get(agent_id)
            .await
            .ok_or_else(|| StudioError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }
}

fn exited(process: &AgentProcess) -> StudioError {
    StudioError::AgentProcessExited {
        agent_id: process.agent_id().to_string(),
        exit_code: process.exit_code(),
    }
}
