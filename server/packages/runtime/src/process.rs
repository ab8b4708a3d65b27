use std::collections::VecDeque;
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mcp_studio_error::StudioError;
use mcp_studio_output::OutputEvent;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::artifacts::LaunchSpec;
use crate::config::RuntimeConfig;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// The exit status could not be collected.
    Failed { message: String },
}

impl Termination {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self::Exited {
                code: status.code(),
                signal: signal_name(&status),
            },
            Err(err) => Self::Failed {
                message: err.to_string(),
            },
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            Self::Failed { .. } => None,
        }
    }

    pub fn to_event(&self) -> OutputEvent {
        match self {
            Self::Exited { code, signal } => OutputEvent::Exit {
                code: *code,
                signal: signal.clone(),
            },
            Self::Failed { message } => OutputEvent::error(message.clone()),
        }
    }
}

/// Result of relaying one line to an agent's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Delivered,
    /// The pipe did not accept the write in time; it completes in the background.
    Queued,
}

/// Receiving end handed to a newly attached viewer.
#[derive(Debug)]
pub struct ViewerAttachment {
    pub id: u64,
    /// Output produced while nobody was watching, oldest first.
    pub backlog: Vec<OutputEvent>,
    pub events: mpsc::UnboundedReceiver<OutputEvent>,
    /// Resolves (with an error) once this viewer is replaced or detached.
    pub closed: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct Viewer {
    id: u64,
    sender: mpsc::UnboundedSender<OutputEvent>,
    _closed: oneshot::Sender<()>,
}

/// Single viewer slot plus the output buffered while it is empty.
#[derive(Debug)]
struct ViewerSlot {
    current: Option<Viewer>,
    backlog: VecDeque<OutputEvent>,
    backlog_limit: usize,
    exited: bool,
    exit_delivered: bool,
}

impl ViewerSlot {
    fn forward(&mut self, event: OutputEvent) -> bool {
        if let Some(viewer) = &self.current {
            match viewer.sender.send(event) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(event)) => {
                    self.current = None;
                    self.push_backlog(event);
                    return false;
                }
            }
        }
        self.push_backlog(event);
        false
    }

    fn push_backlog(&mut self, event: OutputEvent) {
        self.backlog.push_back(event);
        while self.backlog.len() > self.backlog_limit {
            self.backlog.pop_front();
        }
    }
}

#[derive(Debug)]
struct Shared {
    agent_id: String,
    last_activity: StdMutex<Instant>,
    viewer: StdMutex<ViewerSlot>,
}

impl Shared {
    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn forward(&self, event: OutputEvent) -> bool {
        lock(&self.viewer).forward(event)
    }
}

/// One running agent: its pipes, exit status and viewer slot.
///
/// The child itself is owned by a watcher task so exit is observed whether or
/// not anyone is attached.
#[derive(Debug)]
pub struct AgentProcess {
    pid: Option<u32>,
    shared: Arc<Shared>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    exit: watch::Receiver<Option<Termination>>,
    kill_tx: mpsc::UnboundedSender<()>,
    next_viewer_id: AtomicU64,
}

impl AgentProcess {
    pub fn spawn(
        agent_id: &str,
        launch: &LaunchSpec,
        config: &RuntimeConfig,
    ) -> Result<Arc<Self>, StudioError> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            agent_id = %agent_id,
            program = ?launch.program,
            args = ?launch.args,
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|err| StudioError::SpawnFailed {
            agent_id: agent_id.to_string(),
            message: format!("{}: {err}", launch.program.display()),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            agent_id: agent_id.to_string(),
            last_activity: StdMutex::new(Instant::now()),
            viewer: StdMutex::new(ViewerSlot {
                current: None,
                backlog: VecDeque::new(),
                backlog_limit: config.backlog_limit.max(1),
                exited: false,
                exit_delivered: false,
            }),
        });

        let mut pumps = Vec::new();
        if let Some(stdout) = stdout {
            pumps.push(spawn_pump(stdout, shared.clone(), PipeKind::Stdout));
        }
        if let Some(stderr) = stderr {
            pumps.push(spawn_pump(stderr, shared.clone(), PipeKind::Stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        spawn_exit_watcher(child, shared.clone(), pumps, exit_tx, kill_rx, config.drain_timeout);

        tracing::info!(agent_id = %agent_id, pid = ?pid, "agent process spawned");

        Ok(Arc::new(Self {
            pid,
            shared,
            stdin: Arc::new(Mutex::new(stdin)),
            exit: exit_rx,
            kill_tx,
            next_viewer_id: AtomicU64::new(1),
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.shared.last_activity).elapsed()
    }

    pub fn touch(&self) {
        self.shared.touch();
    }

    pub fn termination(&self) -> Option<Termination> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.termination().and_then(|termination| termination.exit_code())
    }

    /// True once the exit has been handed to a viewer, after which nobody can attach.
    pub fn exit_delivered(&self) -> bool {
        lock(&self.shared.viewer).exit_delivered
    }

    pub async fn wait_exit(&self) -> Termination {
        let mut exit = self.exit.clone();
        loop {
            if let Some(termination) = exit.borrow_and_update().clone() {
                return termination;
            }
            if exit.changed().await.is_err() {
                return exit.borrow().clone().unwrap_or(Termination::Failed {
                    message: "exit watcher stopped".to_string(),
                });
            }
        }
    }

    /// Asks the process to stop: SIGTERM where available, a hard kill otherwise.
    pub fn terminate(&self) {
        if self.has_exited() {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let sent = unsafe { libc::kill(pid as i32, libc::SIGTERM) } == 0;
                if sent {
                    tracing::info!(agent_id = %self.agent_id(), pid, "sent SIGTERM to agent process");
                    return;
                }
            }
        }

        self.kill();
    }

    pub fn kill(&self) {
        if self.has_exited() {
            return;
        }
        tracing::info!(agent_id = %self.agent_id(), pid = ?self.pid, "killing agent process");
        let _ = self.kill_tx.send(());
    }

    pub fn has_stdin(&self) -> bool {
        // A held lock means a write is in flight, so the pipe is still there.
        self.stdin
            .try_lock()
            .map(|stdin| stdin.is_some())
            .unwrap_or(true)
    }

    pub fn has_viewer(&self) -> bool {
        lock(&self.shared.viewer).current.is_some()
    }

    /// Installs a new viewer, disposing of any previous one.
    pub fn attach_viewer(&self) -> Result<ViewerAttachment, StudioError> {
        let mut slot = lock(&self.shared.viewer);
        if slot.exit_delivered {
            return Err(StudioError::AgentProcessExited {
                agent_id: self.agent_id().to_string(),
                exit_code: self.exit_code(),
            });
        }

        let id = self.next_viewer_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        let (closed_tx, closed) = oneshot::channel();
        let previous = slot.current.replace(Viewer {
            id,
            sender,
            _closed: closed_tx,
        });
        let replaced_previous = previous.is_some();
        drop(previous);

        let backlog: Vec<OutputEvent> = slot.backlog.drain(..).collect();
        if slot.exited {
            // the buffered exit event goes out with the backlog
            slot.exit_delivered = true;
        }
        drop(slot);

        self.touch();
        tracing::info!(
            agent_id = %self.agent_id(),
            viewer_id = id,
            replaced_previous,
            backlog = backlog.len(),
            "viewer attached"
        );

        Ok(ViewerAttachment {
            id,
            backlog,
            events,
            closed,
        })
    }

    /// Clears the slot if `viewer_id` still owns it.
    pub fn detach_viewer(&self, viewer_id: u64) -> bool {
        let mut slot = lock(&self.shared.viewer);
        let owns_slot = slot
            .current
            .as_ref()
            .is_some_and(|viewer| viewer.id == viewer_id);
        if owns_slot {
            slot.current = None;
            tracing::info!(agent_id = %self.agent_id(), viewer_id, "viewer detached");
        }
        owns_slot
    }

    /// Writes `input` plus a newline to stdin.
    pub async fn write_input(
        &self,
        input: &str,
        queue_timeout: Duration,
    ) -> Result<InputOutcome, StudioError> {
        self.touch();

        let stdin = self.stdin.clone();
        let agent_id = self.agent_id().to_string();
        let line = format!("{input}\n");
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut guard = stdin.lock().await;
            let result = match guard.as_mut() {
                None => Err(std::io::Error::new(ErrorKind::NotConnected, "stdin is closed")),
                Some(pipe) => match pipe.write_all(line.as_bytes()).await {
                    Ok(()) => pipe.flush().await,
                    Err(err) => Err(err),
                },
            };
            match &result {
                Ok(()) => {
                    tracing::debug!(agent_id = %agent_id, bytes = line.len(), "stdin: write+flush complete");
                }
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    tracing::warn!(agent_id = %agent_id, "stdin: broken pipe, agent is gone");
                    *guard = None;
                }
                Err(err) => {
                    tracing::error!(agent_id = %agent_id, error = %err, "stdin: write failed");
                }
            }
            let _ = result_tx.send(result);
        });

        match tokio::time::timeout(queue_timeout, result_rx).await {
            Err(_) => {
                tracing::warn!(agent_id = %self.agent_id(), "stdin: write still pending, reporting as queued");
                Ok(InputOutcome::Queued)
            }
            Ok(Err(_)) => Err(StudioError::StdinUnavailable {
                agent_id: self.agent_id().to_string(),
                message: "stdin writer stopped".to_string(),
            }),
            Ok(Ok(Ok(()))) => Ok(InputOutcome::Delivered),
            Ok(Ok(Err(err))) if err.kind() == ErrorKind::BrokenPipe => {
                Err(StudioError::AgentProcessExited {
                    agent_id: self.agent_id().to_string(),
                    exit_code: self.exit_code(),
                })
            }
            Ok(Ok(Err(err))) => Err(StudioError::StdinUnavailable {
                agent_id: self.agent_id().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeKind {
    Stdout,
    Stderr,
}

fn spawn_pump<R>(mut reader: R, shared: Arc<Shared>, kind: PipeKind) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut pending = Vec::new();
        let mut chunks: u64 = 0;

        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    tracing::warn!(agent_id = %shared.agent_id, pipe = ?kind, error = %err, "agent pipe read failed");
                    break;
                }
            };
            pending.extend_from_slice(&buf[..read]);
            let text = take_utf8(&mut pending);
            if text.is_empty() {
                continue;
            }
            chunks += 1;
            emit(&shared, kind, text);
        }

        if !pending.is_empty() {
            emit(&shared, kind, String::from_utf8_lossy(&pending).into_owned());
        }

        tracing::debug!(agent_id = %shared.agent_id, pipe = ?kind, chunks, "agent pipe closed");
    })
}

fn emit(shared: &Shared, kind: PipeKind, text: String) {
    let event = match kind {
        PipeKind::Stdout => OutputEvent::stdout(text),
        PipeKind::Stderr => OutputEvent::from_stderr(text),
    };
    let forwarded = shared.forward(event);
    if forwarded || kind == PipeKind::Stderr {
        shared.touch();
    }
}

fn spawn_exit_watcher(
    mut child: Child,
    shared: Arc<Shared>,
    pumps: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<Termination>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    drain_timeout: Duration,
) {
    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                request = kill_rx.recv() => {
                    if request.is_none() {
                        break child.wait().await;
                    }
                    if let Err(err) = child.start_kill() {
                        tracing::warn!(agent_id = %shared.agent_id, error = %err, "failed to kill agent process");
                    }
                }
            }
        };

        // Let the pumps flush whatever the process wrote before exiting.
        let drained = tokio::time::timeout(drain_timeout, async {
            for pump in pumps {
                let _ = pump.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(agent_id = %shared.agent_id, "agent output did not drain after exit");
        }

        let termination = Termination::from_status(status);
        match &termination {
            Termination::Exited { code, signal } => {
                tracing::info!(agent_id = %shared.agent_id, code = ?code, signal = ?signal, "agent process exited");
            }
            Termination::Failed { message } => {
                tracing::error!(agent_id = %shared.agent_id, error = %message, "agent process: failed to get exit status");
            }
        }

        {
            let mut slot = lock(&shared.viewer);
            let delivered = slot.forward(termination.to_event());
            slot.exited = true;
            slot.exit_delivered = delivered;
        }
        exit_tx.send_replace(Some(termination));
    });
}

/// Splits off the longest valid UTF-8 prefix, keeping a trailing partial sequence.
pub(crate) fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending.as_slice()) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let rest = pending.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal()?;
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        other => return Some(format!("SIG{other}")),
    };
    Some(name.to_string())
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
