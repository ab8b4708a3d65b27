#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use mcp_studio_output::{OutputEvent, CONNECTION_ESTABLISHED};
use mcp_studio_runtime::app::build_router;
use mcp_studio_runtime::client::{ClientError, SseFrame, StudioClient};
use mcp_studio_runtime::runtime::StudioRuntime;
use mcp_studio_runtime::RuntimeConfig;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

struct LiveServer {
    client: StudioClient,
    runtime: Arc<StudioRuntime>,
    project_dir: TempDir,
    handle: JoinHandle<()>,
}

impl LiveServer {
    async fn start(heartbeat: Duration) -> Self {
        let project_dir = tempfile::tempdir().expect("create temp project dir");
        let mut config = RuntimeConfig::for_project(project_dir.path());
        config.agents_dir = project_dir.path().join("agents");
        config.interpreter = "sh".to_string();
        config.artifact_extension = "sh".to_string();
        config.heartbeat_interval = heartbeat;
        config.exit_grace = Duration::from_millis(50);
        fs::create_dir_all(&config.agents_dir).expect("create agents dir");

        let runtime = StudioRuntime::new(config);
        let app = build_router(runtime.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = StudioClient::new(format!("http://{addr}")).expect("build client");
        Self {
            client,
            runtime,
            project_dir,
            handle,
        }
    }

    fn write_agent(&self, agent_id: &str, script: &str) {
        let path = self
            .project_dir
            .path()
            .join("agents")
            .join(format!("{agent_id}.sh"));
        fs::write(path, script).expect("write agent script");
    }

    async fn shutdown(self) {
        self.runtime.shutdown().await;
        self.handle.abort();
    }
}

async fn next_event<S>(frames: &mut S) -> Option<OutputEvent>
where
    S: Stream<Item = Result<SseFrame, ClientError>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, frames.next())
            .await
            .expect("stream stalled")?;
        if let Some(event) = frame.expect("stream frame").output_event() {
            return Some(event);
        }
    }
}

#[tokio::test]
async fn demo_agent_streams_output_then_exit() {
    let server = LiveServer::start(Duration::from_secs(15)).await;
    server.write_agent("demo", "echo ready\n");

    let run = server.client.run("demo").await.expect("run demo");
    assert!(run.success);
    assert_eq!(run.agent_id, "demo");

    let mut frames = Box::pin(server.client.stream("demo").await.expect("attach"));
    assert_eq!(
        next_event(&mut frames).await,
        Some(OutputEvent::system(CONNECTION_ESTABLISHED))
    );

    let mut stdout = String::new();
    let exit = loop {
        match next_event(&mut frames).await.expect("exit before end of stream") {
            OutputEvent::Stdout { data } => stdout.push_str(&data),
            event @ OutputEvent::Exit { .. } => break event,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(stdout, "ready\n");
    assert_eq!(
        exit,
        OutputEvent::Exit {
            code: Some(0),
            signal: None
        }
    );
    assert_eq!(next_event(&mut frames).await, None);

    // the exit has been seen, so the agent can no longer be attached
    let err = match server.client.stream("demo").await {
        Ok(_) => panic!("attach after exit should fail"),
        Err(err) => err,
    };
    assert!(matches!(err, ClientError::Api { status: 404, .. }));

    server.shutdown().await;
}

#[tokio::test]
async fn second_viewer_replaces_first() {
    let server = LiveServer::start(Duration::from_secs(15)).await;
    server.write_agent("sleeper", "exec sleep 30\n");
    server.client.run("sleeper").await.expect("run sleeper");

    let mut first = Box::pin(server.client.stream("sleeper").await.expect("first attach"));
    assert_eq!(
        next_event(&mut first).await,
        Some(OutputEvent::system(CONNECTION_ESTABLISHED))
    );

    let mut second = Box::pin(server.client.stream("sleeper").await.expect("second attach"));
    assert_eq!(
        next_event(&mut second).await,
        Some(OutputEvent::system(CONNECTION_ESTABLISHED))
    );
    assert_eq!(next_event(&mut first).await, None);

    let stop = server.client.stop("sleeper").await.expect("stop");
    assert_eq!(stop.message, "Agent process stopped");
    match next_event(&mut second).await {
        Some(OutputEvent::Exit { code, signal }) => {
            assert_eq!(code, None);
            assert_eq!(signal.as_deref(), Some("SIGTERM"));
        }
        other => panic!("expected exit event, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn input_is_relayed_to_stdin() {
    let server = LiveServer::start(Duration::from_secs(15)).await;
    server.write_agent(
        "echoer",
        "while read line; do echo \"got:$line\"; done\n",
    );
    server.client.run("echoer").await.expect("run echoer");

    let mut frames = Box::pin(server.client.stream("echoer").await.expect("attach"));
    assert_eq!(
        next_event(&mut frames).await,
        Some(OutputEvent::system(CONNECTION_ESTABLISHED))
    );

    let sent = server.client.input("echoer", "hello").await.expect("input");
    assert!(sent.success);
    assert_eq!(sent.message, "Input sent to agent");
    assert!(sent.warning.is_none());

    let mut stdout = String::new();
    while !stdout.contains('\n') {
        match next_event(&mut frames).await.expect("echo before end of stream") {
            OutputEvent::Stdout { data } => stdout.push_str(&data),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(stdout, "got:hello\n");

    // an empty input is a bare Enter
    let sent = server.client.input("echoer", "").await.expect("empty input");
    assert!(sent.success);
    let mut stdout = String::new();
    while !stdout.contains('\n') {
        match next_event(&mut frames).await.expect("echo before end of stream") {
            OutputEvent::Stdout { data } => stdout.push_str(&data),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(stdout, "got:\n");

    server.shutdown().await;
}

#[tokio::test]
async fn idle_stream_receives_heartbeats() {
    let server = LiveServer::start(Duration::from_millis(100)).await;
    server.write_agent("quiet", "exec sleep 30\n");
    server.client.run("quiet").await.expect("run quiet");

    let mut frames = Box::pin(server.client.stream("quiet").await.expect("attach"));
    let heartbeat = tokio::time::timeout(STEP_TIMEOUT, async {
        while let Some(frame) = frames.next().await {
            if let SseFrame::Comment(text) = frame.expect("stream frame") {
                return Some(text);
            }
        }
        None
    })
    .await
    .expect("heartbeat within timeout");
    assert_eq!(heartbeat.as_deref(), Some("heartbeat"));

    server.shutdown().await;
}

#[tokio::test]
async fn reaper_removes_exited_agents_without_viewers() {
    let server = LiveServer::start(Duration::from_secs(15)).await;
    server.write_agent("oneshot", "exit 0\n");
    server.client.run("oneshot").await.expect("run oneshot");

    let process = server
        .runtime
        .registry()
        .get("oneshot")
        .await
        .expect("registered");
    tokio::time::timeout(STEP_TIMEOUT, process.wait_exit())
        .await
        .expect("process exits");

    let report = server.runtime.reaper().sweep().await;
    assert_eq!(report.removed, 1);
    assert!(server.runtime.registry().is_empty().await);

    let stop = server.client.stop("oneshot").await.expect("stop");
    assert_eq!(stop.message, "Process not found or already stopped");

    server.shutdown().await;
}
