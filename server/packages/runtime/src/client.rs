use futures::{stream, Stream, StreamExt};
use mcp_studio_error::ProblemDetails;
use mcp_studio_output::OutputEvent;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::app::{AgentListResponse, InputResponse, RunResponse, StopResponse};
use crate::artifacts::AgentRecord;
use crate::process::take_utf8;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{message} (status {status})")]
    Api { status: u16, message: String },
}

/// One decoded SSE block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `: text` lines, used for heartbeats.
    Comment(String),
    Data(String),
}

impl SseFrame {
    /// The output event carried by a data frame, if it parses as one.
    pub fn output_event(&self) -> Option<OutputEvent> {
        match self {
            Self::Data(data) => serde_json::from_str(data).ok(),
            Self::Comment(_) => None,
        }
    }
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(bytes);
        let text = take_utf8(&mut self.pending);
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            frames.extend(parse_block(&block));
        }
        frames
    }
}

fn parse_block(block: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut data: Option<String> = None;
    for line in block.lines() {
        if let Some(comment) = line.strip_prefix(':') {
            frames.push(SseFrame::Comment(comment.trim().to_string()));
        } else if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
    if let Some(data) = data {
        frames.push(SseFrame::Data(data));
    }
    frames
}

/// Thin async wrapper over the `/api` surface.
#[derive(Debug, Clone)]
pub struct StudioClient {
    endpoint: String,
    http: HttpClient,
}

impl StudioClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            endpoint: endpoint.into(),
            http: HttpClient::builder().build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn run(&self, agent_id: &str) -> Result<RunResponse, ClientError> {
        self.post("/api/agent/run", &json!({ "agentId": agent_id }))
            .await
    }

    pub async fn input(&self, agent_id: &str, input: &str) -> Result<InputResponse, ClientError> {
        self.post(
            "/api/agent/input",
            &json!({ "agentId": agent_id, "input": input }),
        )
        .await
    }

    pub async fn stop(&self, agent_id: &str) -> Result<StopResponse, ClientError> {
        self.post("/api/agent/stop", &json!({ "agentId": agent_id }))
            .await
    }

    pub async fn agents(&self) -> Result<Vec<AgentRecord>, ClientError> {
        let response = self.request(Method::GET, "/api/agent/list").send().await?;
        let response = check_status(response).await?;
        let body: AgentListResponse = response.json().await?;
        Ok(body.agents)
    }

    /// Opens the viewer stream. Attach failures come back as `ClientError::Api`.
    pub async fn stream(
        &self,
        agent_id: &str,
    ) -> Result<impl Stream<Item = Result<SseFrame, ClientError>> + Send + 'static, ClientError>
    {
        let cache_buster = chrono::Utc::now().timestamp_millis().to_string();
        let response = self
            .request(Method::GET, "/api/agent/stream")
            .query(&[("agentId", agent_id), ("t", cache_buster.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = SseDecoder::default()
                .push(body.as_bytes())
                .iter()
                .find_map(SseFrame::output_event)
                .and_then(|event| match event {
                    OutputEvent::Error { error } => Some(error),
                    _ => None,
                })
                .unwrap_or(body);
            return Err(ClientError::Api { status, message });
        }

        let mut decoder = SseDecoder::default();
        Ok(response.bytes_stream().flat_map(move |chunk| {
            let frames: Vec<Result<SseFrame, ClientError>> = match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err.into())],
            };
            stream::iter(frames)
        }))
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ProblemDetails>(&body)
        .ok()
        .map(|problem| problem.detail.unwrap_or(problem.title))
        .unwrap_or(body);
    Err(ClientError::Api { status, message })
}
