use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{CodeInterpreterDelta, CodeOutput, RunEvent, RunEventMapped, RunTarget};
use crate::provider::{
    BuildHttpClientSnafu, DecodeEventSnafu, MissingAssistantIdSnafu, MissingProviderKeySnafu,
    ProviderConfig, ProviderError, ProviderResult, RunProvider, RunRequest, RunStatusSnafu,
    RunStreamHandle, RunWorker, SendRequestSnafu, make_event_stream,
};
use crate::sse::{SseDecoder, SseFrame};

pub const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const DONE_SENTINEL: &str = "[DONE]";

/// Streams Assistants-style runs (`POST /threads/{id}/runs` with `stream: true`).
pub struct AssistantsRunProvider {
    client: Client,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    content: Vec<MessageDeltaContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageDeltaContent {
    Text {
        text: TextDelta,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunStepDelta {
    delta: RunStepDeltaBody,
}

#[derive(Debug, Deserialize)]
struct RunStepDeltaBody {
    #[serde(default)]
    step_details: Option<StepDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StepDetails {
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<ToolCallDelta>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolCallDelta {
    CodeInterpreter {
        #[serde(default)]
        code_interpreter: Option<CodeInterpreterBody>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodeInterpreterBody {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<CodeOutputBody>>,
}

#[derive(Debug, Deserialize)]
struct CodeOutputBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    logs: Option<String>,
    #[serde(default)]
    image: Option<ImageBody>,
}

#[derive(Debug, Deserialize)]
struct ImageBody {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct RunStatusBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

impl AssistantsRunProvider {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let client = Client::builder().build().context(BuildHttpClientSnafu {
            stage: "assistants-provider-new",
        })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn runs_url(config: &ProviderConfig, session_id: &str) -> String {
        format!("{}/threads/{}/runs", config.endpoint, session_id)
    }

    async fn open_stream(
        client: &Client,
        config: &ProviderConfig,
        request: &RunRequest,
    ) -> ProviderResult<reqwest::Response> {
        let response = client
            .post(Self::runs_url(config, &request.session_id))
            .bearer_auth(request.credentials.provider_key.expose())
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .json(&json!({
                "assistant_id": request.credentials.assistant_id,
                "stream": true,
            }))
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "open-run-stream",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return RunStatusSnafu {
                stage: "open-run-stream-status",
                status: status.as_u16(),
                message: Self::error_message_from_body(&body)
                    .unwrap_or_else(|| body.trim().to_string()),
            }
            .fail();
        }

        Ok(response)
    }

    fn error_message_from_body(body: &str) -> Option<String> {
        let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok()?;
        envelope
            .error
            .and_then(|detail| detail.message)
            .or(envelope.message)
            .filter(|message| !message.trim().is_empty())
    }

    /// Maps one server-sent frame to zero or more run events.
    pub(crate) fn map_frame(frame: &SseFrame) -> ProviderResult<Vec<RunEvent>> {
        if frame.data.trim() == DONE_SENTINEL {
            return Ok(vec![RunEvent::End]);
        }

        let Some(event) = frame.event.as_deref() else {
            return Ok(Vec::new());
        };

        let events = match event {
            "thread.message.created" => vec![RunEvent::RunStarted],
            "thread.message.delta" => {
                let delta = Self::decode::<MessageDelta>(event, &frame.data)?;
                delta
                    .delta
                    .content
                    .into_iter()
                    .filter_map(|content| match content {
                        MessageDeltaContent::Text { text } => text.value,
                        MessageDeltaContent::Unsupported => None,
                    })
                    .filter(|value| !value.is_empty())
                    .map(RunEvent::TextDelta)
                    .collect()
            }
            "thread.run.step.delta" => {
                let delta = Self::decode::<RunStepDelta>(event, &frame.data)?;
                match delta.delta.step_details {
                    Some(StepDetails::ToolCalls { tool_calls }) => tool_calls
                        .into_iter()
                        .filter_map(Self::map_tool_call)
                        .map(RunEvent::CodeInterpreter)
                        .collect(),
                    Some(StepDetails::Other) | None => Vec::new(),
                }
            }
            "thread.run.failed" | "thread.run.expired" | "thread.run.cancelled" => {
                let run = Self::decode::<RunStatusBody>(event, &frame.data)?;
                let message = run
                    .last_error
                    .and_then(|detail| detail.message)
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| {
                        format!("run {}", run.status.as_deref().unwrap_or("failed"))
                    });
                vec![RunEvent::Error(message)]
            }
            "error" => {
                let message = Self::error_message_from_body(&frame.data)
                    .unwrap_or_else(|| "provider reported an unspecified error".to_string());
                vec![RunEvent::Error(message)]
            }
            "done" => vec![RunEvent::End],
            _ => Vec::new(),
        };

        Ok(events)
    }

    fn map_tool_call(tool_call: ToolCallDelta) -> Option<CodeInterpreterDelta> {
        let ToolCallDelta::CodeInterpreter {
            code_interpreter: Some(body),
        } = tool_call
        else {
            return None;
        };

        let outputs = body
            .outputs
            .unwrap_or_default()
            .into_iter()
            .map(|CodeOutputBody { kind, logs, image }| match (logs, image) {
                (Some(logs), _) if kind == "logs" => CodeOutput::Logs(logs),
                (_, Some(image)) if kind == "image" => CodeOutput::Image {
                    file_id: image.file_id,
                },
                _ => CodeOutput::Other { kind },
            })
            .collect::<Vec<_>>();
        let input = body.input.filter(|input| !input.is_empty());

        if input.is_none() && outputs.is_empty() {
            return None;
        }
        Some(CodeInterpreterDelta { input, outputs })
    }

    fn decode<T: for<'de> Deserialize<'de>>(event: &str, data: &str) -> ProviderResult<T> {
        serde_json::from_str(data).context(DecodeEventSnafu {
            stage: "decode-run-event",
            event: event.to_string(),
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<RunEventMapped>,
        target: RunTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(RunEventMapped::new(target, RunEvent::Error(error.to_string())));
    }

    /// Sends mapped events; returns true once a terminal event went out.
    fn forward_frame(
        event_tx: &mpsc::UnboundedSender<RunEventMapped>,
        target: RunTarget,
        frame: &SseFrame,
    ) -> bool {
        let events = match Self::map_frame(frame) {
            Ok(events) => events,
            Err(error) => {
                tracing::warn!(
                    target = ?target,
                    error = %error,
                    "dropping run after undecodable event"
                );
                Self::emit_error_event(event_tx, target, error);
                return true;
            }
        };

        for payload in events {
            let terminal = payload.is_terminal();
            if event_tx.send(RunEventMapped::new(target, payload)).is_err() {
                // Receiver is gone; nothing left to deliver to.
                return true;
            }
            if terminal {
                return true;
            }
        }
        false
    }

    async fn run_stream_worker(
        client: Client,
        config: ProviderConfig,
        request: RunRequest,
        event_tx: mpsc::UnboundedSender<RunEventMapped>,
        cancel: CancellationToken,
    ) {
        let target = request.target;
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(target = ?target, "run stream cancelled before it opened");
                return;
            }
            response = Self::open_stream(&client, &config, &request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    session_id = %request.session_id,
                    error = %error,
                    "failed to open run stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(target = ?target, "run stream cancelled");
                    return;
                }
                next_chunk = bytes.next() => {
                    match next_chunk {
                        Some(Ok(chunk)) => {
                            for frame in decoder.push(&chunk) {
                                if Self::forward_frame(&event_tx, target, &frame) {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "run stream read failed"
                            );
                            Self::emit_error_event(
                                &event_tx,
                                target,
                                ProviderError::ReadStream {
                                    stage: "read-run-stream",
                                    source,
                                },
                            );
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            let _ = Self::forward_frame(&event_tx, target, &frame);
        }
        // Closing without a terminal frame is reported by the consumer once the channel drains.
    }
}

impl RunProvider for AssistantsRunProvider {
    fn name(&self) -> &str {
        "Assistants runs"
    }

    fn open_run_stream(&self, request: RunRequest) -> ProviderResult<RunStreamHandle> {
        ensure!(
            !request.credentials.provider_key.is_empty(),
            MissingProviderKeySnafu {
                stage: "open-run-stream",
                session_id: request.session_id.clone(),
            }
        );
        ensure!(
            !request.credentials.assistant_id.trim().is_empty(),
            MissingAssistantIdSnafu {
                stage: "open-run-stream",
                session_id: request.session_id.clone(),
            }
        );

        let (event_tx, stream, cancel) = make_event_stream(request.target);
        let worker: RunWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel,
        ));

        Ok(RunStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::stream;
    use serde_json::Value;

    use super::*;
    use crate::backend::{ProviderKey, RunCredentials};
    use crate::events::{RunSeq, SessionEpoch};
    use crate::provider::RunEventStream;
    use crate::test_server::{Recorded, TestServer, recorded_values};

    const RUNS_PATH: &str = "/v1/threads/thread_1/runs";
    const STREAM_TIMEOUT: Duration = Duration::from_secs(3);

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    fn request(key: &str, assistant_id: &str) -> RunRequest {
        RunRequest::new(
            RunTarget::new(SessionEpoch::new(1), RunSeq::new(1)),
            "thread_1",
            RunCredentials {
                provider_key: ProviderKey::new(key),
                assistant_id: assistant_id.to_string(),
            },
        )
    }

    #[test]
    fn message_created_starts_a_response() {
        let events = AssistantsRunProvider::map_frame(&frame(
            "thread.message.created",
            r#"{"id":"msg_1","object":"thread.message"}"#,
        ))
        .expect("frame maps");
        assert_eq!(events, vec![RunEvent::RunStarted]);
    }

    #[test]
    fn message_delta_yields_text_fragments_in_order() {
        let events = AssistantsRunProvider::map_frame(&frame(
            "thread.message.delta",
            r#"{"id":"msg_1","delta":{"content":[
                {"index":0,"type":"text","text":{"value":"Hi"}},
                {"index":1,"type":"image_file","image_file":{"file_id":"f"}},
                {"index":2,"type":"text","text":{"value":" there"}}
            ]}}"#,
        ))
        .expect("frame maps");
        assert_eq!(
            events,
            vec![
                RunEvent::TextDelta("Hi".to_string()),
                RunEvent::TextDelta(" there".to_string()),
            ]
        );
    }

    #[test]
    fn code_interpreter_step_delta_carries_input_and_outputs() {
        let events = AssistantsRunProvider::map_frame(&frame(
            "thread.run.step.delta",
            r#"{"delta":{"step_details":{"type":"tool_calls","tool_calls":[
                {"index":0,"type":"code_interpreter","code_interpreter":{
                    "input":"print(42)",
                    "outputs":[
                        {"index":0,"type":"logs","logs":"42"},
                        {"index":1,"type":"image","image":{"file_id":"file_9"}}
                    ]}},
                {"index":1,"type":"retrieval","retrieval":{}}
            ]}}}"#,
        ))
        .expect("frame maps");
        assert_eq!(
            events,
            vec![RunEvent::CodeInterpreter(CodeInterpreterDelta {
                input: Some("print(42)".to_string()),
                outputs: vec![
                    CodeOutput::Logs("42".to_string()),
                    CodeOutput::Image {
                        file_id: "file_9".to_string()
                    },
                ],
            })]
        );
    }

    #[test]
    fn failed_run_surfaces_last_error_message() {
        let events = AssistantsRunProvider::map_frame(&frame(
            "thread.run.failed",
            r#"{"status":"failed","last_error":{"code":"rate_limit_exceeded","message":"quota exceeded"}}"#,
        ))
        .expect("frame maps");
        assert_eq!(events, vec![RunEvent::Error("quota exceeded".to_string())]);

        let events = AssistantsRunProvider::map_frame(&frame(
            "thread.run.expired",
            r#"{"status":"expired","last_error":null}"#,
        ))
        .expect("frame maps");
        assert_eq!(events, vec![RunEvent::Error("run expired".to_string())]);
    }

    #[test]
    fn done_sentinel_and_unknown_events() {
        assert_eq!(
            AssistantsRunProvider::map_frame(&frame("done", "[DONE]")).expect("frame maps"),
            vec![RunEvent::End]
        );
        assert!(
            AssistantsRunProvider::map_frame(&frame("thread.run.queued", "{}"))
                .expect("frame maps")
                .is_empty()
        );
    }

    #[test]
    fn malformed_delta_is_a_decode_error() {
        let error = AssistantsRunProvider::map_frame(&frame("thread.message.delta", "{not json"))
            .expect_err("decode should fail");
        assert!(matches!(error, ProviderError::DecodeEvent { .. }));
    }

    #[test]
    fn missing_credentials_are_rejected_before_any_io() {
        let provider = AssistantsRunProvider::new(ProviderConfig::default()).expect("client");
        assert!(matches!(
            provider.open_run_stream(request(" ", "asst_1")),
            Err(ProviderError::MissingProviderKey { .. })
        ));
        assert!(matches!(
            provider.open_run_stream(request("sk-test", "")),
            Err(ProviderError::MissingAssistantId { .. })
        ));
    }

    #[tokio::test]
    async fn forward_frame_stops_at_terminal_event() {
        let (event_tx, mut stream, _cancel) =
            make_event_stream(RunTarget::new(SessionEpoch::new(1), RunSeq::new(1)));
        let target = stream.target();

        assert!(!AssistantsRunProvider::forward_frame(
            &event_tx,
            target,
            &frame("thread.message.created", "{}"),
        ));
        assert!(AssistantsRunProvider::forward_frame(
            &event_tx,
            target,
            &frame("thread.run.failed", r#"{"last_error":{"message":"boom"}}"#),
        ));

        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(RunEvent::RunStarted)
        );
        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(RunEvent::Error("boom".to_string()))
        );
    }

    fn event_stream_response(body: Body) -> impl axum::response::IntoResponse {
        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    async fn open_against(server: &TestServer) -> (RunEventStream, tokio::task::JoinHandle<()>) {
        let provider =
            AssistantsRunProvider::new(ProviderConfig::new(format!("{}/v1", server.base_url)))
                .expect("provider");
        let RunStreamHandle { stream, worker } = provider
            .open_run_stream(request("sk-test", "asst_1"))
            .expect("stream opens");
        (stream, tokio::spawn(worker))
    }

    async fn collect_until_terminal(stream: &mut RunEventStream) -> Vec<RunEvent> {
        tokio::time::timeout(STREAM_TIMEOUT, async {
            let mut events = Vec::new();
            while let Some(event) = stream.recv().await {
                let terminal = event.payload.is_terminal();
                events.push(event.payload);
                if terminal {
                    break;
                }
            }
            events
        })
        .await
        .expect("run events within timeout")
    }

    #[tokio::test]
    async fn worker_decodes_a_chunked_run_stream_in_order() {
        let recorded = Recorded::default();
        let app = Router::new()
            .route(
                RUNS_PATH,
                post(
                    |State(recorded): State<Recorded>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let header_value = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|value| value.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        {
                            let mut recorded = recorded.lock().expect("recorded lock");
                            recorded.push(("authorization".to_string(), header_value("authorization")));
                            recorded.push(("openai-beta".to_string(), header_value("openai-beta")));
                            recorded.push(("body".to_string(), body.to_string()));
                        }
                        let chunks = [
                            "event: thread.message.created\ndata: {\"id\":\"msg_1\"}\n\nevent: thread.mess",
                            "age.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\"Hi\"}}]}}\n",
                            "\nevent: thread.message.delta\ndata: {\"delta\":{\"content\":[{\"type\":\"text\",\"text\":{\"value\":\" there\"}}]}}\n\n",
                            "event: done\ndata: [DONE]\n\n",
                        ];
                        event_stream_response(Body::from_stream(stream::iter(
                            chunks.map(Ok::<_, Infallible>),
                        )))
                    },
                ),
            )
            .with_state(recorded.clone());
        let server = TestServer::spawn(app).await;
        let (mut stream, worker) = open_against(&server).await;

        let events = collect_until_terminal(&mut stream).await;

        assert_eq!(
            events,
            vec![
                RunEvent::RunStarted,
                RunEvent::TextDelta("Hi".to_string()),
                RunEvent::TextDelta(" there".to_string()),
                RunEvent::End,
            ]
        );
        tokio::time::timeout(STREAM_TIMEOUT, worker)
            .await
            .expect("worker finishes")
            .expect("worker task");

        let seen = recorded_values(&recorded);
        assert_eq!(seen[0].1, "Bearer sk-test");
        assert_eq!(seen[1].1, "assistants=v2");
        let body: Value = serde_json::from_str(&seen[2].1).expect("json body");
        assert_eq!(body, json!({"assistant_id": "asst_1", "stream": true}));
    }

    #[tokio::test]
    async fn rejected_run_is_reported_as_an_error_event() {
        let app = Router::new().route(
            RUNS_PATH,
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": {"message": "Rate limit reached"}})),
                )
            }),
        );
        let server = TestServer::spawn(app).await;
        let (mut stream, _worker) = open_against(&server).await;

        let events = collect_until_terminal(&mut stream).await;

        assert_eq!(
            events,
            vec![RunEvent::Error(
                "provider returned status 429: Rate limit reached".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn cancelling_an_open_stream_stops_the_worker() {
        let app = Router::new().route(
            RUNS_PATH,
            post(|| async {
                let first = stream::iter([Ok::<_, Infallible>(
                    "event: thread.message.created\ndata: {}\n\n",
                )]);
                event_stream_response(Body::from_stream(first.chain(stream::pending())))
            }),
        );
        let server = TestServer::spawn(app).await;
        let (mut stream, worker) = open_against(&server).await;

        let first = tokio::time::timeout(STREAM_TIMEOUT, stream.recv())
            .await
            .expect("first event within timeout")
            .map(|event| event.payload);
        assert_eq!(first, Some(RunEvent::RunStarted));

        stream.cancellation_token().cancel();
        tokio::time::timeout(STREAM_TIMEOUT, worker)
            .await
            .expect("worker stops after cancellation")
            .expect("worker task");
        assert!(stream.try_recv().is_none());
    }
}
