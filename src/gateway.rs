//! Chat completions through the API gateway.

use futures::Stream;
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Uri};
use secrecy::ExposeSecret;

use crate::config::ChatConfig;
use crate::sse::SseClient;
use crate::{http, Error, TransportError};

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const DEBUG_AUTHORIZATION_HEADER: &str = "Apim-Debug-Authorization";
pub const TRACE_ID_HEADER: &str = "Apim-Trace-Id";
pub const CLIENT_NAME: &str = "apim-stream";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_MAX_TOKENS: usize = 200;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.95;

/// Marks the end of a streamed completion.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A chat completion request. The deployment and API version come from the
/// client's configuration.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stream: bool,
}

impl CompletionRequest {
    /// The default system message followed by `prompt`.
    pub fn new(prompt: impl Into<String>, stream: bool) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(DEFAULT_SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ],
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stream,
        }
    }

    fn to_body(&self) -> Result<String, serde_json::Error> {
        #[derive(Debug, serde::Serialize)]
        struct StreamOptions {
            include_usage: bool,
        }

        #[derive(Debug, serde::Serialize)]
        struct GatewayRequest<'a> {
            messages: &'a [ChatMessage],
            max_tokens: usize,
            temperature: f32,
            top_p: f32,
            frequency_penalty: f32,
            presence_penalty: f32,
            stream: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            stream_options: Option<StreamOptions>,
        }

        serde_json::to_string(&GatewayRequest {
            messages: &self.messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            stream: self.stream,
            stream_options: self.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        })
    }
}

/// Provider-reported token counts. Fields the provider leaves out stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// One decoded `chat.completion.chunk`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub raw: serde_json::Value,
}

impl StreamChunk {
    pub fn from_value(raw: serde_json::Value) -> Self {
        let choice = raw
            .get("choices")
            .and_then(|choices| choices.as_array())
            .and_then(|choices| choices.first());

        let delta = choice
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(|content| content.as_str())
            .filter(|content| !content.is_empty())
            .map(str::to_owned);
        let finish_reason = choice
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(|reason| reason.as_str())
            .map(str::to_owned);

        Self {
            delta,
            finish_reason,
            usage: usage_from(&raw),
            raw,
        }
    }
}

fn usage_from(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage").filter(|usage| usage.is_object())?;
    match serde_json::from_value(usage.clone()) {
        Ok(usage) => Some(usage),
        Err(e) => {
            tracing::error!("unreadable usage block {}: {}", usage, e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// The termination sentinel was received.
    Done,
}

/// A non-streamed completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub trace_id: Option<String>,
    pub raw: serde_json::Value,
}

impl CompletionResponse {
    fn from_value(raw: serde_json::Value, trace_id: Option<String>) -> Self {
        let choice = raw
            .get("choices")
            .and_then(|choices| choices.as_array())
            .and_then(|choices| choices.first());
        let text = choice
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .unwrap_or_default()
            .to_owned();
        let finish_reason = choice
            .and_then(|choice| choice.get("finish_reason"))
            .and_then(|reason| reason.as_str())
            .map(str::to_owned);

        Self {
            text,
            finish_reason,
            usage: usage_from(&raw),
            trace_id,
            raw,
        }
    }
}

pub enum CompletionReply {
    Complete(CompletionResponse),
    Stream(CompletionStream),
}

/// Forward-only stream of completion events.
///
/// Yields [`StreamEvent::Done`] on the sentinel and ends with the body. Frames
/// the gateway sends after the sentinel are still yielded so the consumer can
/// flag them. A body that closes before the sentinel yields
/// [`TransportError::Truncated`]; an error frame yields [`Error::Gateway`] and
/// ends the stream.
pub struct CompletionStream {
    stream: Option<std::pin::Pin<Box<SseClient>>>,
    trace_id: Option<String>,
    terminated: bool,
}

impl CompletionStream {
    /// Trace id the gateway attached to the response, if tracing was on.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }
}

impl Stream for CompletionStream {
    type Item = Result<StreamEvent, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return std::task::Poll::Ready(None);
            };

            let message = stream.as_mut().poll_next(cx);

            let message = match message {
                std::task::Poll::Ready(None) => {
                    self.stream = None;
                    if self.terminated {
                        return std::task::Poll::Ready(None);
                    }
                    return std::task::Poll::Ready(Some(Err(Error::Network(
                        TransportError::Truncated,
                    ))));
                }
                std::task::Poll::Ready(Some(message)) => message,
                std::task::Poll::Pending => return std::task::Poll::Pending,
            };

            let message = match message {
                Err(error) if self.terminated => {
                    tracing::warn!("connection failed after the termination sentinel: {}", error);
                    self.stream = None;
                    return std::task::Poll::Ready(None);
                }
                Err(error) => {
                    self.stream = None;
                    return std::task::Poll::Ready(Some(Err(Error::Network(error))));
                }
                Ok(message) => message,
            };

            match message.event.as_str() {
                "ping" => {}
                "error" => {
                    self.stream = None;
                    return std::task::Poll::Ready(Some(Err(Error::Gateway(message.data))));
                }
                "" | "message" => {
                    let data = message.data.trim();
                    if data == DONE_SENTINEL {
                        if self.terminated {
                            tracing::warn!("repeated termination sentinel");
                            continue;
                        }
                        tracing::info!("stream ended");
                        self.terminated = true;
                        return std::task::Poll::Ready(Some(Ok(StreamEvent::Done)));
                    }

                    let value: serde_json::Value = match serde_json::from_str(data) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::error!("JSON decode error: {} with data: {}", e, data);
                            continue;
                        }
                    };
                    if let Some(error) = value.get("error") {
                        let error = error.to_string();
                        self.stream = None;
                        return std::task::Poll::Ready(Some(Err(Error::Gateway(error))));
                    }

                    return std::task::Poll::Ready(Some(Ok(StreamEvent::Chunk(
                        StreamChunk::from_value(value),
                    ))));
                }
                other => tracing::error!(
                    "unexpected gateway event: `{other}` with data {}",
                    message.data
                ),
            }
        }
    }
}

fn trace_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

pub struct GatewayClient {
    endpoint: Uri,
    config: ChatConfig,
}

impl GatewayClient {
    pub fn new(config: &ChatConfig) -> Result<Self, Error> {
        let endpoint = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            config.gateway.base_url(),
            config.deployment,
            config.api_version
        );
        let endpoint = endpoint.parse().map_err(|e| {
            Error::Configuration(format!("invalid completions endpoint `{endpoint}`: {e}"))
        })?;

        Ok(Self {
            endpoint,
            config: config.clone(),
        })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<Request<String>, Error> {
        let body = request.to_body()?;
        tracing::debug!("gateway request body: {}", body);

        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let request_id = chrono::Utc::now().timestamp_micros().to_string();

        let mut builder = Request::builder()
            .uri(self.endpoint.clone())
            .method(Method::POST)
            .header(
                SUBSCRIPTION_KEY_HEADER,
                self.config.gateway.subscription_key().expose_secret().as_str(),
            )
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .header("Request-ID", request_id)
            .header("Client-Name", CLIENT_NAME);
        if let Some(debug) = self.config.gateway.debug_authorization() {
            builder = builder.header(DEBUG_AUTHORIZATION_HEADER, debug.expose_secret().as_str());
        }
        let request = builder.body(body).map_err(TransportError::from)?;

        tracing::info!("sending request to: {}", self.endpoint);
        tracing::debug!("request headers: {:#?}", redacted(request.headers()));
        Ok(request)
    }

    /// Performs the completion call. There are no retries: the first
    /// failure is returned.
    pub async fn send_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionReply, Error> {
        let http_request = self.build_request(request)?;

        if request.stream {
            let sse = SseClient::connect(http_request)
                .await
                .map_err(Error::from_transport)?;
            let trace_id = trace_id_from(sse.headers());
            return Ok(CompletionReply::Stream(CompletionStream {
                stream: Some(Box::pin(sse)),
                trace_id,
                terminated: false,
            }));
        }

        let response = http::send(http_request)
            .await
            .map_err(Error::from_transport)?;
        let response = http::ensure_success(response)
            .await
            .map_err(Error::from_transport)?;
        let trace_id = trace_id_from(response.headers());
        let body = http::read_body(response).await?;
        let value = serde_json::from_slice(&body)?;
        Ok(CompletionReply::Complete(CompletionResponse::from_value(
            value, trace_id,
        )))
    }
}

/// Header map safe to log.
fn redacted(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name.as_str().eq_ignore_ascii_case(SUBSCRIPTION_KEY_HEADER)
                || name.as_str().eq_ignore_ascii_case(DEBUG_AUTHORIZATION_HEADER)
            {
                "<redacted>".to_owned()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.to_string(), value)
        })
        .collect()
}
