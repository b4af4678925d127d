#![doc = include_str!("../README.md")]

pub mod app;
pub mod config;
pub mod gateway;
mod http;
pub mod reconciler;
pub mod render;
mod sse;
pub mod tokenizer;
pub mod trace;

pub use config::{ChatConfig, ConfigProvider, EnvProvider, GatewayConfig};
pub use gateway::{
    ChatMessage, CompletionReply, CompletionRequest, CompletionResponse, CompletionStream,
    GatewayClient, StreamChunk, StreamEvent, Usage,
};
pub use reconciler::{CompletionResult, LocalUsage, Reconciler, ReconcilerState};
pub use tokenizer::{count_tokens, TokenCounter};
pub use trace::{TraceInspector, TraceRecord, TraceSpan};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("the gateway rejected the subscription credential ({status}): {body}")]
    Auth {
        status: hyper::StatusCode,
        body: String,
    },
    #[error("network error")]
    Network(#[from] TransportError),
    #[error("trace `{0}` was not found on the gateway")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("the gateway reported an error mid-stream: {0}")]
    Gateway(String),
    #[error("failed to load the {encoding} token encoding: {reason}")]
    Encoding { encoding: String, reason: String },
    #[error("failed to transcode request or response")]
    Json(#[from] serde_json::Error),
    #[error("failed to write to the display")]
    Io(#[from] std::io::Error),
}

/// Failures below the gateway protocol: connecting, TLS, HTTP framing and
/// unexpected status codes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("hyper error")]
    Hyper(#[from] hyper::Error),
    #[error("http error")]
    Http(#[from] hyper::http::Error),
    #[error("invalid server name `{0}`")]
    ServerName(String),
    #[error("request failed with status {status}: {body}")]
    Status {
        status: hyper::StatusCode,
        body: String,
    },
    #[error("timed out waiting for the response")]
    Timeout,
    #[error("the stream closed before the termination sentinel")]
    Truncated,
}

impl Error {
    /// Classifies a transport failure, lifting credential rejections out of
    /// the generic network bucket.
    pub(crate) fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::Status { status, body }
                if status == hyper::StatusCode::UNAUTHORIZED
                    || status == hyper::StatusCode::FORBIDDEN =>
            {
                Error::Auth { status, body }
            }
            other => Error::Network(other),
        }
    }

    /// The message followed by each underlying cause.
    pub fn report(&self) -> String {
        let mut report = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            report.push_str(&format!(": {cause}"));
            source = std::error::Error::source(cause);
        }
        report
    }

    /// Process exit code for the binaries.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Configuration(_) => 2,
            Error::Auth { .. } => 3,
            Error::NotFound(_) => 4,
            _ => 1,
        }
    }
}
