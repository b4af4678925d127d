//! Lookup and display of gateway traces for earlier requests.

use chrono::{DateTime, Utc};
use hyper::header::ACCEPT;
use hyper::{Method, Request, StatusCode, Uri};
use secrecy::ExposeSecret;

use crate::config::GatewayConfig;
use crate::gateway::{DEBUG_AUTHORIZATION_HEADER, SUBSCRIPTION_KEY_HEADER};
use crate::{http, render, Error, TransportError};

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens: Option<u64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub trace_id: String,
    #[serde(default)]
    pub spans: Vec<TraceSpan>,
}

impl TraceRecord {
    fn started(&self) -> Option<DateTime<Utc>> {
        self.spans.first().map(|span| span.timestamp)
    }

    /// Seconds between the first span and `span`.
    pub fn elapsed_secs(&self, span: &TraceSpan) -> f64 {
        self.started()
            .map(|start| (span.timestamp - start).num_microseconds().unwrap_or(0) as f64 / 1e6)
            .unwrap_or(0.0)
    }

    pub fn total_tokens(&self) -> u64 {
        self.spans.iter().filter_map(|span| span.tokens).sum()
    }

    /// `(elapsed seconds, tokens so far)` after each span.
    pub fn cumulative_tokens(&self) -> Vec<(f64, f64)> {
        let mut total = 0;
        self.spans
            .iter()
            .map(|span| {
                total += span.tokens.unwrap_or(0);
                (self.elapsed_secs(span), total as f64)
            })
            .collect()
    }

    pub fn render_table(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .spans
            .iter()
            .enumerate()
            .map(|(i, span)| {
                vec![
                    (i + 1).to_string(),
                    span.name.clone(),
                    span.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                    format!("{:.3}", self.elapsed_secs(span)),
                    span.tokens.map_or_else(|| "-".to_owned(), |t| t.to_string()),
                    span.latency_ms
                        .map_or_else(|| "-".to_owned(), |l| format!("{l:.1}")),
                ]
            })
            .collect();
        render::table(
            &format!("Trace {}", self.trace_id),
            &["#", "Span", "Timestamp", "Elapsed (s)", "Tokens", "Latency (ms)"],
            &rows,
        )
    }

    pub fn render_summary(&self) -> String {
        let elapsed = self
            .spans
            .last()
            .map(|span| self.elapsed_secs(span))
            .unwrap_or(0.0);
        let rows = vec![
            vec!["Trace Id".to_owned(), self.trace_id.clone()],
            vec!["Spans".to_owned(), self.spans.len().to_string()],
            vec!["Total Tokens".to_owned(), self.total_tokens().to_string()],
            vec!["Elapsed (s)".to_owned(), format!("{elapsed:.3}")],
        ];
        render::table("Debugging Information", &["Metric", "Value"], &rows)
    }

    pub fn render_chart(&self) -> String {
        render::line_chart(
            "Cumulative Tokens",
            "Time Elapsed (s)",
            "Tokens",
            &self.cumulative_tokens(),
        )
    }
}

pub struct TraceInspector {
    config: GatewayConfig,
}

impl TraceInspector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn trace_uri(&self, trace_id: &str) -> Result<Uri, Error> {
        let trace_id = trace_id.trim();
        if trace_id.is_empty()
            || !trace_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::InvalidInput(format!(
                "`{trace_id}` is not a valid trace identifier"
            )));
        }

        let uri = format!(
            "{}{}/{}",
            self.config.base_url(),
            self.config.trace_path(),
            trace_id
        );
        uri.parse()
            .map_err(|e| Error::Configuration(format!("invalid trace endpoint `{uri}`: {e}")))
    }

    /// Fetches the trace. Traces unknown to the gateway are
    /// [`Error::NotFound`].
    pub async fn fetch_trace(&self, trace_id: &str) -> Result<TraceRecord, Error> {
        let uri = self.trace_uri(trace_id)?;
        tracing::info!("fetching trace from: {}", uri);

        let mut builder = Request::builder()
            .uri(uri)
            .method(Method::GET)
            .header(
                SUBSCRIPTION_KEY_HEADER,
                self.config.subscription_key().expose_secret().as_str(),
            )
            .header(ACCEPT, "application/json");
        if let Some(debug) = self.config.debug_authorization() {
            builder = builder.header(DEBUG_AUTHORIZATION_HEADER, debug.expose_secret().as_str());
        }
        let request = builder.body(String::new()).map_err(TransportError::from)?;

        let response = http::send(request).await.map_err(Error::from_transport)?;
        let response = match http::ensure_success(response).await {
            Ok(response) => response,
            Err(TransportError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Err(Error::NotFound(trace_id.trim().to_owned()))
            }
            Err(e) => return Err(Error::from_transport(e)),
        };

        let body = http::read_body(response).await?;
        let mut record: TraceRecord = serde_json::from_slice(&body)?;
        record.spans.sort_by_key(|span| span.timestamp);
        tracing::debug!("trace {} has {} spans", record.trace_id, record.spans.len());
        Ok(record)
    }
}
