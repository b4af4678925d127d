//! Completion streaming uses SSE (Server-Sent Events) to deliver chunks from the gateway.
//! This module provides a frame decoder and a client that drives it from a Hyper body.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{HeaderMap, Request, Response};
use tokio::select;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::{http, TransportError};

type Result<T> = std::result::Result<T, TransportError>;

/// Small so the reader task stays at most a few events ahead of the consumer.
const CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) event: String,
    pub(crate) data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may be split anywhere, including inside a line or a multi-byte
/// character. Lines end in `\n` or `\r\n`; a blank line dispatches the event.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buffer.drain(..start);
        events
    }

    /// Dispatches whatever is pending when the body ends without a final
    /// blank line.
    pub(crate) fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&tail).into_owned();
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = value.to_owned(),
            "id" | "retry" => {}
            other => tracing::debug!("ignoring SSE field `{other}`"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.event);
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

pub(crate) struct SseClient {
    _join_handle: tokio::task::JoinHandle<()>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    rx: Receiver<Result<SseEvent>>,
    headers: HeaderMap,
}

async fn receive_events(mut res: Response<Incoming>, tx: Sender<Result<SseEvent>>) -> Result<()> {
    let mut decoder = SseDecoder::default();

    while let Some(next) = res.frame().await {
        let frame = next?;
        if let Some(chunk) = frame.data_ref() {
            for event in decoder.push(chunk) {
                if tx.send(Ok(event)).await.is_err() {
                    tracing::debug!("event consumer went away");
                    return Ok(());
                }
            }
        }
    }

    if let Some(event) = decoder.finish() {
        let _ = tx.send(Ok(event)).await;
    }
    tracing::debug!("event stream body ended");
    Ok(())
}

impl SseClient {
    /// Sends the request and, once the gateway has answered with a success
    /// status, hands the body to a reader task.
    pub(crate) async fn connect(request: Request<String>) -> Result<Self> {
        let res = http::ensure_success(http::send(request).await?).await?;
        let headers = res.headers().clone();

        let (tx, rx) = channel(CHANNEL_CAPACITY);
        let (shutdown, shutdown_signal) = tokio::sync::oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            let tx_clone = tx.clone();
            select! {
                result = receive_events(res, tx_clone) => {
                    if let Err(e) = result {
                        let _ = tx.send(Err(e)).await;
                    }
                }
                _ = shutdown_signal => {
                    tracing::debug!("event stream shut down by consumer");
                }
            }
        });

        Ok(Self {
            _join_handle: join_handle,
            shutdown: Some(shutdown),
            rx,
            headers,
        })
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl futures::Stream for SseClient {
    type Item = Result<SseEvent>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if !shutdown.is_closed() {
                shutdown.send(()).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(data: &str) -> SseEvent {
        SseEvent {
            event: String::new(),
            data: data.to_owned(),
        }
    }

    #[test]
    fn splits_on_blank_lines() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events, vec![data("{\"a\":1}"), data("[DONE]")]);
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"content\":\"Bon").is_empty());
        assert!(decoder.push(b"jour\"}\r").is_empty());
        let events = decoder.push(b"\n\r\n");
        assert_eq!(events, vec![data("{\"content\":\"Bonjour\"}")]);
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: ¡Hola!\n\n".as_bytes();
        let (head, tail) = bytes.split_at(7);
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec![data("¡Hola!")]);
    }

    #[test]
    fn reads_event_names_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\n\nevent: ping\ndata:{}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "ping".to_owned(),
                data: "{}".to_owned(),
            }]
        );
    }

    #[test]
    fn joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: first\ndata: second\n\n");
        assert_eq!(events, vec![data("first\nsecond")]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(data("[DONE]")));
        assert_eq!(decoder.finish(), None);
    }
}
