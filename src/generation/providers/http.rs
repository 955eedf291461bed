//! HTTP plumbing shared by the built-in provider families.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::ProviderError;

const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

pub fn client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

pub fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transport(err.to_string())
}

/// Turn a non-success response into a [`ProviderError`].
pub async fn error_for_status(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after_ms = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs * 1_000);
    let body = response.text().await.unwrap_or_default();

    if status == 429 {
        ProviderError::RateLimited {
            status,
            retry_after_ms: retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS),
        }
    } else {
        ProviderError::Status { status, body }
    }
}

/// One parsed server-sent event: optional `event:` name plus its `data:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE line parser. Feed it bytes; it yields complete events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    /// Trailing bytes of a UTF-8 sequence split across network chunks.
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed raw bytes. A multibyte character cut at the chunk boundary is
    /// held back until the rest of it arrives; invalid bytes become U+FFFD.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    consumed += valid.len();
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed += len.min(after.len());
                        }
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        self.feed(&text)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                self.event = None;
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }
        }

        events
    }

    /// Emit whatever is pending when the byte stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
            self.buffer.push_str(&tail);
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let mut events = self.feed(&format!("{}\n", rest));
            if let Some(event) = events.pop() {
                return Some(event);
            }
        }
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// What a family makes of one SSE event.
pub enum SseAction<T> {
    Emit(T),
    Skip,
    Stop(T),
}

/// Drive `byte_stream` through an [`SseParser`], mapping each event with
/// `on_event` and forwarding the results to `tx`. A transport error is
/// forwarded through `on_error` and ends the stream.
pub async fn pump_sse<B, S, T, F, E>(byte_stream: S, tx: mpsc::UnboundedSender<T>, mut on_event: F, on_error: E)
where
    B: AsRef<[u8]>,
    S: Stream<Item = Result<B, reqwest::Error>>,
    F: FnMut(&SseEvent) -> SseAction<T>,
    E: Fn(ProviderError) -> T,
{
    let mut parser = SseParser::default();
    let mut stream = Box::pin(byte_stream);

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("SSE stream error: {}", e);
                let _ = tx.send(on_error(transport(e)));
                return;
            }
        };
        for event in parser.feed_bytes(bytes.as_ref()) {
            match on_event(&event) {
                SseAction::Emit(item) => {
                    let _ = tx.send(item);
                }
                SseAction::Skip => {}
                SseAction::Stop(item) => {
                    let _ = tx.send(item);
                    return;
                }
            }
        }
    }

    if let Some(event) = parser.finish() {
        match on_event(&event) {
            SseAction::Emit(item) | SseAction::Stop(item) => {
                let _ = tx.send(item);
            }
            SseAction::Skip => {}
        }
    }
}
