//! Server-sent events transport.
//!
//! Each SSE message carries one frame. Two layouts are accepted:
//!
//! ```text
//! data: {"type":"progress_update","data":{"value":40}}
//!
//! event: status_update
//! data: {"message":"Converting to SEG..."}
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ChannelError;
use crate::event::ChannelEvent;
use crate::source::EventSource;

struct RawFrame {
    event: Option<String>,
    data: String,
}

pub struct SseSource {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    /// Undecoded bytes; a chunk may end inside a multi-byte character.
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    finished: bool,
}

impl SseSource {
    /// Open the event stream at `url`.
    pub async fn connect(client: &reqwest::Client, url: &str) -> Result<Self, ChannelError> {
        let resp = client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ChannelError::Unavailable(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        info!(url = %url, "event stream connected");
        Ok(Self::from_stream(resp.bytes_stream()))
    }

    pub fn from_stream<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            finished: false,
        }
    }

    /// Consume complete lines from the buffer until a blank line closes a message.
    fn take_frame(&mut self) -> Option<RawFrame> {
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]).trim_end_matches('\r').to_string();

            if line.is_empty() {
                if self.data.is_empty() {
                    self.event = None;
                    continue;
                }
                return Some(RawFrame {
                    event: self.event.take(),
                    data: std::mem::take(&mut self.data).join("\n"),
                });
            }
            // Comment / keep-alive
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        None
    }

    fn decode(frame: RawFrame) -> Result<Option<ChannelEvent>, ChannelError> {
        match frame.event.as_deref() {
            Some(name) if name != "message" => {
                let data = if frame.data.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&frame.data)?
                };
                ChannelEvent::from_parts(name, data)
            }
            _ => ChannelEvent::from_json(&frame.data),
        }
    }
}

#[async_trait]
impl EventSource for SseSource {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, ChannelError> {
        loop {
            if let Some(frame) = self.take_frame() {
                match Self::decode(frame) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable SSE message");
                        continue;
                    }
                }
            }
            if self.finished {
                return Ok(None);
            }

            match self.inner.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    // Flush a trailing message that was not terminated by a blank line.
                    self.finished = true;
                    self.buffer.extend_from_slice(b"\n\n");
                }
            }
        }
    }

    fn name(&self) -> &str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::JobOutcome;
    use provisioner_core::Progress;

    fn source(chunks: &[&str]) -> SseSource {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            chunks.iter().map(|c| Ok(Bytes::from(c.to_string()))).collect();
        SseSource::from_stream(futures::stream::iter(chunks))
    }

    fn byte_source(chunks: Vec<Vec<u8>>) -> SseSource {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        SseSource::from_stream(futures::stream::iter(chunks))
    }

    async fn drain(mut source: SseSource) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Some(event) = source.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn parses_data_frames_split_across_chunks() {
        let events = drain(source(&[
            "data: {\"type\":\"progress_update\",\"da",
            "ta\":{\"value\":40}}\n\n: keep-alive\n\n",
            "data: {\"type\":\"status_update\",\"data\":{\"message\":\"Running\"}}\r\n\r\n",
        ]))
        .await;

        assert_eq!(
            events,
            vec![
                ChannelEvent::Progress(Progress::Percent(40)),
                ChannelEvent::Status("Running".into()),
            ]
        );
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let frame = "data: {\"type\":\"status_update\",\"data\":{\"message\":\"Übersetzung\"}}\n\n";
        let bytes = frame.as_bytes();
        // 'Ü' is two bytes; cut between them.
        let cut = frame.find('Ü').unwrap() + 1;
        let events = drain(byte_source(vec![bytes[..cut].to_vec(), bytes[cut..].to_vec()])).await;

        assert_eq!(events, vec![ChannelEvent::Status("Übersetzung".into())]);
    }

    #[tokio::test]
    async fn named_events_carry_bare_payloads() {
        let events = drain(source(&[
            "event: model_instances_update\ndata:\n\n",
            "event: job_finished\ndata: {\"succeeded\":false,\"message\":\"boom\"}\n\n",
        ]))
        .await;

        assert_eq!(
            events,
            vec![
                ChannelEvent::ModelListChanged,
                ChannelEvent::JobFinished(JobOutcome::failure("boom")),
            ]
        );
    }

    #[tokio::test]
    async fn skips_garbage_and_flushes_trailing_message() {
        let events = drain(source(&[
            "data: not json\n\n",
            "data: {\"type\":\"toast_message\",\"data\":{\"message\":\"hi\",\"type\":\"warning\"}}",
        ]))
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category(), crate::EventCategory::Toast);
    }
}
