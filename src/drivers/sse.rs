//! Server-sent events framing (Bytes -> frames).
//!
//! Provider semantics stay in the adapters; this only splits the byte stream into
//! `event:`/`data:` frames.

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use std::pin::Pin;

/// One SSE frame. Multiple `data:` lines are joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    fn parse(raw: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in raw.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if data.is_empty() && event.is_none() {
            return None;
        }
        Some(Self {
            event,
            data: data.join("\n"),
        })
    }
}

pub type FrameStream<E> = Pin<Box<dyn Stream<Item = Result<SseFrame, E>> + Send>>;

/// Incrementally buffers bytes and emits complete frames split on blank lines.
///
/// Buffering is done on raw bytes so multi-byte characters split across reads
/// survive. A trailing frame without its blank line is still emitted at EOF.
pub fn decode<S, E>(input: S) -> FrameStream<E>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let input: Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>> = Box::pin(input);
    let frames = stream::unfold(
        (input, Vec::<u8>::new(), false),
        |(mut input, mut buf, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(idx) = find_delimiter(&buf) {
                    let raw = String::from_utf8_lossy(&buf[..idx]).into_owned();
                    buf.drain(..idx + 2);
                    match SseFrame::parse(&raw) {
                        Some(frame) => return Some((Ok(frame), (input, buf, false))),
                        None => continue,
                    }
                }

                match input.next().await {
                    Some(Ok(bytes)) => {
                        buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => return Some((Err(e), (input, buf, true))),
                    None => {
                        let raw = String::from_utf8_lossy(&buf).into_owned();
                        return SseFrame::parse(&raw)
                            .map(|frame| (Ok(frame), (input, Vec::new(), true)));
                    }
                }
            }
        },
    );
    Box::pin(frames)
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}
