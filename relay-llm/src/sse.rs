use crate::error::Result;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `message` when the frame carries no `event:` field.
    pub event: String,
    pub data: String,
}

/// Split a byte stream into server-sent events.
///
/// Frames are separated by a blank line. Bytes are buffered raw so multi-byte characters split
/// across network chunks decode correctly. A final frame without a terminating blank line is
/// still emitted when the stream ends.
pub fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new(), false),
        |(mut stream, mut buffer, mut ended)| async move {
            loop {
                if let Some((idx, sep_len)) = find_frame_end(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..idx + sep_len).collect();
                    if let Some(event) = parse_frame(&raw[..idx]) {
                        return Some((Ok(event), (stream, buffer, ended)));
                    }
                    continue;
                }

                if ended {
                    if buffer.is_empty() {
                        return None;
                    }
                    let raw = std::mem::take(&mut buffer);
                    if let Some(event) = parse_frame(&raw) {
                        return Some((Ok(event), (stream, buffer, ended)));
                    }
                    return None;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (stream, buffer, true))),
                    None => ended = true,
                }
            }
        },
    )
}

fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = String::new();
    let mut data_lines = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }

    let data = data_lines.join("\n");
    if event.is_empty() && data.is_empty() {
        return None;
    }
    if event.is_empty() {
        event = "message".to_string();
    }
    Some(SseEvent { event, data })
}
