use super::{Headers, ParsedRequest, RequestHead, UploadSink};
use crate::channel::Channel;
use crate::error::FramingError;
use crate::protocol::STREAM_CHUNK;

const TERMINATOR: &[u8] = b"\r\n\r\n";
const HEAD_READ: usize = 8 * 1024;

fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(TERMINATOR.len() - 1);
    buf.get(start..)?
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|pos| start + pos)
}

/// Parse the bytes before `\r\n\r\n`.
pub fn parse_head(raw: &[u8]) -> Result<RequestHead, FramingError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) if v.starts_with("HTTP/") => (m, p, v),
        _ => return Err(FramingError::RequestLine(request_line.to_string())),
    };

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(FramingError::Header(line.to_string()));
        };
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(FramingError::Header(line.to_string()));
        }
        headers.insert(name, value.trim());
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Read until the header terminator. Returns the head and whatever body
/// bytes arrived in the same reads.
pub async fn read_head<C: Channel + ?Sized>(
    channel: &C,
    max_header_bytes: usize,
) -> Result<(RequestHead, Vec<u8>), FramingError> {
    let mut buf: Vec<u8> = Vec::with_capacity(HEAD_READ);
    loop {
        let searched = buf.len();
        let Some(chunk) = channel.read(HEAD_READ).await? else {
            return Err(FramingError::Incomplete);
        };
        buf.extend_from_slice(&chunk);

        if let Some(end) = find_terminator(&buf, searched) {
            if end > max_header_bytes {
                return Err(FramingError::HeaderTooLarge {
                    limit: max_header_bytes,
                });
            }
            let head = parse_head(&buf[..end])?;
            let rest = buf.split_off(end + TERMINATOR.len());
            return Ok((head, rest));
        }
        if buf.len() > max_header_bytes {
            return Err(FramingError::HeaderTooLarge {
                limit: max_header_bytes,
            });
        }
    }
}

/// Complete the body given what [`read_head`] already buffered.
pub async fn read_body<C: Channel + ?Sized>(
    channel: &C,
    head: &RequestHead,
    mut buffered: Vec<u8>,
    max_body_bytes: usize,
) -> Result<Option<Vec<u8>>, FramingError> {
    match head.content_length()? {
        None if buffered.is_empty() => Ok(None),
        None => Ok(Some(buffered)),
        Some(length) if length > max_body_bytes => Err(FramingError::BodyTooLarge {
            length,
            limit: max_body_bytes,
        }),
        Some(length) => {
            if buffered.len() >= length {
                buffered.truncate(length);
            } else {
                let rest = channel.read_exactly(length - buffered.len()).await?;
                buffered.extend_from_slice(&rest);
            }
            Ok(Some(buffered))
        }
    }
}

/// Read a full request, buffering the body.
pub async fn read_request<C: Channel + ?Sized>(
    channel: &C,
    max_header_bytes: usize,
    max_body_bytes: usize,
) -> Result<ParsedRequest, FramingError> {
    let (head, buffered) = read_head(channel, max_header_bytes).await?;
    let body = read_body(channel, &head, buffered, max_body_bytes).await?;
    Ok(ParsedRequest { head, body })
}

/// Move the body into `sink` one chunk at a time. Without `Content-Length`
/// the body runs to end-of-stream. Returns the byte count written.
pub async fn stream_body<C: Channel + ?Sized>(
    channel: &C,
    head: &RequestHead,
    buffered: Vec<u8>,
    sink: &mut dyn UploadSink,
) -> Result<u64, FramingError> {
    let length = head.content_length()?;
    let mut written = 0u64;

    let first = match length {
        Some(n) => &buffered[..buffered.len().min(n)],
        None => &buffered[..],
    };
    if !first.is_empty() {
        sink.write_chunk(first)?;
        written += first.len() as u64;
    }
    drop(buffered);

    loop {
        let want = match length {
            Some(n) => {
                let remaining = n as u64 - written;
                if remaining == 0 {
                    break;
                }
                remaining.min(STREAM_CHUNK as u64) as usize
            }
            None => STREAM_CHUNK,
        };
        match channel.read(want).await? {
            Some(chunk) => {
                sink.write_chunk(&chunk)?;
                written += chunk.len() as u64;
            }
            None => match length {
                Some(n) => {
                    return Err(FramingError::Channel(
                        crate::error::ChannelError::PrematureEof {
                            expected: n,
                            received: written as usize,
                        },
                    ))
                }
                None => break,
            },
        }
    }
    Ok(written)
}
