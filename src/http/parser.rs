//! HTTP/1.1 message framing
//!
//! Reads one message at a time from a buffered stream. The head is read
//! line by line (`START_LINE -> HEADERS`), then the body according to its
//! framing: a fixed length, chunked (size line, chunk data, trailer) or
//! everything until the peer closes.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use super::body::Body;
use super::header::{HeaderField, HeaderMap, RequestHeader, ResponseHeader, TargetContext};
use crate::error::ProtocolError;

pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const MAX_CHUNK_LINE: usize = 4096;
const MAX_LEADING_EMPTY_LINES: usize = 8;

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    AwaitingSize,
    ReadingChunk(usize),
    Trailer,
    Done,
}

/// Reads requests and responses with size limits applied
#[derive(Debug, Clone, Copy)]
pub struct MessageReader {
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_BODY_BYTES)
    }
}

impl MessageReader {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            max_header_bytes,
            max_body_bytes,
        }
    }

    /// Read the next request. `Ok(None)` means the peer closed cleanly
    /// between messages.
    pub async fn read_request<R>(
        &self,
        reader: &mut R,
        ctx: &TargetContext,
    ) -> Result<Option<(RequestHeader, Body)>, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let (start_line, headers) = match self.read_head(reader).await? {
            Some(head) => head,
            None => return Ok(None),
        };
        if start_line.split(' ').count() != 3 {
            return Err(ProtocolError::MalformedStartLine(start_line));
        }

        let framing = request_framing(&headers)?;
        let body = self.read_body(reader, framing, &headers).await?;

        // The body has been consumed, so a bad target leaves the stream at
        // a message boundary.
        let header = RequestHeader::parse_start_line(&start_line, headers, ctx)?;
        Ok(Some((header, body)))
    }

    /// Read the final response to a request made with `request_method`.
    ///
    /// Interim 1xx heads other than 101 are consumed and dropped.
    pub async fn read_response<R>(
        &self,
        reader: &mut R,
        request_method: &str,
    ) -> Result<(ResponseHeader, Body), ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let header = loop {
            let (start_line, headers) = self
                .read_head(reader)
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            let header = ResponseHeader::parse_start_line(&start_line, headers)?;
            if !header.is_interim() {
                break header;
            }
            trace!(status = header.status, "Skipping interim response");
        };

        let framing = if header.is_bodiless(request_method) {
            Framing::None
        } else {
            response_framing(&header.headers)?
        };
        let body = self.read_body(reader, framing, &header.headers).await?;
        Ok((header, body))
    }

    async fn read_head<R>(&self, reader: &mut R) -> Result<Option<(String, HeaderMap)>, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut consumed = 0usize;
        let mut start_line = None;

        for _ in 0..=MAX_LEADING_EMPTY_LINES {
            let remaining = self.remaining_header_budget(consumed)?;
            let (line, read) = match read_line(reader, remaining).await? {
                Line::Complete(line, read) => (line, read),
                Line::Eof if consumed == 0 => return Ok(None),
                Line::Eof | Line::Partial => return Err(ProtocolError::UnexpectedEof),
                Line::TooLong => {
                    return Err(ProtocolError::HeaderTooLarge {
                        limit: self.max_header_bytes,
                    })
                }
            };
            consumed += read;
            if !line.is_empty() {
                start_line = Some(line);
                break;
            }
        }
        let start_line = start_line.ok_or_else(|| ProtocolError::MalformedStartLine(String::new()))?;

        let mut headers = HeaderMap::new();
        loop {
            let remaining = self.remaining_header_budget(consumed)?;
            let (line, read) = match read_line(reader, remaining).await? {
                Line::Complete(line, read) => (line, read),
                Line::Eof | Line::Partial => return Err(ProtocolError::UnexpectedEof),
                Line::TooLong => {
                    return Err(ProtocolError::HeaderTooLarge {
                        limit: self.max_header_bytes,
                    })
                }
            };
            consumed += read;
            if line.is_empty() {
                break;
            }
            headers.push_field(HeaderField::parse(&line)?);
        }

        Ok(Some((start_line, headers)))
    }

    fn remaining_header_budget(&self, consumed: usize) -> Result<usize, ProtocolError> {
        self.max_header_bytes
            .checked_sub(consumed)
            .filter(|n| *n > 0)
            .ok_or(ProtocolError::HeaderTooLarge {
                limit: self.max_header_bytes,
            })
    }

    async fn read_body<R>(&self, reader: &mut R, framing: Framing, headers: &HeaderMap) -> Result<Body, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        match framing {
            Framing::None => Ok(Body::with_length(Vec::new(), headers.content_length().unwrap_or(None))),
            Framing::Length(len) => {
                if len > self.max_body_bytes {
                    return Err(ProtocolError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    });
                }
                let mut content = vec![0u8; len];
                reader.read_exact(&mut content).await.map_err(eof_aware)?;
                Ok(Body::with_length(content, Some(len)))
            }
            Framing::Chunked => self.read_chunked(reader).await,
            Framing::UntilClose => {
                let mut content = Vec::new();
                (&mut *reader)
                    .take(self.max_body_bytes as u64 + 1)
                    .read_to_end(&mut content)
                    .await?;
                if content.len() > self.max_body_bytes {
                    return Err(ProtocolError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    });
                }
                Ok(Body::until_close(content))
            }
        }
    }

    async fn read_chunked<R>(&self, reader: &mut R) -> Result<Body, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut content = Vec::new();
        let mut wire = Vec::new();
        let mut trailer_bytes = 0usize;
        let mut state = ChunkState::AwaitingSize;

        while state != ChunkState::Done {
            state = match state {
                ChunkState::AwaitingSize => {
                    let line = read_raw_line(reader, MAX_CHUNK_LINE, &mut wire).await?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        ChunkState::Trailer
                    } else {
                        content
                            .len()
                            .checked_add(size)
                            .filter(|total| *total <= self.max_body_bytes)
                            .ok_or(ProtocolError::BodyTooLarge {
                                limit: self.max_body_bytes,
                            })?;
                        ChunkState::ReadingChunk(size)
                    }
                }
                ChunkState::ReadingChunk(size) => {
                    let start = content.len();
                    content.resize(start + size, 0);
                    reader.read_exact(&mut content[start..]).await.map_err(eof_aware)?;
                    wire.extend_from_slice(&content[start..]);

                    let line = read_raw_line(reader, MAX_CHUNK_LINE, &mut wire).await?;
                    if !line.is_empty() {
                        return Err(ProtocolError::InvalidChunkSize(line));
                    }
                    ChunkState::AwaitingSize
                }
                ChunkState::Trailer => {
                    let before = wire.len();
                    let line = read_raw_line(reader, self.max_header_bytes, &mut wire).await?;
                    trailer_bytes += wire.len() - before;
                    if trailer_bytes > self.max_header_bytes {
                        return Err(ProtocolError::HeaderTooLarge {
                            limit: self.max_header_bytes,
                        });
                    }
                    if line.is_empty() {
                        ChunkState::Done
                    } else {
                        HeaderField::parse(&line)?;
                        ChunkState::Trailer
                    }
                }
                ChunkState::Done => ChunkState::Done,
            };
        }

        Ok(Body::chunked(content, wire))
    }
}

fn request_framing(headers: &HeaderMap) -> Result<Framing, ProtocolError> {
    match headers.chunked_transfer() {
        Some(true) => return Ok(Framing::Chunked),
        Some(false) => {
            let codings: Vec<&str> = headers.get_all("transfer-encoding").collect();
            return Err(ProtocolError::UnsupportedTransferCoding(codings.join(", ")));
        }
        None => {}
    }
    Ok(match headers.content_length()? {
        Some(0) | None => Framing::None,
        Some(len) => Framing::Length(len),
    })
}

fn response_framing(headers: &HeaderMap) -> Result<Framing, ProtocolError> {
    match headers.chunked_transfer() {
        Some(true) => return Ok(Framing::Chunked),
        Some(false) => return Ok(Framing::UntilClose),
        None => {}
    }
    Ok(match headers.content_length()? {
        Some(len) => Framing::Length(len),
        None => Framing::UntilClose,
    })
}

fn parse_chunk_size(line: &str) -> Result<usize, ProtocolError> {
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() || size.len() > 16 {
        return Err(ProtocolError::InvalidChunkSize(line.to_string()));
    }
    usize::from_str_radix(size, 16).map_err(|_| ProtocolError::InvalidChunkSize(line.to_string()))
}

enum Line {
    /// Line without terminator, and the number of bytes consumed
    Complete(String, usize),
    /// Stream ended before a terminator
    Partial,
    Eof,
    TooLong,
}

async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Line, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader).take(limit as u64).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() != Some(&b'\n') {
        return Ok(if read >= limit { Line::TooLong } else { Line::Partial });
    }
    Ok(Line::Complete(decode_line(buf)?, read))
}

/// Read a line for the chunked body, appending the raw bytes to `wire`
async fn read_raw_line<R>(reader: &mut R, limit: usize, wire: &mut Vec<u8>) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader).take(limit as u64).read_until(b'\n', &mut buf).await?;
    wire.extend_from_slice(&buf);
    if buf.last() != Some(&b'\n') {
        return Err(if read >= limit {
            ProtocolError::InvalidChunkSize(String::from_utf8_lossy(&buf).to_string())
        } else {
            ProtocolError::UnexpectedEof
        });
    }
    decode_line(buf)
}

fn decode_line(mut buf: Vec<u8>) -> Result<String, ProtocolError> {
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|e| ProtocolError::MalformedHeader(String::from_utf8_lossy(e.as_bytes()).to_string()))
}

fn eof_aware(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(err)
    }
}
