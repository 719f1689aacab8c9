use std::io;

use swap_core::HttpBodyMode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// A stream plus the bytes read from it past the last message boundary.
pub(crate) struct BufferedConn<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

/// Reads until `pattern` and returns everything up to and including it.
/// `Ok(None)` means the peer closed cleanly before sending anything.
pub(crate) async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut searched = 0;
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf[searched..], pattern) {
            let end = searched + start + pattern.len();
            return Ok(Some(conn.read_buf.drain(..end).collect()));
        }
        searched = conn.read_buf.len().saturating_sub(pattern.len() - 1);

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP header exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Copies one message body from `source` to `sink` according to `mode` and
/// returns the number of payload bytes. Chunk framing is copied verbatim.
pub(crate) async fn relay_body<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mode: HttpBodyMode,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let total = match mode {
        HttpBodyMode::None => 0,
        HttpBodyMode::ContentLength(length) => relay_exact(source, sink, length).await?,
        HttpBodyMode::Chunked => relay_chunked(source, sink).await?,
        HttpBodyMode::CloseDelimited => relay_until_eof(source, sink).await?,
    };
    sink.flush().await?;
    Ok(total)
}

/// Reads and discards one message body.
pub(crate) async fn drain_body<RS: AsyncRead + Unpin>(
    source: &mut BufferedConn<RS>,
    mode: HttpBodyMode,
) -> io::Result<u64> {
    relay_body(source, &mut tokio::io::sink(), mode).await
}

async fn relay_exact<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mut length: u64,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    if !source.read_buf.is_empty() && length > 0 {
        let take = std::cmp::min(length, source.read_buf.len() as u64) as usize;
        sink.write_all(&source.read_buf[..take]).await?;
        source.read_buf.drain(..take);
        length -= take as u64;
        total += take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while length > 0 {
        let want = std::cmp::min(IO_CHUNK_SIZE as u64, length) as usize;
        let read = source.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body completed",
            ));
        }
        sink.write_all(&chunk[..read]).await?;
        length -= read as u64;
        total += read as u64;
    }

    Ok(total)
}

async fn relay_chunked<RS, WS>(source: &mut BufferedConn<RS>, sink: &mut WS) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let line = read_until_pattern(source, b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk size line was read",
                )
            })?;
        sink.write_all(&line).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            relay_trailers(source, sink).await?;
            return Ok(total);
        }

        total += relay_exact(source, sink, chunk_len).await?;

        let terminator = read_exact_from_source(source, 2).await?;
        if terminator.as_slice() != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk terminator",
            ));
        }
        sink.write_all(&terminator).await?;
    }
}

/// Copies trailer lines up to and including the empty line.
async fn relay_trailers<RS, WS>(source: &mut BufferedConn<RS>, sink: &mut WS) -> io::Result<()>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    loop {
        let line = read_until_pattern(source, b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunked trailers completed",
                )
            })?;
        sink.write_all(&line).await?;
        if line.as_slice() == b"\r\n" {
            return Ok(());
        }
    }
}

async fn relay_until_eof<RS, WS>(source: &mut BufferedConn<RS>, sink: &mut WS) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = source.read_buf.len() as u64;
    if !source.read_buf.is_empty() {
        sink.write_all(&source.read_buf).await?;
        source.read_buf.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = match source.stream.read(&mut chunk).await {
            Ok(read) => read,
            // Peers commonly skip close_notify on close-delimited bodies.
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(error) => return Err(error),
        };
        if read == 0 {
            break;
        }
        sink.write_all(&chunk[..read]).await?;
        total += read as u64;
    }
    Ok(total)
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

async fn read_exact_from_source<S: AsyncRead + Unpin>(
    source: &mut BufferedConn<S>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while source.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before fixed-length body completed",
            ));
        }
        source.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(source.read_buf.drain(..exact_len).collect())
}

/// Writes a small proxy-generated response. A `204` carries no body and no
/// length header.
pub(crate) async fn write_local_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: u16,
    body: &str,
    close: bool,
) -> io::Result<()> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("");
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    if close {
        response.push_str("Connection: close\r\n");
    }
    response.push_str("Content-Type: text/plain\r\n");
    if status == 204 {
        response.push_str("\r\n");
    } else {
        response.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    }
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use swap_core::HttpBodyMode;

    use super::{drain_body, read_until_pattern, relay_body, write_local_response, BufferedConn};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chunked_body_is_copied_verbatim_with_trailers() {
        let wire: &[u8] = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let mut source = BufferedConn::new(wire);
        let mut sink = Vec::new();
        let payload = relay_body(&mut source, &mut sink, HttpBodyMode::Chunked)
            .await
            .expect("relay chunked");
        assert_eq!(payload, 9);
        assert_eq!(sink, &wire[..wire.len() - 4]);
        assert_eq!(source.read_buf, b"NEXT");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn content_length_relay_uses_buffered_bytes_first() {
        let mut source = BufferedConn::new(&b"world and more"[..]);
        source.read_buf.extend_from_slice(b"hello ");
        let mut sink = Vec::new();
        relay_body(&mut source, &mut sink, HttpBodyMode::ContentLength(11))
            .await
            .expect("relay");
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn truncated_body_is_an_error() {
        let mut source = BufferedConn::new(&b"abc"[..]);
        let error = drain_body(&mut source, HttpBodyMode::ContentLength(10))
            .await
            .expect_err("truncated");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn head_reader_enforces_limit_and_reports_clean_close() {
        let mut empty = BufferedConn::new(&b""[..]);
        assert!(read_until_pattern(&mut empty, b"\r\n\r\n", 64)
            .await
            .expect("clean close")
            .is_none());

        let oversized = vec![b'a'; 256];
        let mut big = BufferedConn::new(oversized.as_slice());
        let error = read_until_pattern(&mut big, b"\r\n\r\n", 64)
            .await
            .expect_err("limit");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn local_no_content_has_no_length() {
        let mut out = Vec::new();
        write_local_response(&mut out, 204, "", false)
            .await
            .expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "HTTP/1.1 204 No Content\r\nContent-Type: text/plain\r\n\r\n");

        let mut out = Vec::new();
        write_local_response(&mut out, 502, "bad", true)
            .await
            .expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n"));
        assert!(text.ends_with("Content-Length: 3\r\n\r\nbad"));
    }
}
