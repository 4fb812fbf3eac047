use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;
pub const MAX_HTTP_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    fn parse(text: &str) -> io::Result<Self> {
        match text {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "only HTTP/1.0 and HTTP/1.1 are supported",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HeaderField>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<HeaderField>,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

/// A stream plus whatever was read past the last consumed boundary.
#[derive(Debug)]
pub struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

/// Reads one HTTP head (through the blank line) from the connection.
/// Returns `None` on a clean EOF before any bytes arrived; bytes read past
/// the head stay in `read_buf`.
pub async fn read_head<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    read_until_pattern(conn, b"\r\n\r\n", max_bytes).await
}

pub async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head exceeded the configured limit",
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
                "connection closed before the message boundary was reached",
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

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request head was not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = HttpVersion::parse(version_text)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response head was not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "status line is missing"))?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let reason_phrase = parts.collect::<Vec<_>>().join(" ");
    let version = HttpVersion::parse(version_text)?;
    let status_code = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;

    let headers = parse_header_lines(lines)?;
    let mut connection_close = is_connection_close(version, &headers);
    let body_mode = response_body_mode(&headers, request_method, status_code)?;
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        raw: raw.to_vec(),
        version,
        status_code,
        reason_phrase,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Vec<HeaderField>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.push(HeaderField {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}

/// First value of the named header, if present.
pub fn header_value<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|field| field.name.eq_ignore_ascii_case(name))
        .map(|field| field.value.as_str())
}

pub fn has_header_token(headers: &[HeaderField], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|field| field.name.eq_ignore_ascii_case(name))
        .flat_map(|field| field.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn request_body_mode(headers: &[HeaderField]) -> io::Result<BodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }
    Ok(BodyMode::None)
}

fn response_body_mode(
    headers: &[HeaderField],
    request_method: &str,
    status_code: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304
    {
        return Ok(BodyMode::None);
    }

    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }

    Ok(BodyMode::CloseDelimited)
}

fn parse_content_length(headers: &[HeaderField]) -> io::Result<Option<u64>> {
    let mut value = None;
    for field in headers {
        if field.name.eq_ignore_ascii_case("content-length") {
            let parsed = field.value.parse::<u64>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
            })?;
            value = Some(parsed);
        }
    }
    Ok(value)
}

fn is_connection_close(version: HttpVersion, headers: &[HeaderField]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !has_header_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::{
        header_value, parse_request_head, parse_response_head, read_head, BodyMode, BufferedConn,
        HttpVersion, MAX_HTTP_HEAD_BYTES,
    };

    #[test]
    fn parses_an_absolute_form_proxy_request() {
        let raw = b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.body_mode, BodyMode::None);
        assert!(!head.connection_close);
        assert_eq!(header_value(&head.headers, "host"), Some("example.com"));
    }

    #[test]
    fn preserves_every_value_of_repeated_headers() {
        let raw = b"GET / HTTP/1.1\r\nHost: h\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        let tags: Vec<_> = head
            .headers
            .iter()
            .filter(|f| f.name == "X-Tag")
            .map(|f| f.value.as_str())
            .collect();
        assert_eq!(tags, vec!["one", "two"]);
        assert_eq!(header_value(&head.headers, "x-tag"), Some("one"));
    }

    #[test]
    fn classifies_request_body_modes() {
        let chunked =
            parse_request_head(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
                .expect("must parse");
        assert_eq!(chunked.body_mode, BodyMode::Chunked);

        let sized = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n")
            .expect("must parse");
        assert_eq!(sized.body_mode, BodyMode::ContentLength(12));
    }

    #[test]
    fn response_to_head_request_has_no_body() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
            "HEAD",
        )
        .expect("must parse");
        assert_eq!(head.body_mode, BodyMode::None);
        assert_eq!(head.status_code, 200);
        assert_eq!(head.reason_phrase, "OK");
    }

    #[test]
    fn response_without_length_is_close_delimited() {
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", "GET").expect("must parse");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn http10_defaults_to_connection_close() {
        let head = parse_request_head(b"GET / HTTP/1.0\r\nHost: h\r\n\r\n").expect("must parse");
        assert!(head.connection_close);
    }

    #[tokio::test]
    async fn read_head_leaves_excess_bytes_buffered() {
        let input = b"GET / HTTP/1.1\r\nHost: h\r\n\r\nEXTRA".to_vec();
        let mut conn = BufferedConn::new(std::io::Cursor::new(input));
        let raw = read_head(&mut conn, MAX_HTTP_HEAD_BYTES)
            .await
            .expect("read")
            .expect("head present");
        assert!(raw.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.read_buf, b"EXTRA");
    }

    #[tokio::test]
    async fn read_head_reports_clean_eof_as_absent() {
        let mut conn = BufferedConn::new(std::io::Cursor::new(Vec::new()));
        let head = read_head(&mut conn, MAX_HTTP_HEAD_BYTES).await.expect("read");
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn read_head_rejects_oversized_heads() {
        let input = vec![b'a'; 256];
        let mut conn = BufferedConn::new(std::io::Cursor::new(input));
        let error = read_head(&mut conn, 128).await.expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }
}
