use std::io;
use std::sync::Arc;
use std::time::Duration;

use cdp_core::{
    parse_connect_authority, resolve_forward_target, ForwardTarget, ProxyConfig, TargetScheme,
};
use cdp_observe::{flatten_header_pairs, CdpHeaders};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::http_head::{
    header_value, parse_request_head, parse_response_head, read_head, read_until_pattern,
    BodyMode, BufferedConn, HeaderField, RequestHead, ResponseHead, IO_CHUNK_SIZE,
    MAX_HTTP_HEAD_BYTES,
};
use crate::tls::upstream_client_config;
use crate::tracer::{NetworkTracer, ResponseDigest};

const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK_SIZE_LINE_LIMIT: usize = 8 * 1024;

pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for S {}

/// The HTTP forward proxy plane: plain forwarding plus CONNECT tunnels,
/// with every exchange observed by the tracer.
pub struct ProxyServer {
    listen_addr: String,
    tracer: Arc<NetworkTracer>,
}

impl ProxyServer {
    pub fn new(config: &ProxyConfig, tracer: Arc<NetworkTracer>) -> Self {
        Self {
            listen_addr: config.proxy_listen_addr.clone(),
            tracer,
        }
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.listen_addr).await
    }

    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, client_addr) = accepted?;
                    let tracer = Arc::clone(&self.tracer);
                    tokio::spawn(async move {
                        if let Err(error) = handle_client(tracer, stream).await {
                            tracing::warn!(%client_addr, %error, "proxy connection handling failed");
                        }
                    });
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

async fn handle_client(tracer: Arc<NetworkTracer>, stream: TcpStream) -> io::Result<()> {
    let mut conn = BufferedConn::new(stream);
    loop {
        let raw = match read_head(&mut conn, MAX_HTTP_HEAD_BYTES).await? {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(error) => {
                write_proxy_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid HTTP proxy request",
                )
                .await?;
                tracing::debug!(%error, "rejecting unparsable proxy request");
                return Ok(());
            }
        };

        if head.method == "CONNECT" {
            return handle_connect(&tracer, conn, head).await;
        }

        let close = handle_forward(&tracer, &mut conn, &head).await?;
        if close || head.connection_close {
            return Ok(());
        }
    }
}

/// One plain forward exchange. Returns whether the client connection must
/// close afterwards.
async fn handle_forward<S>(
    tracer: &NetworkTracer,
    conn: &mut BufferedConn<S>,
    head: &RequestHead,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_headers = flatten_headers(&head.headers);

    let target = match resolve_forward_target(&head.target, header_value(&head.headers, "host")) {
        Ok(target) => target,
        Err(error) => {
            let request_id = tracer
                .request_will_be_sent(&head.method, &head.target, request_headers.clone())
                .await;
            tracing::debug!(target = %head.target, code = error.code(), "unresolvable proxy target");
            return write_traced_error_response(
                tracer,
                conn,
                &request_id,
                &head.target,
                request_headers,
                400,
                "Bad Request",
            )
            .await;
        }
    };

    let url = target.url();
    let request_id = tracer
        .request_will_be_sent(&head.method, &url, request_headers.clone())
        .await;

    let upstream = match connect_upstream(&target).await {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::debug!(%url, %error, "upstream dial failed");
            return write_traced_error_response(
                tracer,
                conn,
                &request_id,
                &url,
                request_headers,
                503,
                "Service Unavailable",
            )
            .await;
        }
    };

    let exchange = forward_exchange(
        tracer,
        conn,
        BufferedConn::new(upstream),
        head,
        &target,
        &request_id,
        &url,
        &request_headers,
    )
    .await;
    match exchange {
        Ok(close) => Ok(close),
        Err(error) => {
            tracer.loading_failed(&request_id, &error.to_string()).await;
            Err(error)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_exchange<S>(
    tracer: &NetworkTracer,
    conn: &mut BufferedConn<S>,
    mut upstream: BufferedConn<Box<dyn ProxyStream>>,
    head: &RequestHead,
    target: &ForwardTarget,
    request_id: &str,
    url: &str,
    request_headers: &CdpHeaders,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let forward_head = encode_forward_request_head(head, target);
    upstream.stream.write_all(&forward_head).await?;

    // Request bodies flow upstream untraced; only response bytes feed the
    // capture pipeline.
    relay_body(conn, &mut upstream.stream, head.body_mode, None).await?;

    let response_raw = match read_head(&mut upstream, MAX_HTTP_HEAD_BYTES).await {
        Ok(Some(raw)) => raw,
        Ok(None) | Err(_) => {
            tracing::debug!(%url, "upstream closed before response head");
            return write_traced_error_response(
                tracer,
                conn,
                request_id,
                url,
                request_headers.clone(),
                503,
                "Service Unavailable",
            )
            .await;
        }
    };
    let response = match parse_response_head(&response_raw, &head.method) {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(%url, %error, "unparsable upstream response head");
            return write_traced_error_response(
                tracer,
                conn,
                request_id,
                url,
                request_headers.clone(),
                503,
                "Service Unavailable",
            )
            .await;
        }
    };

    conn.stream.write_all(&response.raw).await?;
    let bytes_written = relay_body(
        &mut upstream,
        &mut conn.stream,
        response.body_mode,
        Some((tracer, request_id)),
    )
    .await?;

    let digest = digest_from_response(&response, bytes_written, url, request_headers.clone());
    tracer.response_received(request_id, &digest).await;
    tracer.loading_finished(request_id, &digest).await;

    Ok(response.connection_close)
}

async fn handle_connect<S>(
    tracer: &NetworkTracer,
    mut conn: BufferedConn<S>,
    head: RequestHead,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_headers = flatten_headers(&head.headers);
    let request_id = tracer
        .request_will_be_sent(&head.method, &head.target, request_headers.clone())
        .await;

    let (host, port) = match parse_connect_authority(&head.target) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::debug!(target = %head.target, code = error.code(), "invalid CONNECT authority");
            write_traced_error_response(
                tracer,
                &mut conn,
                &request_id,
                &head.target,
                request_headers,
                400,
                "Bad Request",
            )
            .await?;
            return Ok(());
        }
    };

    let dial = tokio::time::timeout(
        CONNECT_DIAL_TIMEOUT,
        TcpStream::connect((host.as_str(), port)),
    )
    .await;
    let upstream = match dial {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(error)) => {
            tracing::debug!(target = %head.target, %error, "CONNECT dial failed");
            write_traced_error_response(
                tracer,
                &mut conn,
                &request_id,
                &head.target,
                request_headers,
                503,
                "Service Unavailable",
            )
            .await?;
            return Ok(());
        }
        Err(_) => {
            tracing::debug!(target = %head.target, "CONNECT dial timed out");
            write_traced_error_response(
                tracer,
                &mut conn,
                &request_id,
                &head.target,
                request_headers,
                503,
                "Service Unavailable",
            )
            .await?;
            return Ok(());
        }
    };

    let tunnel = tunnel_connection(tracer, &request_id, conn, upstream).await;
    match tunnel {
        Ok(()) => {
            let digest = ResponseDigest {
                url: head.target.clone(),
                status_code: 200,
                status_text: "OK".to_string(),
                protocol: head.version.as_str(),
                bytes_written: 0,
                headers: CdpHeaders::new(),
                request_headers,
            };
            tracer.response_received(&request_id, &digest).await;
            tracer.loading_finished(&request_id, &digest).await;
            Ok(())
        }
        Err(error) => {
            tracer.loading_failed(&request_id, &error.to_string()).await;
            Err(error)
        }
    }
}

/// Splices the CONNECT tunnel. Bytes moving server-to-client traverse the
/// traced write path and produce chunk events; the client-to-server
/// direction is a plain relay. EOF on either side half-closes its peer.
async fn tunnel_connection<S>(
    tracer: &NetworkTracer,
    request_id: &str,
    conn: BufferedConn<S>,
    mut upstream: TcpStream,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let BufferedConn {
        stream: mut client,
        read_buf: buffered_client_data,
    } = conn;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !buffered_client_data.is_empty() {
        upstream.write_all(&buffered_client_data).await?;
    }

    let mut client_to_upstream = [0_u8; IO_CHUNK_SIZE];
    let mut upstream_to_client = [0_u8; IO_CHUNK_SIZE];
    let mut client_closed = false;
    let mut upstream_closed = false;

    loop {
        if client_closed && upstream_closed {
            return Ok(());
        }

        tokio::select! {
            result = client.read(&mut client_to_upstream), if !client_closed => {
                let read = result?;
                if read == 0 {
                    client_closed = true;
                    let _ = upstream.shutdown().await;
                } else {
                    upstream.write_all(&client_to_upstream[..read]).await?;
                }
            }
            result = upstream.read(&mut upstream_to_client), if !upstream_closed => {
                let read = result?;
                if read == 0 {
                    upstream_closed = true;
                    let _ = client.shutdown().await;
                } else {
                    client.write_all(&upstream_to_client[..read]).await?;
                    tracer.data_received(request_id, &upstream_to_client[..read]).await;
                }
            }
        }
    }
}

async fn connect_upstream(target: &ForwardTarget) -> io::Result<Box<dyn ProxyStream>> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
    match target.scheme {
        TargetScheme::Http => Ok(Box::new(tcp)),
        TargetScheme::Https => {
            let server_name = ServerName::try_from(target.host.clone()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid server name for upstream TLS",
                )
            })?;
            let connector = TlsConnector::from(upstream_client_config());
            let tls = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls))
        }
    }
}

/// Rewrites an absolute-form proxy request into the origin-form request the
/// upstream expects, pinning `Host` to the resolved authority. All other
/// headers pass through untouched.
fn encode_forward_request_head(head: &RequestHead, target: &ForwardTarget) -> Vec<u8> {
    let mut out = format!(
        "{} {} {}\r\n",
        head.method,
        target.origin_form_target,
        head.version.as_str()
    )
    .into_bytes();

    let mut wrote_host = false;
    for field in &head.headers {
        if field.name.eq_ignore_ascii_case("host") {
            if !wrote_host {
                out.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());
                wrote_host = true;
            }
        } else {
            out.extend_from_slice(format!("{}: {}\r\n", field.name, field.value).as_bytes());
        }
    }
    if !wrote_host {
        out.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Relays one message body between peers according to its framing. When a
/// trace context is supplied, every payload segment written to the sink is
/// also published as a body chunk.
async fn relay_body<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mode: BodyMode,
    trace: Option<(&NetworkTracer, &str)>,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    match mode {
        BodyMode::None => Ok(0),
        BodyMode::ContentLength(length) => relay_exact(source, sink, length, trace).await,
        BodyMode::Chunked => relay_chunked(source, sink, trace).await,
        BodyMode::CloseDelimited => relay_until_eof(source, sink, trace).await,
    }
}

async fn relay_exact<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    mut length: u64,
    trace: Option<(&NetworkTracer, &str)>,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    if !source.read_buf.is_empty() && length > 0 {
        let take = std::cmp::min(length as usize, source.read_buf.len());
        sink.write_all(&source.read_buf[..take]).await?;
        if let Some((tracer, request_id)) = trace {
            tracer.data_received(request_id, &source.read_buf[..take]).await;
        }
        source.read_buf.drain(..take);
        length -= take as u64;
        total += take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while length > 0 {
        let read = source
            .stream
            .read(&mut chunk[..std::cmp::min(IO_CHUNK_SIZE, length as usize)])
            .await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the body completed",
            ));
        }
        sink.write_all(&chunk[..read]).await?;
        if let Some((tracer, request_id)) = trace {
            tracer.data_received(request_id, &chunk[..read]).await;
        }
        length -= read as u64;
        total += read as u64;
    }

    Ok(total)
}

/// Forwards chunked framing verbatim while tracing only the de-chunked
/// payload bytes, so captured bodies concatenate to what the origin wrote.
async fn relay_chunked<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    trace: Option<(&NetworkTracer, &str)>,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let line = read_until_pattern(source, b"\r\n", CHUNK_SIZE_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the chunk size line",
                )
            })?;
        sink.write_all(&line).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            // Trailer section: zero or more header lines, then a bare CRLF.
            loop {
                let trailer_line = read_until_pattern(source, b"\r\n", MAX_HTTP_HEAD_BYTES)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before the chunked trailers completed",
                        )
                    })?;
                sink.write_all(&trailer_line).await?;
                if trailer_line == b"\r\n" {
                    return Ok(total);
                }
            }
        }

        total += relay_exact(source, sink, chunk_len, trace).await?;

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

async fn relay_until_eof<RS, WS>(
    source: &mut BufferedConn<RS>,
    sink: &mut WS,
    trace: Option<(&NetworkTracer, &str)>,
) -> io::Result<u64>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    if !source.read_buf.is_empty() {
        sink.write_all(&source.read_buf).await?;
        if let Some((tracer, request_id)) = trace {
            tracer.data_received(request_id, &source.read_buf).await;
        }
        total += source.read_buf.len() as u64;
        source.read_buf.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(total);
        }
        sink.write_all(&chunk[..read]).await?;
        if let Some((tracer, request_id)) = trace {
            tracer.data_received(request_id, &chunk[..read]).await;
        }
        total += read as u64;
    }
}

async fn read_exact_from_source<RS: AsyncRead + Unpin>(
    source: &mut BufferedConn<RS>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while source.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the expected bytes arrived",
            ));
        }
        source.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(source.read_buf.drain(..exact_len).collect::<Vec<_>>())
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size line is not UTF-8"))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

/// Writes a locally synthesized error response through the traced path and
/// completes the exchange with a matching digest. Always closes.
async fn write_traced_error_response<S>(
    tracer: &NetworkTracer,
    conn: &mut BufferedConn<S>,
    request_id: &str,
    url: &str,
    request_headers: CdpHeaders,
    status_code: u16,
    reason: &'static str,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = format!("{reason}\n");
    let raw = format!(
        "HTTP/1.1 {status_code} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.stream.write_all(raw.as_bytes()).await?;
    tracer.data_received(request_id, body.as_bytes()).await;

    let digest = ResponseDigest {
        url: url.to_string(),
        status_code,
        status_text: reason.to_string(),
        protocol: "HTTP/1.1",
        bytes_written: body.len() as u64,
        headers: flatten_header_pairs([
            ("Content-Type", "text/plain; charset=utf-8"),
            ("Connection", "close"),
        ]),
        request_headers,
    };
    tracer.response_received(request_id, &digest).await;
    tracer.loading_finished(request_id, &digest).await;
    Ok(true)
}

async fn write_proxy_response<S>(stream: &mut S, status: &str, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

fn flatten_headers(headers: &[HeaderField]) -> CdpHeaders {
    flatten_header_pairs(
        headers
            .iter()
            .map(|field| (field.name.as_str(), field.value.as_str())),
    )
}

fn digest_from_response(
    response: &ResponseHead,
    bytes_written: u64,
    url: &str,
    request_headers: CdpHeaders,
) -> ResponseDigest {
    let status_code = if response.status_code == 0 {
        200
    } else {
        response.status_code
    };
    ResponseDigest {
        url: url.to_string(),
        status_code,
        status_text: response.reason_phrase.clone(),
        protocol: response.version.as_str(),
        bytes_written,
        headers: flatten_headers(&response.headers),
        request_headers,
    }
}

#[cfg(test)]
mod tests {
    use super::{encode_forward_request_head, parse_chunk_len};
    use crate::http_head::parse_request_head;
    use cdp_core::resolve_forward_target;

    #[test]
    fn rewrites_absolute_form_to_origin_form() {
        let head = parse_request_head(
            b"GET http://example.com:8080/a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n",
        )
        .expect("must parse");
        let target = resolve_forward_target(&head.target, None).expect("must resolve");
        let encoded = encode_forward_request_head(&head, &target);
        let text = String::from_utf8(encoded).expect("ascii head");
        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\n"), "head: {text}");
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn adds_a_host_header_when_the_client_sent_none() {
        let head = parse_request_head(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .expect("must parse");
        let target = resolve_forward_target(&head.target, None).expect("must resolve");
        let text = String::from_utf8(encode_forward_request_head(&head, &target))
            .expect("ascii head");
        assert!(text.contains("Host: example.com\r\n"));
    }

    #[test]
    fn chunk_size_lines_parse_as_hex_with_extensions() {
        assert_eq!(parse_chunk_len(b"5\r\n").expect("parse"), 5);
        assert_eq!(parse_chunk_len(b"1a;ext=1\r\n").expect("parse"), 26);
        parse_chunk_len(b"zz\r\n").expect_err("must fail");
    }
}
