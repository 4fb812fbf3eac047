use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cdp_core::ProxyConfig;
use cdp_observe::{BodyStore, EventBus};
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::http_head::{
    has_header_token, header_value, parse_request_head, read_head, BufferedConn, RequestHead,
    MAX_HTTP_HEAD_BYTES,
};
use crate::session::run_session;

const WEBSOCKET_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WEBSOCKET_PATH: &str = "/cdp-proxy";

/// The DevTools-facing server: discovery metadata on `/json`, an
/// instruction page on `/`, and the CDP WebSocket endpoint.
pub struct DevtoolsServer {
    listen_addr: String,
    bus: EventBus,
    body_store: Arc<BodyStore>,
}

impl DevtoolsServer {
    pub fn new(config: &ProxyConfig, bus: EventBus, body_store: Arc<BodyStore>) -> Self {
        Self {
            listen_addr: config.cdp_listen_addr.clone(),
            bus,
            body_store,
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
                    let bus = self.bus.clone();
                    let body_store = Arc::clone(&self.body_store);
                    let listen_addr = self.listen_addr.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(error) =
                            handle_connection(bus, body_store, listen_addr, stream, shutdown).await
                        {
                            tracing::debug!(%client_addr, %error, "devtools connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

async fn handle_connection(
    bus: EventBus,
    body_store: Arc<BodyStore>,
    listen_addr: String,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut conn = BufferedConn::new(stream);
    let raw = match read_head(&mut conn, MAX_HTTP_HEAD_BYTES).await? {
        Some(raw) => raw,
        None => return Ok(()),
    };
    let head = parse_request_head(&raw)?;
    let path = head.target.split('?').next().unwrap_or("/");

    if is_websocket_upgrade(&head) {
        if !matches!(path, "/" | "/cdp" | WEBSOCKET_PATH) {
            return write_http_response(
                &mut conn.stream,
                "404 Not Found",
                "text/plain",
                "unknown websocket endpoint",
            )
            .await;
        }
        let accept = match websocket_accept_value(&head) {
            Some(accept) => accept,
            None => {
                tracing::debug!("rejecting websocket upgrade without a key");
                return write_http_response(
                    &mut conn.stream,
                    "503 Service Unavailable",
                    "text/plain",
                    "websocket handshake failed",
                )
                .await;
            }
        };

        let handshake = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        conn.stream.write_all(handshake.as_bytes()).await?;

        let BufferedConn { stream, read_buf } = conn;
        return run_session(bus, body_store, stream, read_buf, shutdown).await;
    }

    match path {
        "/json" | "/json/list" => {
            let payload = discovery_payload(&listen_addr);
            write_http_response(&mut conn.stream, "200 OK", "application/json", &payload).await
        }
        "/" => {
            let page = instruction_page(&listen_addr);
            write_http_response(&mut conn.stream, "200 OK", "text/html", &page).await
        }
        _ => {
            write_http_response(&mut conn.stream, "404 Not Found", "text/plain", "not found")
                .await
        }
    }
}

fn is_websocket_upgrade(head: &RequestHead) -> bool {
    has_header_token(&head.headers, "connection", "upgrade")
        && header_value(&head.headers, "upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn websocket_accept_value(head: &RequestHead) -> Option<String> {
    let key = header_value(&head.headers, "sec-websocket-key")?;
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_ACCEPT_GUID.as_bytes());
    Some(BASE64.encode(hasher.finalize()))
}

/// The one-target array DevTools discovery expects; both URLs point at this
/// server's WebSocket endpoint.
fn discovery_payload(listen_addr: &str) -> String {
    let ws_location = format!("{listen_addr}{WEBSOCKET_PATH}");
    json!([{
        "id": "cdp-proxy",
        "type": "proxy",
        "title": "cdp-proxy",
        "description": "cdp-proxy requests",
        "faviconUrl": "https://nodejs.org/static/favicon.ico",
        "url": listen_addr,
        "devtoolsFrontendUrl": format!("ws={ws_location}"),
        "webSocketDebuggerUrl": format!("ws://{ws_location}"),
    }])
    .to_string()
}

fn instruction_page(listen_addr: &str) -> String {
    format!(
        "<!doctype html><html><body>open <b>devtools://devtools/bundled/inspector.html?experiments=true&ws={listen_addr}{WEBSOCKET_PATH}</b> in Chrome, or visit chrome://inspect and add <b>{listen_addr}</b></body></html>"
    )
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::{discovery_payload, is_websocket_upgrade, websocket_accept_value};
    use crate::http_head::parse_request_head;

    #[test]
    fn computes_the_rfc6455_sample_accept_value() {
        let head = parse_request_head(
            b"GET / HTTP/1.1\r\nHost: localhost:9229\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .expect("must parse");
        assert!(is_websocket_upgrade(&head));
        assert_eq!(
            websocket_accept_value(&head).expect("accept value"),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let plain = parse_request_head(b"GET / HTTP/1.1\r\nHost: localhost:9229\r\n\r\n")
            .expect("must parse");
        assert!(!is_websocket_upgrade(&plain));

        let keepalive_upgrade = parse_request_head(
            b"GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .expect("must parse");
        assert!(is_websocket_upgrade(&keepalive_upgrade));
    }

    #[test]
    fn discovery_metadata_points_at_this_listener() {
        let payload = discovery_payload("localhost:9229");
        let decoded: serde_json::Value = serde_json::from_str(&payload).expect("valid JSON");
        let target = &decoded[0];
        assert_eq!(target["id"], "cdp-proxy");
        assert_eq!(target["type"], "proxy");
        assert_eq!(
            target["webSocketDebuggerUrl"],
            "ws://localhost:9229/cdp-proxy"
        );
        assert_eq!(target["devtoolsFrontendUrl"], "ws=localhost:9229/cdp-proxy");
    }
}
