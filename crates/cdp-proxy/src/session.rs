use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cdp_observe::{BodyEntry, BodyStore, EventBus, ReadOutcome, Subscriber};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{watch, Mutex};

use crate::ws::{write_close_frame, write_pong_frame, write_text_frame, WsFrameReader, WsMessage};

#[derive(Debug, Deserialize)]
struct CdpRequest {
    #[serde(default)]
    id: i64,
    method: String,
    #[serde(default)]
    params: Value,
}

enum SessionEnd {
    Shutdown,
    EventTask,
    RequestTask,
}

/// Drives one DevTools WebSocket session: an event task drains the bus
/// toward the socket while a request task answers DevTools' queries. The
/// first side to finish cancels the other; the subscriber dies with the
/// session.
pub async fn run_session<S>(
    bus: EventBus,
    body_store: Arc<BodyStore>,
    stream: S,
    leftover: Vec<u8>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let subscriber = bus.subscribe();
    tracing::debug!(subscriber_id = subscriber.id(), "devtools session started");

    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(write_half));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut event_task = tokio::spawn(drain_events(
        subscriber,
        Arc::clone(&body_store),
        Arc::clone(&writer),
        cancel_rx.clone(),
    ));
    let mut request_task = tokio::spawn(handle_requests(
        WsFrameReader::new(leftover, read_half),
        Arc::clone(&body_store),
        Arc::clone(&writer),
        cancel_rx,
    ));

    let ended_by = tokio::select! {
        _ = shutdown.changed() => SessionEnd::Shutdown,
        _ = &mut event_task => SessionEnd::EventTask,
        _ = &mut request_task => SessionEnd::RequestTask,
    };
    let _ = cancel_tx.send(true);
    match ended_by {
        SessionEnd::Shutdown => {
            let _ = event_task.await;
            let _ = request_task.await;
        }
        SessionEnd::EventTask => {
            let _ = request_task.await;
        }
        SessionEnd::RequestTask => {
            let _ = event_task.await;
        }
    }

    let mut sink = writer.lock().await;
    let _ = write_close_frame(&mut *sink).await;
    tracing::debug!("devtools session ended");
    Ok(())
}

/// Bus-to-socket side. Internal chunk events fill the body store and never
/// reach the wire; public events become text frames.
async fn drain_events<S>(
    mut subscriber: Subscriber,
    body_store: Arc<BodyStore>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    mut cancel: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match subscriber.read(&mut cancel).await {
            ReadOutcome::Event(event) => {
                if event.is_data_chunk() {
                    if let (Some(request_id), Some(bytes)) =
                        (event.request_id.as_deref(), event.chunk_bytes())
                    {
                        let (entry, _) =
                            body_store.load_or_store(request_id, BodyEntry::default());
                        entry
                            .lock()
                            .expect("body buffer lock poisoned")
                            .extend_from_slice(bytes);
                    }
                    continue;
                }

                if let Some(frame) = event.to_wire_frame() {
                    let mut sink = writer.lock().await;
                    write_text_frame(&mut *sink, &frame).await?;
                }
            }
            ReadOutcome::Cancelled | ReadOutcome::Closed => {
                subscriber.close();
                return Ok(());
            }
        }
    }
}

/// Socket-to-reply side. DevTools probes many optional methods; unknown
/// ones get an empty result rather than an error.
async fn handle_requests<R, S>(
    mut reader: WsFrameReader<R>,
    body_store: Arc<BodyStore>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    mut cancel: watch::Receiver<bool>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            _ = cancel.changed() => return Ok(()),
            message = reader.read_message() => message?,
        };

        match message {
            Some(WsMessage::Text(text)) => {
                let request: CdpRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(error) => {
                        tracing::debug!(%error, "malformed devtools request; closing session");
                        return Ok(());
                    }
                };
                if let Some(result) = dispatch_request(&request, &body_store) {
                    let reply = json!({ "id": request.id, "result": result }).to_string();
                    let mut sink = writer.lock().await;
                    write_text_frame(&mut *sink, &reply).await?;
                }
            }
            Some(WsMessage::Ping(payload)) => {
                let mut sink = writer.lock().await;
                write_pong_frame(&mut *sink, &payload).await?;
            }
            Some(WsMessage::Pong(_)) | Some(WsMessage::Binary(_)) => {}
            Some(WsMessage::Close) | None => return Ok(()),
        }
    }
}

fn dispatch_request(request: &CdpRequest, body_store: &BodyStore) -> Option<Value> {
    match request.method.as_str() {
        "Page.canScreencast"
        | "Network.canEmulateNetworkConditions"
        | "Emulation.canEmulate" => Some(json!({ "result": false })),
        "Page.getResourceTree" => Some(json!({
            "frameTree": {
                "frame": { "id": 1, "url": "http://cdp-proxy", "mimeType": "other" },
                "childFrames": [],
                "resources": [],
            }
        })),
        "Network.getResponseBody" => {
            let request_id = request.params.get("requestId")?.as_str()?;
            let body = body_store.snapshot(request_id).unwrap_or_default();
            Some(json!({
                "body": BASE64.encode(&body),
                "base64Encoded": true,
            }))
        }
        _ => Some(json!({})),
    }
}
