use bytes::Bytes;
use cdp_core::RequestIdGenerator;
use cdp_observe::{
    CdpHeaders, DataReceivedParams, EventBus, InitiatorPayload, LoadingFailedParams,
    LoadingFinishedParams, NetworkRequestPayload, NetworkResponsePayload, RequestWillBeSentParams,
    ResponseReceivedParams, TraceClock, TraceEvent, INITIAL_PRIORITY, INITIATOR_OTHER, LOADER_ID,
    MIME_TYPE_HTML, REFERRER_POLICY, RESOURCE_TYPE_DOCUMENT, RESOURCE_TYPE_OTHER,
};
use serde::Serialize;

/// What the proxy learned about one response once the exchange settled:
/// the status line, the traced body byte count, and a private copy of the
/// headers taken before anything downstream could mutate them.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDigest {
    pub url: String,
    pub status_code: u16,
    pub status_text: String,
    pub protocol: &'static str,
    pub bytes_written: u64,
    pub headers: CdpHeaders,
    pub request_headers: CdpHeaders,
}

/// Observes proxied traffic and publishes the CDP-shaped event stream.
/// One tracer serves every request; per-request state lives with the flow
/// that drives it.
#[derive(Debug)]
pub struct NetworkTracer {
    bus: EventBus,
    ids: RequestIdGenerator,
    clock: TraceClock,
    verbose_prefixes: Vec<String>,
}

impl NetworkTracer {
    pub fn new(bus: EventBus, verbose_prefixes: Vec<String>) -> Self {
        Self {
            bus,
            ids: RequestIdGenerator::new(),
            clock: TraceClock::new(),
            verbose_prefixes,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Observation point 1: a request entered the proxy. Allocates the
    /// request id that joins every later event, chunk, and body lookup.
    pub async fn request_will_be_sent(
        &self,
        method: &str,
        url: &str,
        headers: CdpHeaders,
    ) -> String {
        let request_id = self.ids.next_id();
        if self.is_verbose(url) {
            tracing::info!(%method, %url, %request_id, "request will be sent");
        } else {
            tracing::debug!(%method, %url, %request_id, "request will be sent");
        }

        let params = RequestWillBeSentParams {
            request_id: request_id.clone(),
            loader_id: LOADER_ID,
            document_url: url.to_string(),
            request: NetworkRequestPayload {
                url: url.to_string(),
                method: method.to_string(),
                headers,
                initial_priority: INITIAL_PRIORITY,
                referrer_policy: REFERRER_POLICY,
            },
            timestamp: self.clock.monotonic_seconds(),
            wall_time: TraceClock::wall_seconds(),
            initiator: InitiatorPayload {
                kind: INITIATOR_OTHER,
            },
            resource_type: RESOURCE_TYPE_OTHER,
        };
        self.emit_public("Network.requestWillBeSent", &params).await;
        request_id
    }

    /// Observation point 3: one body write. Snapshots the bytes (callers
    /// reuse their buffers), then emits the internal chunk followed by the
    /// public `dataReceived` so the chunk always precedes its notification.
    pub async fn data_received(&self, request_id: &str, payload: &[u8]) {
        let snapshot = Bytes::copy_from_slice(payload);
        self.bus
            .emit(TraceEvent::data_chunk(request_id, snapshot))
            .await;

        let params = DataReceivedParams {
            request_id: request_id.to_string(),
            timestamp: self.clock.monotonic_seconds(),
            data_length: payload.len() as u64,
        };
        self.emit_public("Network.dataReceived", &params).await;
    }

    /// Observation point 4a: the response settled.
    pub async fn response_received(&self, request_id: &str, digest: &ResponseDigest) {
        let params = ResponseReceivedParams {
            request_id: request_id.to_string(),
            resource_type: RESOURCE_TYPE_DOCUMENT,
            timestamp: self.clock.monotonic_seconds(),
            response: NetworkResponsePayload {
                url: digest.url.clone(),
                status: digest.status_code,
                status_text: digest.status_text.clone(),
                headers: digest.headers.clone(),
                request_headers: digest.request_headers.clone(),
                mime_type: MIME_TYPE_HTML,
                protocol: digest.protocol.to_string(),
                encoded_data_length: digest.bytes_written as f64,
                from_disk_cache: false,
                from_prefetch_cache: false,
            },
        };
        self.emit_public("Network.responseReceived", &params).await;
    }

    /// Observation point 4b: terminal success.
    pub async fn loading_finished(&self, request_id: &str, digest: &ResponseDigest) {
        let params = LoadingFinishedParams {
            request_id: request_id.to_string(),
            timestamp: self.clock.monotonic_seconds(),
            encoded_data_length: digest.bytes_written as f64,
        };
        self.emit_public("Network.loadingFinished", &params).await;
    }

    /// Observation point 5: terminal failure. The caller re-raises its
    /// error after this returns, so outer handling is unaffected.
    pub async fn loading_failed(&self, request_id: &str, error_text: &str) {
        let params = LoadingFailedParams {
            request_id: request_id.to_string(),
            timestamp: self.clock.monotonic_seconds(),
            resource_type: RESOURCE_TYPE_OTHER,
            error_text: error_text.to_string(),
            canceled: false,
        };
        self.emit_public("Network.loadingFailed", &params).await;
    }

    async fn emit_public<P: Serialize>(&self, method: &str, params: &P) {
        match serde_json::to_value(params) {
            Ok(value) => self.bus.emit(TraceEvent::public(method, value)).await,
            Err(error) => {
                tracing::warn!(%method, %error, "dropping unserializable trace event");
            }
        }
    }

    fn is_verbose(&self, url: &str) -> bool {
        if self.verbose_prefixes.is_empty() {
            return false;
        }
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let path = match without_scheme.find('/') {
            Some(index) => &without_scheme[index..],
            None => "/",
        };
        self.verbose_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::{NetworkTracer, ResponseDigest};
    use cdp_observe::{flatten_header_pairs, EventBus, ReadOutcome};
    use tokio::sync::watch;

    async fn next_event(
        subscriber: &mut cdp_observe::Subscriber,
        cancel: &mut watch::Receiver<bool>,
    ) -> cdp_observe::TraceEvent {
        match subscriber.read(cancel).await {
            ReadOutcome::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_request_emits_the_canonical_sequence() {
        let bus = EventBus::new();
        let tracer = NetworkTracer::new(bus.clone(), Vec::new());
        let mut subscriber = bus.subscribe();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        let request_headers = flatten_header_pairs([("Accept", "*/*")]);
        let request_id = tracer
            .request_will_be_sent("GET", "http://example/a", request_headers.clone())
            .await;
        tracer.data_received(&request_id, b"hello").await;
        let digest = ResponseDigest {
            url: "http://example/a".to_string(),
            status_code: 200,
            status_text: "OK".to_string(),
            protocol: "HTTP/1.1",
            bytes_written: 5,
            headers: flatten_header_pairs([("Content-Length", "5")]),
            request_headers,
        };
        tracer.response_received(&request_id, &digest).await;
        tracer.loading_finished(&request_id, &digest).await;

        let first = next_event(&mut subscriber, &mut cancel_rx).await;
        assert_eq!(first.method, "Network.requestWillBeSent");
        assert_eq!(
            first.params().expect("params")["requestId"],
            request_id.as_str()
        );

        let chunk = next_event(&mut subscriber, &mut cancel_rx).await;
        assert!(chunk.is_data_chunk());
        assert_eq!(chunk.request_id.as_deref(), Some(request_id.as_str()));
        assert_eq!(chunk.chunk_bytes().expect("chunk").as_ref(), b"hello");

        let data = next_event(&mut subscriber, &mut cancel_rx).await;
        assert_eq!(data.method, "Network.dataReceived");
        assert_eq!(data.params().expect("params")["dataLength"], 5);

        let response = next_event(&mut subscriber, &mut cancel_rx).await;
        assert_eq!(response.method, "Network.responseReceived");
        assert_eq!(response.params().expect("params")["response"]["status"], 200);

        let finished = next_event(&mut subscriber, &mut cancel_rx).await;
        assert_eq!(finished.method, "Network.loadingFinished");
        assert_eq!(
            finished.params().expect("params")["encodedDataLength"],
            5.0
        );
    }

    #[tokio::test]
    async fn failure_emits_loading_failed_with_the_error_text() {
        let bus = EventBus::new();
        let tracer = NetworkTracer::new(bus.clone(), Vec::new());
        let mut subscriber = bus.subscribe();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);

        let request_id = tracer
            .request_will_be_sent("GET", "http://example/b", Default::default())
            .await;
        tracer
            .loading_failed(&request_id, "upstream reset the connection")
            .await;

        let _request = next_event(&mut subscriber, &mut cancel_rx).await;
        let failed = next_event(&mut subscriber, &mut cancel_rx).await;
        assert_eq!(failed.method, "Network.loadingFailed");
        let params = failed.params().expect("params");
        assert_eq!(params["errorText"], "upstream reset the connection");
        assert_eq!(params["canceled"], false);
        assert_eq!(params["requestId"], request_id.as_str());
    }
}
