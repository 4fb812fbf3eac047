use bytes::Bytes;
use serde_json::Value;

mod body_store;
mod bus;
mod network;

pub use body_store::{BodyEntry, BodyStore};
pub use bus::{EventBus, ReadOutcome, Subscriber, SUBSCRIBER_QUEUE_CAPACITY};
pub use network::{
    flatten_header_pairs, CdpHeaders, DataReceivedParams, InitiatorPayload, LoadingFailedParams,
    LoadingFinishedParams, NetworkRequestPayload, NetworkResponsePayload, RequestWillBeSentParams,
    ResponseReceivedParams, TraceClock, INITIAL_PRIORITY, INITIATOR_OTHER, LOADER_ID,
    MIME_TYPE_HTML, REFERRER_POLICY, RESOURCE_TYPE_DOCUMENT, RESOURCE_TYPE_OTHER,
};

/// Side-channel method name for body bytes riding the bus. Events carrying
/// it are consumed by the CDP session to fill the body store and are never
/// forwarded to DevTools.
pub const DATA_CHUNK_METHOD: &str = "_Data.chunk";

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Params(Value),
    Chunk(Bytes),
}

/// One event on the bus: either a public `Network.*` notification bound for
/// DevTools or an internal body chunk keyed by request id.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub method: String,
    pub payload: EventPayload,
    pub request_id: Option<String>,
}

impl TraceEvent {
    pub fn public(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            payload: EventPayload::Params(params),
            request_id: None,
        }
    }

    pub fn data_chunk(request_id: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            method: DATA_CHUNK_METHOD.to_string(),
            payload: EventPayload::Chunk(bytes),
            request_id: Some(request_id.into()),
        }
    }

    pub fn is_data_chunk(&self) -> bool {
        self.method == DATA_CHUNK_METHOD
    }

    pub fn chunk_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            EventPayload::Chunk(bytes) => Some(bytes),
            EventPayload::Params(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Params(params) => Some(params),
            EventPayload::Chunk(_) => None,
        }
    }

    /// Wire form sent to DevTools. Internal chunk events have no wire form.
    pub fn to_wire_frame(&self) -> Option<String> {
        match &self.payload {
            EventPayload::Params(params) => Some(
                serde_json::json!({
                    "method": self.method,
                    "params": params,
                })
                .to_string(),
            ),
            EventPayload::Chunk(_) => None,
        }
    }
}
