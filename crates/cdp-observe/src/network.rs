use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub const LOADER_ID: &str = "1";
pub const INITIAL_PRIORITY: &str = "High";
pub const REFERRER_POLICY: &str = "no-referrer";
pub const INITIATOR_OTHER: &str = "Other";
pub const RESOURCE_TYPE_OTHER: &str = "Other";
pub const RESOURCE_TYPE_DOCUMENT: &str = "Document";
pub const MIME_TYPE_HTML: &str = "text/html";

/// CDP header maps are flat string-to-string objects. Multi-valued headers
/// flatten to their first value.
pub type CdpHeaders = BTreeMap<String, String>;

pub fn flatten_header_pairs<'a, I>(pairs: I) -> CdpHeaders
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut flattened = CdpHeaders::new();
    for (name, value) in pairs {
        flattened
            .entry(name.to_string())
            .or_insert_with(|| value.to_string());
    }
    flattened
}

/// Source of the two CDP timestamp flavors: `timestamp` is monotonic seconds
/// since the clock was created, `wallTime` is seconds since the Unix epoch.
#[derive(Debug, Clone, Copy)]
pub struct TraceClock {
    started_at: Instant,
}

impl TraceClock {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn monotonic_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn wall_seconds() -> f64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs_f64(),
            Err(_) => 0.0,
        }
    }
}

impl Default for TraceClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiatorPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestPayload {
    pub url: String,
    pub method: String,
    pub headers: CdpHeaders,
    pub initial_priority: &'static str,
    pub referrer_policy: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentParams {
    pub request_id: String,
    pub loader_id: &'static str,
    pub document_url: String,
    pub request: NetworkRequestPayload,
    pub timestamp: f64,
    pub wall_time: f64,
    pub initiator: InitiatorPayload,
    #[serde(rename = "type")]
    pub resource_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponsePayload {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: CdpHeaders,
    pub request_headers: CdpHeaders,
    pub mime_type: &'static str,
    pub protocol: String,
    pub encoded_data_length: f64,
    pub from_disk_cache: bool,
    pub from_prefetch_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedParams {
    pub request_id: String,
    #[serde(rename = "type")]
    pub resource_type: &'static str,
    pub timestamp: f64,
    pub response: NetworkResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceivedParams {
    pub request_id: String,
    pub timestamp: f64,
    pub data_length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinishedParams {
    pub request_id: String,
    pub timestamp: f64,
    pub encoded_data_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailedParams {
    pub request_id: String,
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub resource_type: &'static str,
    pub error_text: String,
    pub canceled: bool,
}
