//! One HTTP exchange: request, response and bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::body::{Body, TransferEncoding};
use super::header::{RequestHeader, ResponseHeader};

/// What caused a message to be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Proxy,
    ActiveScan,
    PassiveVerify,
    Spider,
    Manual,
    Fuzz,
    Auth,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::Proxy => "proxy",
            Initiator::ActiveScan => "active_scan",
            Initiator::PassiveVerify => "passive_verify",
            Initiator::Spider => "spider",
            Initiator::Manual => "manual",
            Initiator::Fuzz => "fuzz",
            Initiator::Auth => "auth",
        }
    }
}

/// A single HTTP exchange.
///
/// The message is owned by whoever is sending it until it is recorded in
/// history; from then on it is shared behind an `Arc` and never changes.
/// Retransmissions start from [`HttpMessage::fresh_copy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMessage {
    /// History id, set once the exchange is recorded
    pub history_id: Option<u64>,
    pub request_header: RequestHeader,
    pub request_body: Body,
    pub response_header: Option<ResponseHeader>,
    pub response_body: Body,
    pub time_sent: Option<DateTime<Utc>>,
    pub time_received: Option<DateTime<Utc>>,
    pub initiator: Initiator,
}

impl HttpMessage {
    pub fn new(request_header: RequestHeader, request_body: Body, initiator: Initiator) -> Self {
        Self {
            history_id: None,
            request_header,
            request_body,
            response_header: None,
            response_body: Body::empty(),
            time_sent: None,
            time_received: None,
            initiator,
        }
    }

    /// New message carrying a copy of this request only
    pub fn fresh_copy(&self, initiator: Initiator) -> Self {
        Self::new(self.request_header.clone(), self.request_body.clone(), initiator)
    }

    pub fn url(&self) -> &str {
        self.request_header.uri.as_str()
    }

    pub fn method(&self) -> &str {
        &self.request_header.method
    }

    pub fn status(&self) -> Option<u16> {
        self.response_header.as_ref().map(|h| h.status)
    }

    pub fn response_header_value(&self, name: &str) -> Option<&str> {
        self.response_header.as_ref().and_then(|h| h.headers.get(name))
    }

    pub fn is_sent(&self) -> bool {
        self.time_sent.is_some()
    }

    /// Round-trip time in milliseconds, once both timestamps exist
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.time_sent, self.time_received) {
            (Some(sent), Some(received)) => Some((received - sent).num_milliseconds()),
            _ => None,
        }
    }

    /// Replace the request body and keep `Content-Length` consistent
    pub fn set_request_body(&mut self, content: impl Into<Vec<u8>>) {
        self.request_body.set_content(content);
        sync_length(&mut self.request_header.headers, &self.request_body);
    }

    /// Replace the response body and keep `Content-Length` consistent
    pub fn set_response_body(&mut self, content: impl Into<Vec<u8>>) {
        self.response_body.set_content(content);
        if let Some(header) = self.response_header.as_mut() {
            sync_length(&mut header.headers, &self.response_body);
        }
    }

    pub fn set_response(&mut self, header: ResponseHeader, body: Body) {
        self.response_header = Some(header);
        self.response_body = body;
    }

    /// Request bytes exactly as they would be written to the wire
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut out = self.request_header.to_bytes();
        self.request_body.write_to(&mut out);
        out
    }

    /// Response bytes exactly as they would be written to the wire
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut out = match &self.response_header {
            Some(header) => header.to_bytes(),
            None => return Vec::new(),
        };
        self.response_body.write_to(&mut out);
        out
    }
}

fn sync_length(headers: &mut super::header::HeaderMap, body: &Body) {
    if body.transfer_encoding() == TransferEncoding::Chunked || body.is_until_close() {
        return;
    }
    if headers.contains("content-length") || !body.is_empty() {
        headers.set("Content-Length", &body.len().to_string());
    }
}

/// Build a plain-text response generated by the proxy itself
pub fn synthetic_response(status: u16, reason: &str, text: &str) -> (ResponseHeader, Body) {
    let mut header = ResponseHeader::new(status, reason);
    header.headers.append("Content-Type", "text/plain; charset=utf-8");
    header.headers.append("Content-Length", &text.len().to_string());
    (header, Body::from_bytes(text.as_bytes().to_vec()))
}
