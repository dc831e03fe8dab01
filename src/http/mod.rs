//! HTTP/1.1 message model
//!
//! Parsing and serialization of requests and responses as they travel
//! through the proxy, plus the `HttpMessage` exchange record shared by the
//! proxy, history and scanners.

mod body;
mod header;
mod message;
mod parser;

pub use body::{Body, TransferEncoding};
pub use header::{
    format_authority, split_authority, HeaderField, HeaderMap, RequestHeader, ResponseHeader, Scheme, Target,
    TargetContext,
};
pub use message::{synthetic_response, HttpMessage, Initiator};
pub use parser::{MessageReader, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};
