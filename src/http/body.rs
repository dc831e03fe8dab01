//! Message bodies and their transfer framing

use serde::{Deserialize, Serialize};

/// Transfer coding of a body on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    #[default]
    Identity,
    Chunked,
}

/// HTTP message body.
///
/// `content` is always the decoded payload. For chunked bodies `wire`
/// keeps the exact bytes that were received (sizes, extensions and
/// trailers included) until the content is replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(with = "base64_bytes")]
    content: Vec<u8>,
    declared_length: Option<usize>,
    transfer_encoding: TransferEncoding,
    #[serde(skip)]
    wire: Option<Vec<u8>>,
    /// Body was delimited by the connection closing
    until_close: bool,
}

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Identity body with a declared length equal to its size
    pub fn from_bytes(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            declared_length: Some(content.len()),
            content,
            ..Self::default()
        }
    }

    pub(crate) fn with_length(content: Vec<u8>, declared: Option<usize>) -> Self {
        Self {
            content,
            declared_length: declared,
            ..Self::default()
        }
    }

    pub(crate) fn chunked(content: Vec<u8>, wire: Vec<u8>) -> Self {
        Self {
            content,
            declared_length: None,
            transfer_encoding: TransferEncoding::Chunked,
            wire: Some(wire),
            until_close: false,
        }
    }

    pub(crate) fn until_close(content: Vec<u8>) -> Self {
        Self {
            content,
            until_close: true,
            ..Self::default()
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).to_string()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn declared_length(&self) -> Option<usize> {
        self.declared_length
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.transfer_encoding
    }

    pub fn is_until_close(&self) -> bool {
        self.until_close
    }

    /// Replace the payload, keeping the transfer coding. Callers must
    /// keep `Content-Length` in step; `HttpMessage` does this for them.
    pub fn set_content(&mut self, content: impl Into<Vec<u8>>) {
        self.content = content.into();
        self.wire = None;
        if self.transfer_encoding == TransferEncoding::Identity && !self.until_close {
            self.declared_length = Some(self.content.len());
        }
    }

    /// Bytes as written on the wire
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match (self.transfer_encoding, &self.wire) {
            (TransferEncoding::Chunked, Some(wire)) => out.extend_from_slice(wire),
            (TransferEncoding::Chunked, None) => {
                if !self.content.is_empty() {
                    out.extend_from_slice(format!("{:x}\r\n", self.content.len()).as_bytes());
                    out.extend_from_slice(&self.content);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"0\r\n\r\n");
            }
            (TransferEncoding::Identity, _) => out.extend_from_slice(&self.content),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content.len());
        self.write_to(&mut out);
        out
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rechunk_after_modification() {
        let mut body = Body::chunked(b"hello".to_vec(), b"5;ext=1\r\nhello\r\n0\r\n\r\n".to_vec());
        assert_eq!(body.to_wire(), b"5;ext=1\r\nhello\r\n0\r\n\r\n");

        body.set_content("hi there");
        assert_eq!(body.to_wire(), b"8\r\nhi there\r\n0\r\n\r\n");
        assert_eq!(body.transfer_encoding(), TransferEncoding::Chunked);
    }

    #[test]
    fn test_identity_length_tracks_content() {
        let mut body = Body::from_bytes("abc");
        assert_eq!(body.declared_length(), Some(3));
        body.set_content("abcdef");
        assert_eq!(body.declared_length(), Some(6));
    }

    #[test]
    fn test_serde_roundtrip_uses_base64() {
        let body = Body::from_bytes(vec![0u8, 159, 146, 150]);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("AJ+Slg=="));
        let back: Body = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content(), body.content());
    }
}
