//! Kernel messaging protocol - message envelope, signing and framing
//!
//! Every message exchanged with the kernel travels as a ZeroMQ multipart
//! message with the following frame layout:
//!
//! ```text
//! [ident, ident, ...]      ← routing identities (zero or more, iopub topic)
//! "<IDS|MSG>"              ← delimiter
//! signature                ← hex(HMAC-SHA256(header|parent|metadata|content))
//! header                   ← JSON {msg_id, session, username, date, msg_type, version}
//! parent_header            ← JSON header of the request that caused this message ({} if none)
//! metadata                 ← JSON object
//! content                  ← JSON object, shape depends on msg_type
//! ```
//!
//! The `parent_header.msg_id` is the correlation id that ties iopub
//! traffic back to the request that produced it.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;
use zeromq::ZmqMessage;

/// Frame separating routing identities from the signed message body
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Messaging protocol version spoken by this client
pub const PROTOCOL_VERSION: &str = "5.3";

type HmacSha256 = Hmac<Sha256>;

/// Error type for encoding and decoding kernel messages
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("message has no <IDS|MSG> delimiter")]
    MissingDelimiter,
    #[error("message truncated: expected 5 frames after delimiter, got {0}")]
    Truncated(usize),
    #[error("message signature mismatch")]
    BadSignature,
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot build multipart message: {0}")]
    Frame(String),
}

/// Message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    /// Create a header for a new outgoing message
    pub fn new(session: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::now_v7().to_string(),
            session: session.to_string(),
            username: "cellpilot".to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded (or to-be-encoded) kernel message
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    pub header: Header,
    /// Kept as raw JSON because kernels send `{}` for unsolicited messages
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
}

impl JupyterMessage {
    /// Build a new request message with a freshly generated msg_id
    pub fn request(session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            header: Header::new(session, msg_type),
            parent_header: json!({}),
            metadata: json!({}),
            content,
        }
    }

    /// Override the generated msg_id (the caller owns the correlation id)
    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.header.msg_id = msg_id.into();
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The msg_id of the request this message answers, if any
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// Encode into signed multipart frames
    pub fn to_frames(&self, signer: &Signer) -> Result<ZmqMessage, WireError> {
        let header = serde_json::to_vec(&self.header)?;
        let parent = serde_json::to_vec(&self.parent_header)?;
        let metadata = serde_json::to_vec(&self.metadata)?;
        let content = serde_json::to_vec(&self.content)?;

        let signature = signer.sign(&[&header[..], &parent[..], &metadata[..], &content[..]]);

        let frames: Vec<Bytes> = vec![
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent),
            Bytes::from(metadata),
            Bytes::from(content),
        ];

        ZmqMessage::try_from(frames).map_err(|e| WireError::Frame(e.to_string()))
    }

    /// Decode and verify a multipart message received from the kernel
    pub fn from_frames(message: ZmqMessage, signer: &Signer) -> Result<Self, WireError> {
        Self::from_parts(message.into_vec(), signer)
    }

    fn from_parts(frames: Vec<Bytes>, signer: &Signer) -> Result<Self, WireError> {
        let delimiter = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or(WireError::MissingDelimiter)?;

        let body = &frames[delimiter + 1..];
        if body.len() < 5 {
            return Err(WireError::Truncated(body.len()));
        }

        signer.verify(&body[0][..], &[&body[1][..], &body[2][..], &body[3][..], &body[4][..]])?;

        Ok(Self {
            header: serde_json::from_slice(&body[1])?,
            parent_header: serde_json::from_slice(&body[2])?,
            metadata: serde_json::from_slice(&body[3])?,
            content: serde_json::from_slice(&body[4])?,
        })
    }
}

/// HMAC-SHA256 message signer keyed by the connection file's `key`
///
/// An empty key disables signing (the kernel then sends empty signatures).
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl Signer {
    pub fn new(key: &str) -> Result<Self, WireError> {
        if key.is_empty() {
            return Ok(Self { mac: None });
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| WireError::InvalidKey(e.to_string()))?;
        Ok(Self { mac: Some(mac) })
    }

    /// Hex-encoded signature over the given frames
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.mac {
            Some(mac) => {
                let mut mac = mac.clone();
                for part in parts {
                    mac.update(part);
                }
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        }
    }

    /// Constant-time check of a received signature
    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), WireError> {
        let Some(mac) = &self.mac else {
            return Ok(());
        };
        let expected = hex::decode(signature).map_err(|_| WireError::BadSignature)?;
        let mut mac = mac.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&expected).map_err(|_| WireError::BadSignature)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.mac.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_frames(signer: &Signer, parent_id: &str, msg_type: &str, content: Value) -> Vec<Bytes> {
        let header = serde_json::to_vec(&json!({
            "msg_id": "reply-1",
            "session": "kernel-session",
            "username": "kernel",
            "date": "2026-01-01T00:00:00Z",
            "msg_type": msg_type,
            "version": "5.3",
        }))
        .unwrap();
        let parent = serde_json::to_vec(&json!({ "msg_id": parent_id, "msg_type": "execute_request" })).unwrap();
        let metadata = b"{}".to_vec();
        let content = serde_json::to_vec(&content).unwrap();
        let signature = signer.sign(&[&header[..], &parent[..], &metadata[..], &content[..]]);

        vec![
            Bytes::from_static(b"execute_result"),
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent),
            Bytes::from(metadata),
            Bytes::from(content),
        ]
    }

    #[test]
    fn test_decode_with_topic_prefix() {
        let signer = Signer::new("secret").unwrap();
        let frames = reply_frames(&signer, "req-42", "stream", json!({"name": "stdout", "text": "hi\n"}));

        let msg = JupyterMessage::from_parts(frames, &signer).unwrap();
        assert_eq!(msg.msg_type(), "stream");
        assert_eq!(msg.parent_msg_id(), Some("req-42"));
        assert_eq!(msg.content["text"], "hi\n");
    }

    #[test]
    fn test_tampered_content_rejected() {
        let signer = Signer::new("secret").unwrap();
        let mut frames = reply_frames(&signer, "req-42", "stream", json!({"name": "stdout", "text": "hi"}));
        let last = frames.len() - 1;
        frames[last] = Bytes::from_static(br#"{"name":"stdout","text":"forged"}"#);

        let err = JupyterMessage::from_parts(frames, &signer).unwrap_err();
        assert!(matches!(err, WireError::BadSignature));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let kernel_signer = Signer::new("kernel-key").unwrap();
        let frames = reply_frames(&kernel_signer, "req-1", "status", json!({"execution_state": "idle"}));

        let client_signer = Signer::new("other-key").unwrap();
        assert!(JupyterMessage::from_parts(frames, &client_signer).is_err());
    }

    #[test]
    fn test_empty_key_disables_signing() {
        let signer = Signer::new("").unwrap();
        assert_eq!(signer.sign(&[b"abc".as_slice()]), "");
        assert!(signer.verify(b"", &[b"abc".as_slice()]).is_ok());
    }

    #[test]
    fn test_missing_delimiter() {
        let signer = Signer::new("k").unwrap();
        let frames = vec![Bytes::from_static(b"{}"), Bytes::from_static(b"{}")];
        assert!(matches!(
            JupyterMessage::from_parts(frames, &signer),
            Err(WireError::MissingDelimiter)
        ));
    }

    #[test]
    fn test_truncated_body() {
        let signer = Signer::new("k").unwrap();
        let frames = vec![Bytes::from_static(DELIMITER), Bytes::from_static(b"sig")];
        assert!(matches!(
            JupyterMessage::from_parts(frames, &signer),
            Err(WireError::Truncated(1))
        ));
    }

    #[test]
    fn test_unsolicited_message_has_no_parent() {
        let msg = JupyterMessage::request("s", "kernel_info_request", json!({}));
        assert_eq!(msg.parent_msg_id(), None);
        assert_eq!(msg.header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_request_signature_verifies() {
        let signer = Signer::new("secret").unwrap();
        let msg = JupyterMessage::request("session-1", "execute_request", json!({"code": "1+1"}))
            .with_msg_id("fixed-id");
        let frames = msg.to_frames(&signer).unwrap().into_vec();

        assert_eq!(frames[0].as_ref(), DELIMITER);
        let decoded = JupyterMessage::from_parts(frames, &signer).unwrap();
        assert_eq!(decoded.msg_id(), "fixed-id");
        assert_eq!(decoded.content["code"], "1+1");
    }
}
