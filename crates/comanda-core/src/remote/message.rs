//! Remote protocol message types
//!
//! Messages exchanged with the document server over WebSocket, CBOR encoded.
//! Requests carry a `requestId` the server echoes in its reply; listener
//! traffic (`subscribe`, `snapshot`) is keyed by collection name.

use serde::{Deserialize, Serialize};

use crate::models::{Collection, Fields};

/// Peer ID for identifying this client
pub type PeerId = String;

/// Correlates a request with its reply
pub type RequestId = u64;

/// Protocol version
pub const PROTOCOL_V1: &str = "1";

/// Messages sent to the document server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join/handshake message
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "senderId")]
        sender_id: PeerId,
        #[serde(rename = "supportedProtocolVersions")]
        supported_protocol_versions: Vec<String>,
    },

    /// Start receiving snapshots of a collection
    #[serde(rename = "subscribe")]
    Subscribe { collection: String },

    /// Stop receiving snapshots of a collection
    #[serde(rename = "unsubscribe")]
    Unsubscribe { collection: String },

    /// Field-level merge upsert of one document
    #[serde(rename = "merge")]
    Merge {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
        id: String,
        fields: Fields,
    },

    /// Delete one document
    #[serde(rename = "delete")]
    Delete {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
        id: String,
    },

    /// Read a whole collection once
    #[serde(rename = "fetch")]
    Fetch {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        collection: String,
    },
}

/// Messages received from the document server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Peer handshake response
    #[serde(rename = "peer")]
    Peer {
        #[serde(rename = "senderId")]
        sender_id: PeerId,
        #[serde(rename = "selectedProtocolVersion")]
        selected_protocol_version: String,
    },

    /// Full contents of a subscribed collection
    #[serde(rename = "snapshot")]
    Snapshot {
        collection: String,
        documents: Collection,
    },

    /// A merge or delete was applied
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },

    /// Reply to a fetch
    #[serde(rename = "documents")]
    Documents {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        documents: Collection,
    },

    /// Error from server, tied to a request or a subscription when known
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "requestId", default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        collection: Option<String>,
        message: String,
    },
}

/// Failure to encode or decode a frame
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("CBOR encoding failed: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("CBOR decoding failed: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

impl ClientMessage {
    /// Create a join message
    pub fn join(sender_id: &str) -> Self {
        ClientMessage::Join {
            sender_id: sender_id.to_string(),
            supported_protocol_versions: vec![PROTOCOL_V1.to_string()],
        }
    }

    /// Request ID of this message, if it expects a reply
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Merge { request_id, .. }
            | ClientMessage::Delete { request_id, .. }
            | ClientMessage::Fetch { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

impl ServerMessage {
    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fields_from_value, Record};
    use serde_json::json;

    #[test]
    fn test_join_message_encoding() {
        let msg = ClientMessage::join("peer-123");
        let bytes = msg.encode().unwrap();
        assert!(!bytes.is_empty());

        match ClientMessage::decode(&bytes).unwrap() {
            ClientMessage::Join {
                sender_id,
                supported_protocol_versions,
            } => {
                assert_eq!(sender_id, "peer-123");
                assert_eq!(supported_protocol_versions, vec!["1".to_string()]);
            }
            other => panic!("Expected Join, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_carries_json_fields() {
        let fields = fields_from_value(json!({
            "status": "PREPARANDO",
            "total": 57.9,
            "items": [{"productId": "p1", "qty": 2}],
            "paid": false
        }))
        .unwrap();
        let msg = ClientMessage::Merge {
            request_id: 7,
            collection: "orders".to_string(),
            id: "o1".to_string(),
            fields: fields.clone(),
        };

        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id(), Some(7));
        match decoded {
            ClientMessage::Merge { fields: got, .. } => assert_eq!(got, fields),
            other => panic!("Expected Merge, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_decoding() {
        let msg = ServerMessage::Snapshot {
            collection: "zip_ranges".to_string(),
            documents: vec![Record::from_fields(
                "z1",
                fields_from_value(json!({"start": "01000000", "end": "01999999", "fee": 7})).unwrap(),
            )],
        };

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Snapshot {
                collection,
                documents,
            } => {
                assert_eq!(collection, "zip_ranges");
                assert_eq!(documents[0].id(), "z1");
                assert_eq!(documents[0].get("fee"), Some(&json!(7)));
            }
            other => panic!("Expected Snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_error_without_request_id() {
        let msg = ServerMessage::Error {
            request_id: None,
            collection: Some("orders".to_string()),
            message: "permission denied".to_string(),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(ServerMessage::decode(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_request_id_only_on_requests() {
        assert_eq!(ClientMessage::join("a").request_id(), None);
        assert_eq!(
            ClientMessage::Subscribe {
                collection: "orders".to_string()
            }
            .request_id(),
            None
        );
    }
}
