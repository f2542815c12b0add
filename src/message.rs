use serde::{Deserialize, Serialize};

use crate::{key::Key, routing::Contact, MESSAGE_LEN};

/// Wire tag of a [Message]. [Timeout](MessageType::Timeout) is synthetic
/// and never sent; [Unknown](MessageType::Unknown) absorbs tags from newer
/// peers so the datagram still proves the sender's liveness.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Ping,
    Pong,
    FindNode,
    FindNodeResponse,
    FindValue,
    FindValueResponse,
    Store,
    StoreResponse,
    Timeout,
    #[serde(other)]
    Unknown,
}

/// The single tagged record carried by every datagram.
///
/// Only the tag is mandatory on the wire; every other field decodes to its
/// default when absent, so peers can omit what a given type does not use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub sender: Contact,
    #[serde(default)]
    pub rpc_id: Key,
    #[serde(default)]
    pub key: Key,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("can't encode message: {0}")]
    Encode(#[source] serde_cbor::Error),
    #[error("can't decode message: {0}")]
    Decode(#[source] serde_cbor::Error),
    #[error("encoded message is {len} bytes, over the datagram limit")]
    TooLarge { len: usize },
}

impl Message {
    pub fn new(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            sender: Contact::default(),
            rpc_id: Key::default(),
            key: Key::default(),
            body: Vec::new(),
            contacts: Vec::new(),
        }
    }

    /// Encodes to self-describing binary, bounded by [MESSAGE_LEN].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let encoded = serde_cbor::to_vec(self).map_err(CodecError::Encode)?;
        if encoded.len() > MESSAGE_LEN {
            return Err(CodecError::TooLarge { len: encoded.len() });
        }
        Ok(encoded)
    }

    pub fn decode(datagram: &[u8]) -> Result<Message, CodecError> {
        serde_cbor::from_slice(datagram).map_err(CodecError::Decode)
    }
}
