use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_core::NodeId;

use crate::error::CodecError;
use crate::payload::Payload;

/// Largest encoded envelope accepted by `decode_envelope`.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Request/reply polarity of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Performative {
    Request,
    Agree,
    Refuse,
    Inform,
    Failure,
}

impl Performative {
    /// Whether this performative answers an earlier REQUEST.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Performative::Agree | Performative::Refuse | Performative::Failure
        )
    }
}

/// Content of AGREE / REFUSE / FAILURE replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReplyBody {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Uniform inter-node message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub performative: Performative,
    pub sender: NodeId,
    pub receiver: NodeId,
    /// Correlates hand-off replies with the loader that sent the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub content: Value,
}

impl Envelope {
    /// Builds an envelope carrying a typed payload.
    pub fn with_payload(
        performative: Performative,
        sender: NodeId,
        receiver: NodeId,
        payload: &Payload,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            performative,
            sender,
            receiver,
            conversation_id: None,
            reply_with: None,
            in_reply_to: None,
            content: payload.to_content()?,
        })
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_reply_with(mut self, reply_with: impl Into<String>) -> Self {
        self.reply_with = Some(reply_with.into());
        self
    }

    /// Builds a reply to `self`, swapping sender and receiver and keeping
    /// conversation correlation fields.
    pub fn reply(&self, performative: Performative, body: ReplyBody) -> Result<Self, CodecError> {
        Ok(Self {
            performative,
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            conversation_id: self.conversation_id.clone(),
            reply_with: None,
            in_reply_to: self.reply_with.clone(),
            content: serde_json::to_value(body)?,
        })
    }

    /// Decodes the typed payload of a REQUEST / INFORM envelope.
    pub fn payload(&self) -> Result<Payload, CodecError> {
        Payload::from_content(&self.content)
    }

    /// Decodes the body of an AGREE / REFUSE / FAILURE envelope.
    pub fn reply_body(&self) -> Result<ReplyBody, CodecError> {
        match &self.content {
            Value::Null => Ok(ReplyBody::default()),
            other => serde_json::from_value(other.clone())
                .map_err(|e| CodecError::InvalidPayload(e.to_string())),
        }
    }
}

/// Encodes an envelope as UTF-8 JSON bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decodes an envelope, refusing oversized inputs before parsing.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}
