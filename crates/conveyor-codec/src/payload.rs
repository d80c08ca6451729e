use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use conveyor_core::{NodeId, NodeStatus, QueryId};

use crate::error::CodecError;

/// Longest accepted `target_path` / `path` field.
pub const MAX_PATH_LEN: usize = 1024;

/// Integer `msg_type` discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    TransferPallet = 0,
    FindPathReq = 1,
    ChangeState = 2,
    FindPathReply = 3,
    FindPathAbort = 4,
}

impl MessageType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MessageType::TransferPallet),
            1 => Some(MessageType::FindPathReq),
            2 => Some(MessageType::ChangeState),
            3 => Some(MessageType::FindPathReply),
            4 => Some(MessageType::FindPathAbort),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPallet {
    /// Remaining path; the first element is the receiving node.
    pub target_path: Vec<NodeId>,
    /// Hold time accumulated on earlier hops.
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindPathReq {
    pub query_id: QueryId,
    pub dest: NodeId,
    pub cost: u64,
    /// Nodes already traversed, origin first.
    pub path: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeState {
    pub new_state: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindPathReply {
    pub query_id: QueryId,
    pub cost: u64,
    /// Full discovered path, origin first and destination last.
    pub path: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindPathAbort {
    pub query_id: QueryId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeStateWire {
    new_state: i64,
}

/// Typed message payload selected by `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    TransferPallet(TransferPallet),
    FindPathReq(FindPathReq),
    ChangeState(ChangeState),
    FindPathReply(FindPathReply),
    FindPathAbort(FindPathAbort),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::TransferPallet(_) => MessageType::TransferPallet,
            Payload::FindPathReq(_) => MessageType::FindPathReq,
            Payload::ChangeState(_) => MessageType::ChangeState,
            Payload::FindPathReply(_) => MessageType::FindPathReply,
            Payload::FindPathAbort(_) => MessageType::FindPathAbort,
        }
    }

    /// Encodes the payload as a JSON object carrying its `msg_type`.
    pub fn to_content(&self) -> Result<Value, CodecError> {
        let body = match self {
            Payload::TransferPallet(p) => serde_json::to_value(p)?,
            Payload::FindPathReq(p) => serde_json::to_value(p)?,
            Payload::ChangeState(p) => serde_json::to_value(ChangeStateWire {
                new_state: p.new_state.code(),
            })?,
            Payload::FindPathReply(p) => serde_json::to_value(p)?,
            Payload::FindPathAbort(p) => serde_json::to_value(p)?,
        };
        let Value::Object(mut fields) = body else {
            return Err(CodecError::InvalidPayload(
                "payload did not encode as an object".into(),
            ));
        };
        fields.insert(
            "msg_type".to_string(),
            Value::from(self.message_type().code()),
        );
        Ok(Value::Object(fields))
    }

    /// Decodes and validates a JSON payload object.
    pub fn from_content(content: &Value) -> Result<Self, CodecError> {
        let fields = content
            .as_object()
            .ok_or_else(|| CodecError::InvalidPayload("content must be an object".into()))?;
        let code = fields
            .get("msg_type")
            .ok_or_else(|| CodecError::InvalidPayload("missing msg_type".into()))?
            .as_i64()
            .ok_or_else(|| CodecError::InvalidPayload("msg_type must be an integer".into()))?;
        let msg_type = MessageType::from_code(code).ok_or(CodecError::UnknownMessageType(code))?;

        let payload = match msg_type {
            MessageType::TransferPallet => {
                let p: TransferPallet = from_fields(fields)?;
                if p.target_path.is_empty() {
                    return Err(CodecError::InvalidPayload(
                        "target_path must not be empty".into(),
                    ));
                }
                check_path(&p.target_path)?;
                Payload::TransferPallet(p)
            }
            MessageType::FindPathReq => {
                let p: FindPathReq = from_fields(fields)?;
                check_query_id(&p.query_id)?;
                check_node(&p.dest)?;
                check_path(&p.path)?;
                Payload::FindPathReq(p)
            }
            MessageType::ChangeState => {
                let wire: ChangeStateWire = from_fields(fields)?;
                let new_state = NodeStatus::from_code(wire.new_state).ok_or_else(|| {
                    CodecError::InvalidPayload(format!("new_state {} out of range", wire.new_state))
                })?;
                Payload::ChangeState(ChangeState { new_state })
            }
            MessageType::FindPathReply => {
                let p: FindPathReply = from_fields(fields)?;
                check_query_id(&p.query_id)?;
                if p.path.is_empty() {
                    return Err(CodecError::InvalidPayload("reply path must not be empty".into()));
                }
                check_path(&p.path)?;
                Payload::FindPathReply(p)
            }
            MessageType::FindPathAbort => {
                let p: FindPathAbort = from_fields(fields)?;
                check_query_id(&p.query_id)?;
                Payload::FindPathAbort(p)
            }
        };
        Ok(payload)
    }
}

fn from_fields<T: serde::de::DeserializeOwned>(fields: &Map<String, Value>) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(fields.clone()))
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

fn check_path(path: &[NodeId]) -> Result<(), CodecError> {
    if path.len() > MAX_PATH_LEN {
        return Err(CodecError::PathTooLong(path.len()));
    }
    path.iter().try_for_each(check_node)
}

fn check_node(node: &NodeId) -> Result<(), CodecError> {
    if node.as_str().trim().is_empty() {
        return Err(CodecError::InvalidPayload("empty node id".into()));
    }
    Ok(())
}

fn check_query_id(query_id: &str) -> Result<(), CodecError> {
    if query_id.is_empty() {
        return Err(CodecError::InvalidPayload("empty query_id".into()));
    }
    Ok(())
}

impl From<TransferPallet> for Payload {
    fn from(p: TransferPallet) -> Self {
        Payload::TransferPallet(p)
    }
}

impl From<FindPathReq> for Payload {
    fn from(p: FindPathReq) -> Self {
        Payload::FindPathReq(p)
    }
}

impl From<ChangeState> for Payload {
    fn from(p: ChangeState) -> Self {
        Payload::ChangeState(p)
    }
}

impl From<FindPathReply> for Payload {
    fn from(p: FindPathReply) -> Self {
        Payload::FindPathReply(p)
    }
}

impl From<FindPathAbort> for Payload {
    fn from(p: FindPathAbort) -> Self {
        Payload::FindPathAbort(p)
    }
}
