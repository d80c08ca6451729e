//! Inbox dispatcher: routes a decoded envelope to its handler.

use conveyor_codec::{Envelope, MessageType, Payload, Performative};

use crate::error::NodeError;
use crate::node::{ConveyorNode, Step};

/// Performative a payload type must arrive with.
pub fn expected_performative(msg_type: MessageType) -> Performative {
    match msg_type {
        MessageType::TransferPallet | MessageType::FindPathReq | MessageType::ChangeState => {
            Performative::Request
        }
        MessageType::FindPathReply | MessageType::FindPathAbort => Performative::Inform,
    }
}

impl ConveyorNode {
    pub(crate) fn dispatch(
        &mut self,
        envelope: Envelope,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        if envelope.receiver != self.config.node_id {
            self.drop_malformed(
                envelope.sender.as_str(),
                &format!("addressed to {}", envelope.receiver),
                step,
            );
            return Ok(());
        }

        if envelope.performative.is_reply() {
            let body = match envelope.reply_body() {
                Ok(body) => body,
                Err(err) => {
                    self.drop_malformed(envelope.sender.as_str(), &err, step);
                    return Ok(());
                }
            };
            return self.on_handoff_reply(&envelope, body, now_ms, step);
        }

        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(err) => {
                self.drop_malformed(envelope.sender.as_str(), &err, step);
                return Ok(());
            }
        };
        let expected = expected_performative(payload.message_type());
        if envelope.performative != expected {
            self.drop_malformed(
                envelope.sender.as_str(),
                &format!(
                    "{:?} must be sent as {:?}, got {:?}",
                    payload.message_type(),
                    expected,
                    envelope.performative
                ),
                step,
            );
            return Ok(());
        }

        match payload {
            Payload::TransferPallet(request) => {
                self.on_transfer_request(&envelope, request, now_ms, step)
            }
            Payload::FindPathReq(request) => self.on_find_path_req(&envelope.sender, request, step),
            Payload::ChangeState(change) => {
                self.on_change_state(change.new_state, step);
                Ok(())
            }
            Payload::FindPathReply(reply) => self.on_find_path_reply(reply, now_ms, step),
            Payload::FindPathAbort(abort) => self.on_abort(&envelope.sender, abort, step),
        }
    }
}

#[cfg(test)]
mod tests {
    use conveyor_codec::{
        encode_envelope, ChangeState, Envelope, FindPathAbort, MessageType, Performative,
    };
    use conveyor_core::{NodeId, NodeStatus};

    use super::expected_performative;
    use crate::config::{NodeConfig, NodeTimings};
    use crate::events::NodeEvent;
    use crate::node::ConveyorNode;

    fn node() -> ConveyorNode {
        ConveyorNode::new(
            NodeConfig::new("A", ["B"], 100).unwrap(),
            NodeTimings::default(),
        )
        .unwrap()
    }

    fn assert_dropped(node: &mut ConveyorNode, bytes: &[u8]) {
        let step = node.handle_bytes("peer", bytes, 0).unwrap();
        assert!(step.outbound.is_empty(), "malformed input produced a reply");
        assert!(
            matches!(step.events[..], [NodeEvent::MalformedDropped { .. }]),
            "unexpected events: {:?}",
            step.events
        );
    }

    #[test]
    fn requests_and_informs_are_split_by_type() {
        assert_eq!(
            expected_performative(MessageType::TransferPallet),
            Performative::Request
        );
        assert_eq!(
            expected_performative(MessageType::FindPathAbort),
            Performative::Inform
        );
    }

    #[test]
    fn malformed_payloads_never_change_state() {
        let mut node = node();
        assert_dropped(&mut node, b"not json at all");
        assert_dropped(
            &mut node,
            br#"{"performative":"REQUEST","sender":"B","receiver":"A","content":{"msg_type":9}}"#,
        );
        assert_dropped(
            &mut node,
            br#"{"performative":"REQUEST","sender":"B","receiver":"A","content":{"msg_type":0,"elapsed_ms":0}}"#,
        );
        assert_dropped(
            &mut node,
            br#"{"performative":"REQUEST","sender":"B","receiver":"A","content":{"msg_type":0,"target_path":"A","elapsed_ms":0}}"#,
        );
        assert_dropped(
            &mut node,
            br#"{"performative":"REQUEST","sender":"B","receiver":"A","content":{"msg_type":2,"new_state":7}}"#,
        );
        assert_eq!(node.status(), NodeStatus::Idle);
        assert!(node.pallet().is_none());
    }

    #[test]
    fn wrong_performative_is_dropped() {
        let mut node = node();
        let envelope = Envelope::with_payload(
            Performative::Inform,
            NodeId::from("op"),
            NodeId::from("A"),
            &ChangeState {
                new_state: NodeStatus::Down,
            }
            .into(),
        )
        .unwrap();
        assert_dropped(&mut node, &encode_envelope(&envelope).unwrap());
        assert_eq!(node.status(), NodeStatus::Idle);
    }

    #[test]
    fn misaddressed_envelope_is_dropped() {
        let mut node = node();
        let envelope = Envelope::with_payload(
            Performative::Inform,
            NodeId::from("B"),
            NodeId::from("Q"),
            &FindPathAbort {
                query_id: "B-1-00".into(),
            }
            .into(),
        )
        .unwrap();
        assert_dropped(&mut node, &encode_envelope(&envelope).unwrap());
    }

    #[test]
    fn reply_with_non_object_body_is_dropped() {
        let mut node = node();
        assert_dropped(
            &mut node,
            br#"{"performative":"REFUSE","sender":"B","receiver":"A","conversation_id":"c","content":"BUSY"}"#,
        );
    }
}
