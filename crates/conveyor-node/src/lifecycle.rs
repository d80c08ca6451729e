use conveyor_core::NodeStatus;

use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};

impl ConveyorNode {
    /// Applies an operator state change. Setting IDLE drops the pallet
    /// bookkeeping; any pending hold still fires and hands off.
    pub(crate) fn on_change_state(&mut self, new_state: NodeStatus, step: &mut Step) {
        let from = self.state.status;
        self.state.status = new_state;
        let cleared_pallet = new_state == NodeStatus::Idle && self.state.take_pallet().is_some();
        self.emit(
            step,
            NodeEvent::StateChanged {
                from,
                to: new_state,
                cleared_pallet,
            },
        );
    }

    pub(crate) fn check_invariants(&self, step: &mut Step) -> Result<(), NodeError> {
        if self.state.status == NodeStatus::Idle && self.state.pallet.is_some() {
            return Err(self.violation(step, "idle node holds a pallet"));
        }
        Ok(())
    }

    pub(crate) fn violation(&self, step: &mut Step, detail: &'static str) -> NodeError {
        self.emit(step, NodeEvent::InvariantViolated { detail });
        NodeError::InvariantViolation {
            node: self.config.node_id.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use conveyor_codec::{ChangeState, Envelope, Performative, TransferPallet};
    use conveyor_core::{NodeId, NodeStatus};

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

    fn change(state: NodeStatus) -> Envelope {
        Envelope::with_payload(
            Performative::Request,
            NodeId::from("op"),
            NodeId::from("A"),
            &ChangeState { new_state: state }.into(),
        )
        .unwrap()
    }

    fn load(node: &mut ConveyorNode) {
        let request = Envelope::with_payload(
            Performative::Request,
            NodeId::from("op"),
            NodeId::from("A"),
            &TransferPallet {
                target_path: vec![NodeId::from("A"), NodeId::from("B")],
                elapsed_ms: 0,
            }
            .into(),
        )
        .unwrap();
        node.handle_envelope(request, 0).unwrap();
    }

    #[test]
    fn change_state_sends_no_reply() {
        let mut node = node();
        let step = node.handle_envelope(change(NodeStatus::Down), 0).unwrap();
        assert!(step.outbound.is_empty());
        assert_eq!(node.status(), NodeStatus::Down);
        assert!(matches!(
            step.events[..],
            [NodeEvent::StateChanged {
                from: NodeStatus::Idle,
                to: NodeStatus::Down,
                cleared_pallet: false
            }]
        ));
    }

    #[test]
    fn down_while_busy_keeps_pallet_and_hold_still_hands_off() {
        let mut node = node();
        load(&mut node);
        node.handle_envelope(change(NodeStatus::Down), 10).unwrap();
        assert_eq!(node.pallet().unwrap().destination, "B");

        let step = node.fire_due(100).unwrap();
        assert_eq!(node.status(), NodeStatus::Down);
        assert!(node.pallet().is_none());
        assert_eq!(step.outbound.len(), 1);
        assert_eq!(step.outbound[0].receiver, "B");
    }

    #[test]
    fn idle_clears_pallet_and_keeps_invariant() {
        let mut node = node();
        load(&mut node);
        let step = node.handle_envelope(change(NodeStatus::Idle), 10).unwrap();
        assert!(matches!(
            step.events[..],
            [NodeEvent::StateChanged {
                cleared_pallet: true,
                ..
            }]
        ));
        assert!(node.pallet().is_none());

        let step = node.fire_due(100).unwrap();
        assert_eq!(node.status(), NodeStatus::Idle);
        assert_eq!(step.outbound[0].receiver, "B");
    }

    #[test]
    fn busy_without_pallet_is_allowed() {
        let mut node = node();
        node.handle_envelope(change(NodeStatus::Busy), 0).unwrap();
        assert_eq!(node.status(), NodeStatus::Busy);
        assert!(node.pallet().is_none());
    }
}
