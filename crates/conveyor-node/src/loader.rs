//! Hand-off loader: sends a pallet to the next hop and retries until it is
//! accepted, or escalates to route discovery.

use conveyor_codec::{Envelope, Performative, ReplyBody, TransferPallet};
use conveyor_core::NodeStatus;

use crate::discovery::REROUTE_CONVERSATION_PREFIX;
use crate::error::NodeError;
use crate::events::NodeEvent;
use crate::node::{ConveyorNode, Step};
use crate::state::HandoffLoader;
use crate::timers::TimerKind;

fn reply_tag(attempt: u32) -> String {
    format!("req{attempt}")
}

fn parse_reply_tag(tag: &str) -> Option<u32> {
    tag.strip_prefix("req")?.parse().ok()
}

impl ConveyorNode {
    /// Starts a loader for `request`, whose first path element is the
    /// receiving neighbour.
    pub(crate) fn start_handoff(
        &mut self,
        request: TransferPallet,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let (Some(receiver), Some(destination)) =
            (request.target_path.first(), request.target_path.last())
        else {
            return Ok(());
        };
        let (receiver, destination) = (receiver.clone(), destination.clone());
        let seq = self.next_seq();
        let conversation_id = format!(
            "load-{}-{}-{}-{}",
            self.config.node_id, receiver, now_ms, seq
        );
        self.state.loaders.insert(
            conversation_id.clone(),
            HandoffLoader {
                conversation_id: conversation_id.clone(),
                receiver,
                request,
                destination,
                attempts: 0,
                awaiting: None,
                started_ms: now_ms,
            },
        );
        self.send_handoff(&conversation_id, now_ms, step)
    }

    fn send_handoff(
        &mut self,
        conversation_id: &str,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let Some(loader) = self.state.loaders.get_mut(conversation_id) else {
            return Ok(());
        };
        loader.attempts += 1;
        loader.awaiting = Some(loader.attempts);
        let attempt = loader.attempts;
        let envelope = Envelope::with_payload(
            Performative::Request,
            self.config.node_id.clone(),
            loader.receiver.clone(),
            &loader.request.clone().into(),
        )?
        .with_conversation(conversation_id)
        .with_reply_with(reply_tag(attempt));
        step.send(envelope);
        self.timers.schedule(
            now_ms.saturating_add(self.timings.reply_timeout_ms),
            TimerKind::ReplyTimeout {
                conversation_id: conversation_id.to_string(),
                attempt,
            },
        );
        Ok(())
    }

    /// Handles AGREE / REFUSE / FAILURE addressed to this node.
    pub(crate) fn on_handoff_reply(
        &mut self,
        envelope: &Envelope,
        body: ReplyBody,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let conversation_id = envelope.conversation_id.as_deref().unwrap_or_default();
        let Some(loader) = self.state.loaders.get_mut(conversation_id) else {
            // Replies to our own rerouted transfer were already reported.
            let own_reroute = envelope.sender == self.config.node_id
                && conversation_id.starts_with(REROUTE_CONVERSATION_PREFIX);
            if !own_reroute {
                self.emit(
                    step,
                    NodeEvent::UnmatchedReply {
                        from: envelope.sender.clone(),
                        conversation_id: envelope.conversation_id.clone(),
                    },
                );
            }
            return Ok(());
        };

        if envelope.performative == Performative::Agree {
            let to = loader.receiver.clone();
            let attempts = loader.attempts;
            self.state.loaders.remove(conversation_id);
            self.emit(step, NodeEvent::HandedOff { to, attempts });
            return Ok(());
        }

        let attempt = match envelope.in_reply_to.as_deref() {
            Some(tag) => parse_reply_tag(tag),
            None => loader.awaiting,
        };
        if attempt.is_none() || attempt != loader.awaiting {
            let conversation_id = envelope.conversation_id.clone();
            self.emit(
                step,
                NodeEvent::UnmatchedReply {
                    from: envelope.sender.clone(),
                    conversation_id,
                },
            );
            return Ok(());
        }

        let reason = match envelope.performative {
            Performative::Refuse => body.reason.unwrap_or_default(),
            _ => "FAILURE".to_string(),
        };
        if envelope.performative == Performative::Refuse
            && reason == NodeStatus::Down.as_str()
        {
            let to = loader.receiver.clone();
            let destination = loader.destination.clone();
            self.state.loaders.remove(conversation_id);
            self.emit(
                step,
                NodeEvent::NextHopDown {
                    to,
                    destination: destination.clone(),
                },
            );
            self.start_query(destination, step)?;
            return Ok(());
        }

        loader.awaiting = None;
        let event = NodeEvent::HandoffDeferred {
            to: loader.receiver.clone(),
            reason,
            attempts: loader.attempts,
        };
        self.emit(step, event);
        self.defer_or_escalate(conversation_id, now_ms, step)
    }

    pub(crate) fn on_reply_timeout(
        &mut self,
        conversation_id: &str,
        attempt: u32,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let Some(loader) = self.state.loaders.get_mut(conversation_id) else {
            return Ok(());
        };
        if loader.awaiting != Some(attempt) {
            return Ok(());
        }
        loader.awaiting = None;
        let event = NodeEvent::HandoffTimedOut {
            to: loader.receiver.clone(),
            attempts: loader.attempts,
        };
        self.emit(step, event);
        self.defer_or_escalate(conversation_id, now_ms, step)
    }

    pub(crate) fn on_loader_retry(
        &mut self,
        conversation_id: &str,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        match self.state.loaders.get(conversation_id) {
            Some(loader) if loader.awaiting.is_none() => {
                self.send_handoff(conversation_id, now_ms, step)
            }
            _ => Ok(()),
        }
    }

    /// Schedules the next attempt, or gives up on the neighbour and starts
    /// route discovery once the retry cap is exceeded.
    fn defer_or_escalate(
        &mut self,
        conversation_id: &str,
        now_ms: u64,
        step: &mut Step,
    ) -> Result<(), NodeError> {
        let Some(loader) = self.state.loaders.get(conversation_id) else {
            return Ok(());
        };
        let capped = self
            .timings
            .load_max_retries
            .is_some_and(|max| loader.attempts > max);
        if !capped {
            self.timers.schedule(
                now_ms.saturating_add(self.timings.load_retry_ms),
                TimerKind::LoaderRetry {
                    conversation_id: conversation_id.to_string(),
                },
            );
            return Ok(());
        }
        let Some(loader) = self.state.loaders.remove(conversation_id) else {
            return Ok(());
        };
        self.emit(
            step,
            NodeEvent::RetryCapReached {
                to: loader.receiver,
                attempts: loader.attempts,
            },
        );
        self.start_query(loader.destination, step)?;
        Ok(())
    }
}
