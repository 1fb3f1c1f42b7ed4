//! Event demultiplexer: correlates asynchronous AMI events back to calls
//! and advances the call state machine.
//!
//! Correlation keys are tried in priority order: `ActionID` (pins an
//! in-flight Originate), `Uniqueid`, `Channel`, and for bridge events the
//! bridge id. Only events that resolve to a tracked call are processed;
//! everything else is ignored silently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use models::event::call_event_name;
use models::machine::Metadata;
use models::{CallAggregate, CallState, EventDraft, Leg};

use crate::store::Store;

use super::protocol::Packet;

const HANGUP_NORMAL_CAUSES: [&str; 2] = ["0", "16"];

#[derive(Default)]
struct BridgeMembers {
    members: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    by_action: HashMap<String, Uuid>,
    by_unique: HashMap<String, Uuid>,
    by_channel: HashMap<String, Uuid>,
    bridges: HashMap<String, (Uuid, BridgeMembers)>,
}

/// Maps AMI correlation keys to call ids.
#[derive(Default)]
pub struct CorrelationIndex {
    inner: RwLock<Inner>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin an in-flight `Originate` action to its call.
    pub fn bind_action(&self, action_id: &str, call_id: Uuid) {
        self.inner
            .write()
            .unwrap()
            .by_action
            .insert(action_id.to_string(), call_id);
    }

    pub fn bind_unique(&self, unique_id: &str, call_id: Uuid) {
        self.inner
            .write()
            .unwrap()
            .by_unique
            .insert(unique_id.to_string(), call_id);
    }

    pub fn bind_channel(&self, channel: &str, call_id: Uuid) {
        self.inner
            .write()
            .unwrap()
            .by_channel
            .insert(channel.to_string(), call_id);
    }

    /// Resolve a packet to a call id, if any of its keys are known.
    pub fn resolve(&self, packet: &Packet) -> Option<Uuid> {
        let inner = self.inner.read().unwrap();
        if let Some(call_id) = packet
            .action_id()
            .and_then(|id| inner.by_action.get(id).copied())
        {
            return Some(call_id);
        }
        if let Some(call_id) = packet
            .get("Uniqueid")
            .and_then(|id| inner.by_unique.get(id).copied())
        {
            return Some(call_id);
        }
        if let Some(call_id) = packet
            .get("Channel")
            .and_then(|name| inner.by_channel.get(name).copied())
        {
            return Some(call_id);
        }
        packet
            .get("BridgeUniqueid")
            .and_then(|id| inner.bridges.get(id).map(|(call_id, _)| *call_id))
    }

    /// Record a channel entering a bridge; returns the member count.
    pub fn bridge_enter(&self, bridge_id: &str, unique_id: &str, call_id: Uuid) -> usize {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .bridges
            .entry(bridge_id.to_string())
            .or_insert_with(|| (call_id, BridgeMembers::default()));
        entry.1.members.insert(unique_id.to_string());
        entry.1.members.len()
    }

    /// Drop every key pointing at a call that reached a terminal state.
    pub fn forget_call(&self, call_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner.by_action.retain(|_, id| *id != call_id);
        inner.by_unique.retain(|_, id| *id != call_id);
        inner.by_channel.retain(|_, id| *id != call_id);
        inner.bridges.retain(|_, (id, _)| *id != call_id);
    }
}

/// Advance a call aggregate for one AMI event.
///
/// Pure with respect to IO: the caller persists. Returns whether the
/// aggregate was mutated and the event rows to append. Transitions rejected
/// by the machine (late ringing after an optimistic bridge, say) mutate
/// nothing and draft nothing.
pub fn apply_event(
    call: &mut CallAggregate,
    packet: &Packet,
    bridge_complete: bool,
) -> (bool, Vec<EventDraft>) {
    let mut changed = false;
    let mut drafts = Vec::new();
    let Some(event) = packet.event_type() else {
        return (changed, drafts);
    };
    let unique_id = packet.get("Uniqueid");

    match event {
        "Newchannel" => {
            if let Some(unique_id) = unique_id {
                if call.channel_a_id().is_none() {
                    changed |= call.set_channel_a(unique_id);
                } else if call.leg_of(unique_id).is_none() {
                    changed |= call.set_channel_b(unique_id);
                }
            }
        }
        "Newstate" => match packet.get("ChannelState") {
            // 4 = Ringing, 5 = Up
            Some("4") => {
                changed |= ringing(call, unique_id, packet, &mut drafts);
            }
            Some("5") => {
                changed |= answered(call, unique_id, packet, &mut drafts);
            }
            _ => {}
        },
        "Ringing" => {
            changed |= ringing(call, unique_id, packet, &mut drafts);
        }
        "Answer" => {
            changed |= answered(call, unique_id, packet, &mut drafts);
        }
        "BridgeEnter" => {
            if bridge_complete {
                changed |= transition(call, CallState::Bridged, packet, None, &mut drafts);
            }
        }
        "BridgeLeave" | "NewCallerid" => {
            tracing::debug!(event, unique_id, "ami channel event observed");
        }
        "Hangup" => {
            let cause = packet.get("Cause").unwrap_or("0");
            if HANGUP_NORMAL_CAUSES.contains(&cause) {
                changed |= transition(call, CallState::Completed, packet, None, &mut drafts);
            } else {
                let cause_txt = packet.get("Cause-txt").unwrap_or("Unknown");
                let error = format!("{cause}: {cause_txt}");
                let target = match leg_for(call, unique_id) {
                    Leg::A => CallState::FailedA,
                    Leg::B => CallState::FailedB,
                };
                changed |= transition(call, target, packet, Some(&error), &mut drafts);
            }
        }
        "OriginateResponse" => {
            let failed = packet
                .get("Response")
                .map(|value| value.eq_ignore_ascii_case("Failure"))
                .unwrap_or(false);
            if failed {
                let reason = packet
                    .get("Reason")
                    .map(|reason| format!("originate failed, reason {reason}"))
                    .unwrap_or_else(|| "originate failed".to_string());
                changed |= transition(call, CallState::FailedA, packet, Some(&reason), &mut drafts);
            } else if let Some(unique_id) = unique_id {
                changed |= call.set_channel_a(unique_id);
            }
        }
        _ => {
            tracing::trace!(event, "unhandled ami event");
        }
    }

    (changed, drafts)
}

fn ringing(
    call: &mut CallAggregate,
    unique_id: Option<&str>,
    packet: &Packet,
    drafts: &mut Vec<EventDraft>,
) -> bool {
    let target = match leg_for(call, unique_id) {
        Leg::A => CallState::RingingA,
        Leg::B => CallState::RingingB,
    };
    transition(call, target, packet, None, drafts)
}

fn answered(
    call: &mut CallAggregate,
    unique_id: Option<&str>,
    packet: &Packet,
    drafts: &mut Vec<EventDraft>,
) -> bool {
    let target = match leg_for(call, unique_id) {
        Leg::A => CallState::ConnectedA,
        Leg::B => CallState::ConnectedB,
    };
    transition(call, target, packet, None, drafts)
}

/// Channels we cannot attribute default to leg A: leg B only exists once the
/// dialplan has created it and we have seen its identifier.
fn leg_for(call: &CallAggregate, unique_id: Option<&str>) -> Leg {
    unique_id
        .and_then(|id| call.leg_of(id))
        .unwrap_or(Leg::A)
}

fn transition(
    call: &mut CallAggregate,
    target: CallState,
    packet: &Packet,
    error: Option<&str>,
    drafts: &mut Vec<EventDraft>,
) -> bool {
    if call.transition_to(target, Some(packet_metadata(packet)), error) {
        drafts.push(EventDraft::for_call(call, call_event_name(target)));
        true
    } else {
        tracing::debug!(
            call_id = %call.call_id,
            state = %call.state(),
            target = %target,
            "ami event transition rejected"
        );
        false
    }
}

fn packet_metadata(packet: &Packet) -> Metadata {
    let mut metadata = Metadata::new();
    for key in ["Uniqueid", "Channel", "Cause", "Cause-txt", "BridgeUniqueid"] {
        if let Some(value) = packet.get(key) {
            metadata.insert(key.to_ascii_lowercase(), serde_json::json!(value));
        }
    }
    metadata
}

/// The single consumer of the AMI event channel.
pub struct EventDispatcher {
    store: Arc<dyn Store>,
    index: Arc<CorrelationIndex>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn Store>, index: Arc<CorrelationIndex>) -> Self {
        Self { store, index }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Packet>) {
        while let Some(packet) = rx.recv().await {
            if let Err(error) = self.handle(&packet).await {
                tracing::error!(
                    %error,
                    event = packet.event_type(),
                    "failed to process ami event"
                );
            }
        }
        tracing::info!("ami event channel closed, dispatcher stopping");
    }

    /// Resolve, load, apply, persist. Unknown events resolve to nothing and
    /// are dropped before any store access.
    pub async fn handle(&self, packet: &Packet) -> anyhow::Result<()> {
        let Some(event) = packet.event_type() else {
            return Ok(());
        };
        let Some(call_id) = self.index.resolve(packet) else {
            tracing::trace!(event, "ami event does not correlate to a tracked call");
            return Ok(());
        };
        let Some(mut call) = self.store.get_call(call_id).await? else {
            return Ok(());
        };

        if let Some(unique_id) = packet.get("Uniqueid") {
            self.index.bind_unique(unique_id, call_id);
        }
        if let Some(channel) = packet.get("Channel") {
            self.index.bind_channel(channel, call_id);
        }

        let bridge_complete = if event == "BridgeEnter" {
            match (packet.get("BridgeUniqueid"), packet.get("Uniqueid")) {
                (Some(bridge_id), Some(unique_id)) => {
                    self.index.bridge_enter(bridge_id, unique_id, call_id) >= 2
                }
                _ => false,
            }
        } else {
            false
        };

        let (changed, drafts) = apply_event(&mut call, packet, bridge_complete);
        if changed || !drafts.is_empty() {
            self.store.save_call(&call, &drafts).await?;
        }
        if call.is_final() {
            self.index.forget_call(call_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_call() -> CallAggregate {
        let mut call = CallAggregate::new(
            Uuid::new_v4(),
            "09140916320".into(),
            "09221609805".into(),
            "09140916320".into(),
            "default".into(),
        );
        assert!(call.transition_to(CallState::CallingA, None, None));
        assert!(call.set_channel_a("100.1"));
        call
    }

    fn event(pairs: &[(&str, &str)]) -> Packet {
        let mut packet = Packet::new();
        for (key, value) in pairs {
            packet.push(key, value);
        }
        packet
    }

    #[test]
    fn ringing_advances_leg_a() {
        let mut call = tracked_call();
        let packet = event(&[("Event", "Newstate"), ("Uniqueid", "100.1"), ("ChannelState", "4")]);

        let (changed, drafts) = apply_event(&mut call, &packet, false);
        assert!(changed);
        assert_eq!(call.state(), CallState::RingingA);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].event_type, "call.ringing_a");
    }

    #[test]
    fn hangup_with_normal_cause_completes_a_bridged_call() {
        let mut call = tracked_call();
        assert!(call.transition_to(CallState::Bridged, None, None));
        let packet = event(&[("Event", "Hangup"), ("Uniqueid", "100.1"), ("Cause", "16")]);

        let (_, drafts) = apply_event(&mut call, &packet, false);
        assert_eq!(call.state(), CallState::Completed);
        assert_eq!(drafts[0].event_type, "call.completed");
        assert!(call.duration_seconds.is_some());
    }

    #[test]
    fn hangup_with_busy_cause_fails_the_dialing_leg() {
        let mut call = tracked_call();
        let packet = event(&[
            ("Event", "Hangup"),
            ("Uniqueid", "100.1"),
            ("Cause", "17"),
            ("Cause-txt", "User busy"),
        ]);

        let (_, drafts) = apply_event(&mut call, &packet, false);
        assert_eq!(call.state(), CallState::FailedA);
        assert_eq!(drafts[0].event_type, "call.failed");
        assert_eq!(call.error_log()[0].error, "17: User busy");
    }

    #[test]
    fn originate_failure_fails_leg_a_with_reason() {
        let mut call = tracked_call();
        let packet = event(&[
            ("Event", "OriginateResponse"),
            ("Response", "Failure"),
            ("Reason", "3"),
        ]);

        let (_, drafts) = apply_event(&mut call, &packet, false);
        assert_eq!(call.state(), CallState::FailedA);
        assert_eq!(drafts[0].error_message.as_deref(), Some("originate failed, reason 3"));
    }

    #[test]
    fn late_ringing_after_optimistic_bridge_is_a_no_op() {
        let mut call = tracked_call();
        assert!(call.transition_to(CallState::Bridged, None, None));
        let packet = event(&[("Event", "Ringing"), ("Uniqueid", "100.1")]);

        let (changed, drafts) = apply_event(&mut call, &packet, false);
        assert!(!changed);
        assert!(drafts.is_empty());
        assert_eq!(call.state(), CallState::Bridged);
    }

    #[test]
    fn bridge_enter_needs_both_legs() {
        let mut call = tracked_call();
        assert!(call.transition_to(CallState::ConnectedA, None, None));
        assert!(call.transition_to(CallState::CallingB, None, None));
        let packet = event(&[
            ("Event", "BridgeEnter"),
            ("Uniqueid", "100.1"),
            ("BridgeUniqueid", "b-1"),
        ]);

        let (changed, _) = apply_event(&mut call, &packet, false);
        assert!(!changed);
        assert_eq!(call.state(), CallState::CallingB);

        let (changed, drafts) = apply_event(&mut call, &packet, true);
        assert!(changed);
        assert_eq!(call.state(), CallState::Bridged);
        assert_eq!(drafts[0].event_type, "call.bridged");
    }

    #[test]
    fn index_resolution_prefers_action_id() {
        let index = CorrelationIndex::new();
        let by_action = Uuid::new_v4();
        let by_unique = Uuid::new_v4();
        index.bind_action("act-1", by_action);
        index.bind_unique("100.9", by_unique);

        let packet = event(&[
            ("Event", "OriginateResponse"),
            ("ActionID", "act-1"),
            ("Uniqueid", "100.9"),
        ]);
        assert_eq!(index.resolve(&packet), Some(by_action));

        let packet = event(&[("Event", "Hangup"), ("Uniqueid", "100.9")]);
        assert_eq!(index.resolve(&packet), Some(by_unique));

        let packet = event(&[("Event", "Hangup"), ("Uniqueid", "unknown")]);
        assert_eq!(index.resolve(&packet), None);
    }

    #[test]
    fn forget_call_evicts_every_key() {
        let index = CorrelationIndex::new();
        let call_id = Uuid::new_v4();
        index.bind_action("act-2", call_id);
        index.bind_unique("200.1", call_id);
        index.bind_channel("SIP/trunk-0001", call_id);
        index.forget_call(call_id);

        let packet = event(&[
            ("Event", "Hangup"),
            ("ActionID", "act-2"),
            ("Uniqueid", "200.1"),
            ("Channel", "SIP/trunk-0001"),
        ]);
        assert_eq!(index.resolve(&packet), None);
    }
}
