//! Append-only event records.
//!
//! Every persisted Order/Call transition is mirrored by exactly one event
//! row; the REST surface exposes the log per order, oldest first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::call::{CallAggregate, CallState};
use crate::machine::{Metadata, StateSpec};
use crate::order::{OrderAggregate, OrderState};

/// Event name for an order transition: `order.<state>`.
pub fn order_event_name(state: OrderState) -> String {
    format!("order.{}", state.as_str())
}

/// Event name for a call transition: `call.<state>`, with the three failure
/// states collapsed to `call.failed` so consumers match one name.
pub fn call_event_name(state: CallState) -> String {
    match state {
        CallState::FailedA | CallState::FailedB | CallState::FailedSystem => {
            "call.failed".to_string()
        }
        other => format!("call.{}", other.as_str()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    Call,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::Call => "call",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "order" => Some(EntityType::Order),
            "call" => Some(EntityType::Call),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be appended, before the store assigns id and sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub order_id: Option<Uuid>,
    pub call_id: Option<Uuid>,
    pub state: Option<String>,
    pub previous_state: Option<String>,
    pub metadata: Metadata,
    pub error_message: Option<String>,
}

impl EventDraft {
    /// Event mirroring the order's latest recorded transition.
    pub fn for_order(order: &OrderAggregate, event_type: impl Into<String>) -> Self {
        let last = order.state_timestamps().last();
        Self {
            event_type: event_type.into(),
            entity_type: EntityType::Order,
            entity_id: order.order_id,
            order_id: Some(order.order_id),
            call_id: order.call_id(),
            state: last.map(|entry| entry.state.clone()),
            previous_state: last.and_then(|entry| entry.previous_state.clone()),
            metadata: last.map(|entry| entry.metadata.clone()).unwrap_or_default(),
            error_message: last.and_then(|entry| entry.error.clone()),
        }
    }

    /// Event mirroring the call's latest recorded transition.
    pub fn for_call(call: &CallAggregate, event_type: impl Into<String>) -> Self {
        let last = call.state_timestamps().last();
        Self {
            event_type: event_type.into(),
            entity_type: EntityType::Call,
            entity_id: call.call_id,
            order_id: Some(call.order_id),
            call_id: Some(call.call_id),
            state: last.map(|entry| entry.state.clone()),
            previous_state: last.and_then(|entry| entry.previous_state.clone()),
            metadata: last.map(|entry| entry.metadata.clone()).unwrap_or_default(),
            error_message: last.and_then(|entry| entry.error.clone()),
        }
    }
}

/// A persisted event row.
///
/// `seq` is the store-assigned sequence that totally orders the log; it
/// survives crashes, unlike wall-clock ties inside one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderState;

    #[test]
    fn order_draft_mirrors_the_latest_transition() {
        let mut order = OrderAggregate::new(
            "t1".into(),
            "100".into(),
            "200".into(),
            "100".into(),
            "default".into(),
        );
        order.transition_to(OrderState::Pending, None, None);

        let draft = EventDraft::for_order(&order, "order.created");
        assert_eq!(draft.entity_type, EntityType::Order);
        assert_eq!(draft.entity_id, order.order_id);
        assert_eq!(draft.state.as_deref(), Some("pending"));
        assert_eq!(draft.previous_state.as_deref(), Some("created"));
        assert!(draft.error_message.is_none());
    }

    #[test]
    fn entity_type_round_trips_through_its_wire_name() {
        for entity in [EntityType::Order, EntityType::Call] {
            assert_eq!(EntityType::parse(entity.as_str()), Some(entity));
        }
        assert_eq!(EntityType::parse("bridge"), None);
    }
}
