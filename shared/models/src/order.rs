//! The commercial envelope of a call request.
//!
//! An order moves `CREATED → PENDING → PROCESSING → INITIATED → VERIFIED →
//! COMPLETED`, with `FAILED` / `CANCELLED` reachable from every non-terminal
//! state and `REFUNDED` reserved as a terminal for out-of-band settlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::machine::{ErrorRecord, Machine, Metadata, StateSpec, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Created,
    Pending,
    Processing,
    Initiated,
    Verified,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl StateSpec for OrderState {
    fn successors(self) -> &'static [Self] {
        use OrderState::*;
        match self {
            Created => &[Pending, Failed, Cancelled],
            Pending => &[Processing, Failed, Cancelled],
            Processing => &[Initiated, Failed, Cancelled],
            Initiated => &[Verified, Completed, Failed, Cancelled],
            Verified => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled | Refunded => &[],
        }
    }

    fn is_final(self) -> bool {
        matches!(
            self,
            OrderState::Completed
                | OrderState::Failed
                | OrderState::Cancelled
                | OrderState::Refunded
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::Pending => "pending",
            OrderState::Processing => "processing",
            OrderState::Initiated => "initiated",
            OrderState::Verified => "verified",
            OrderState::Completed => "completed",
            OrderState::Failed => "failed",
            OrderState::Cancelled => "cancelled",
            OrderState::Refunded => "refunded",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order row as held in memory during a request.
///
/// The aggregate embeds its state machine; the linked call is referenced by
/// id only and resolved through the store on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAggregate {
    pub order_id: Uuid,
    pub user_token: String,
    pub number_a: String,
    pub number_b: String,
    pub caller_id: String,
    pub trunk_name: String,
    call_id: Option<Uuid>,
    machine: Machine<OrderState>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl OrderAggregate {
    pub fn new(
        user_token: String,
        number_a: String,
        number_b: String,
        caller_id: String,
        trunk_name: String,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            user_token,
            number_a,
            number_b,
            caller_id,
            trunk_name,
            call_id: None,
            machine: Machine::new(OrderState::Created),
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    /// Rebuild an aggregate from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        order_id: Uuid,
        user_token: String,
        number_a: String,
        number_b: String,
        caller_id: String,
        trunk_name: String,
        call_id: Option<Uuid>,
        state: OrderState,
        state_history: Vec<OrderState>,
        state_timestamps: Vec<TransitionRecord>,
        error_log: Vec<ErrorRecord>,
        metadata: Metadata,
        completed_at: Option<DateTime<Utc>>,
        failed_at: Option<DateTime<Utc>>,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            order_id,
            user_token,
            number_a,
            number_b,
            caller_id,
            trunk_name,
            call_id,
            machine: Machine::from_parts(state, state_history, state_timestamps, error_log, metadata),
            completed_at,
            failed_at,
            cancelled_at,
        }
    }

    /// Attempt a transition, stamping the terminal timestamps on success.
    pub fn transition_to(
        &mut self,
        target: OrderState,
        metadata: Option<Metadata>,
        error: Option<&str>,
    ) -> bool {
        if !self.machine.transition_to(target, metadata, error) {
            return false;
        }
        match target {
            OrderState::Completed => self.completed_at = Some(Utc::now()),
            OrderState::Failed => self.failed_at = Some(Utc::now()),
            OrderState::Cancelled => self.cancelled_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    /// Link the call that implements this order.
    ///
    /// Idempotent: linking the same id again succeeds; linking a different id
    /// once one is set is rejected.
    pub fn set_call_id(&mut self, call_id: Uuid) -> bool {
        match self.call_id {
            None => {
                self.call_id = Some(call_id);
                self.machine
                    .insert_metadata("call_id", serde_json::json!(call_id.to_string()));
                true
            }
            Some(existing) => existing == call_id,
        }
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.call_id
    }

    pub fn state(&self) -> OrderState {
        self.machine.state()
    }

    pub fn is_final(&self) -> bool {
        self.machine.is_final()
    }

    pub fn can_transition_to(&self, target: OrderState) -> bool {
        self.machine.can_transition_to(target)
    }

    pub fn state_history(&self) -> &[OrderState] {
        self.machine.state_history()
    }

    pub fn state_timestamps(&self) -> &[TransitionRecord] {
        self.machine.state_timestamps()
    }

    pub fn error_log(&self) -> &[ErrorRecord] {
        self.machine.error_log()
    }

    pub fn metadata(&self) -> &Metadata {
        self.machine.metadata()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.machine.created_at()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.machine.updated_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> OrderAggregate {
        OrderAggregate::new(
            "t1".into(),
            "09140916320".into(),
            "09221609805".into(),
            "09140916320".into(),
            "default".into(),
        )
    }

    #[test]
    fn lifecycle_follows_the_allowed_table() {
        let mut order = order();
        assert_eq!(order.state(), OrderState::Created);

        for target in [
            OrderState::Pending,
            OrderState::Processing,
            OrderState::Initiated,
            OrderState::Verified,
            OrderState::Completed,
        ] {
            assert!(order.transition_to(target, None, None), "to {target}");
        }
        assert!(order.is_final());
        assert!(order.completed_at.is_some());
    }

    #[test]
    fn created_cannot_jump_to_completed() {
        let mut order = order();
        let history_before = order.state_history().to_vec();

        assert!(!order.transition_to(OrderState::Completed, None, None));
        assert_eq!(order.state(), OrderState::Created);
        assert_eq!(order.state_history(), history_before.as_slice());
    }

    #[test]
    fn every_terminal_state_rejects_further_transitions() {
        for terminal in [
            OrderState::Completed,
            OrderState::Failed,
            OrderState::Cancelled,
            OrderState::Refunded,
        ] {
            assert!(terminal.successors().is_empty());
            assert!(terminal.is_final());
        }
    }

    #[test]
    fn set_call_id_is_idempotent_but_immutable() {
        let mut order = order();
        let call = Uuid::new_v4();

        assert!(order.set_call_id(call));
        assert!(order.set_call_id(call));
        assert!(!order.set_call_id(Uuid::new_v4()));
        assert_eq!(order.call_id(), Some(call));
    }

    #[test]
    fn failure_records_error_and_failed_at() {
        let mut order = order();
        assert!(order.transition_to(OrderState::Pending, None, None));
        assert!(order.transition_to(OrderState::Failed, None, Some("pbx unreachable")));

        assert!(order.failed_at.is_some());
        assert_eq!(order.error_log().len(), 1);
        assert_eq!(order.error_log()[0].error, "pbx unreachable");
    }

    #[test]
    fn state_names_serialise_lowercase() {
        assert_eq!(
            serde_json::to_value(OrderState::Processing).unwrap(),
            serde_json::json!("processing")
        );
        assert_eq!(OrderState::Verified.as_str(), "verified");
    }
}
