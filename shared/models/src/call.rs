//! One physical call attempt: leg A, leg B, and the bridge between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::machine::{ErrorRecord, Machine, Metadata, StateSpec, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    CallingA,
    RingingA,
    ConnectedA,
    CallingB,
    RingingB,
    ConnectedB,
    Bridged,
    Completed,
    FailedA,
    FailedB,
    FailedSystem,
    Cancelled,
}

impl StateSpec for CallState {
    fn successors(self) -> &'static [Self] {
        use CallState::*;
        match self {
            Pending => &[CallingA, FailedSystem, Cancelled],
            // Bridged is reachable straight from CallingA: the dialplan owns
            // leg B and the bridge, so an accepted Originate may jump there
            // without the intermediate leg states ever being observed.
            CallingA => &[RingingA, ConnectedA, Bridged, FailedA, FailedSystem, Cancelled],
            RingingA => &[ConnectedA, FailedA, FailedSystem, Cancelled],
            ConnectedA => &[CallingB, FailedSystem, Cancelled],
            CallingB => &[RingingB, ConnectedB, Bridged, FailedB, FailedSystem, Cancelled],
            RingingB => &[ConnectedB, Bridged, FailedB, FailedSystem, Cancelled],
            ConnectedB => &[Bridged, FailedSystem, Cancelled],
            Bridged => &[Completed, FailedSystem, Cancelled],
            Completed | FailedA | FailedB | FailedSystem | Cancelled => &[],
        }
    }

    fn is_final(self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::FailedA
                | CallState::FailedB
                | CallState::FailedSystem
                | CallState::Cancelled
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            CallState::Pending => "pending",
            CallState::CallingA => "calling_a",
            CallState::RingingA => "ringing_a",
            CallState::ConnectedA => "connected_a",
            CallState::CallingB => "calling_b",
            CallState::RingingB => "ringing_b",
            CallState::ConnectedB => "connected_b",
            CallState::Bridged => "bridged",
            CallState::Completed => "completed",
            CallState::FailedA => "failed_a",
            CallState::FailedB => "failed_b",
            CallState::FailedSystem => "failed_system",
            CallState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which leg of the call an Asterisk channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallAggregate {
    pub call_id: Uuid,
    pub order_id: Uuid,
    pub number_a: String,
    pub number_b: String,
    pub caller_id: String,
    pub trunk_name: String,
    channel_a_id: Option<String>,
    channel_b_id: Option<String>,
    machine: Machine<CallState>,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub bridged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl CallAggregate {
    pub fn new(
        order_id: Uuid,
        number_a: String,
        number_b: String,
        caller_id: String,
        trunk_name: String,
    ) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            order_id,
            number_a,
            number_b,
            caller_id,
            trunk_name,
            channel_a_id: None,
            channel_b_id: None,
            machine: Machine::new(CallState::Pending),
            started_at: None,
            answered_at: None,
            bridged_at: None,
            completed_at: None,
            failed_at: None,
            duration_seconds: None,
        }
    }

    /// Rebuild an aggregate from persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        call_id: Uuid,
        order_id: Uuid,
        number_a: String,
        number_b: String,
        caller_id: String,
        trunk_name: String,
        channel_a_id: Option<String>,
        channel_b_id: Option<String>,
        state: CallState,
        state_history: Vec<CallState>,
        state_timestamps: Vec<TransitionRecord>,
        error_log: Vec<ErrorRecord>,
        metadata: Metadata,
        started_at: Option<DateTime<Utc>>,
        answered_at: Option<DateTime<Utc>>,
        bridged_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        failed_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i64>,
    ) -> Self {
        Self {
            call_id,
            order_id,
            number_a,
            number_b,
            caller_id,
            trunk_name,
            channel_a_id,
            channel_b_id,
            machine: Machine::from_parts(state, state_history, state_timestamps, error_log, metadata),
            started_at,
            answered_at,
            bridged_at,
            completed_at,
            failed_at,
            duration_seconds,
        }
    }

    /// Attempt a transition, stamping the lifecycle timestamps on success.
    ///
    /// `duration_seconds` is derived when the call completes, measured from
    /// the bridge instant (falling back to dial start).
    pub fn transition_to(
        &mut self,
        target: CallState,
        metadata: Option<Metadata>,
        error: Option<&str>,
    ) -> bool {
        if !self.machine.transition_to(target, metadata, error) {
            return false;
        }
        let now = Utc::now();
        match target {
            CallState::CallingA => self.started_at = Some(now),
            CallState::ConnectedA | CallState::ConnectedB => {
                if self.answered_at.is_none() {
                    self.answered_at = Some(now);
                }
            }
            CallState::Bridged => self.bridged_at = Some(now),
            CallState::Completed => {
                self.completed_at = Some(now);
                let from = self.bridged_at.or(self.started_at);
                self.duration_seconds = from.map(|start| (now - start).num_seconds().max(0));
            }
            CallState::FailedA | CallState::FailedB | CallState::FailedSystem => {
                self.failed_at = Some(now)
            }
            _ => {}
        }
        true
    }

    /// Record the Asterisk identifier of leg A.
    ///
    /// Set at most once, and only after dialing has started; repeating the
    /// same identifier is accepted, anything else is rejected.
    pub fn set_channel_a(&mut self, channel_id: &str) -> bool {
        if self.state() == CallState::Pending {
            return false;
        }
        match &self.channel_a_id {
            None => {
                self.channel_a_id = Some(channel_id.to_string());
                self.machine
                    .insert_metadata("channel_a_id", serde_json::json!(channel_id));
                true
            }
            Some(existing) => existing == channel_id,
        }
    }

    /// Record the Asterisk identifier of leg B (created by the dialplan).
    pub fn set_channel_b(&mut self, channel_id: &str) -> bool {
        match &self.channel_b_id {
            None => {
                self.channel_b_id = Some(channel_id.to_string());
                self.machine
                    .insert_metadata("channel_b_id", serde_json::json!(channel_id));
                true
            }
            Some(existing) => existing == channel_id,
        }
    }

    /// Which leg a channel identifier belongs to, if either.
    pub fn leg_of(&self, channel_id: &str) -> Option<Leg> {
        if self.channel_a_id.as_deref() == Some(channel_id) {
            Some(Leg::A)
        } else if self.channel_b_id.as_deref() == Some(channel_id) {
            Some(Leg::B)
        } else {
            None
        }
    }

    pub fn channel_a_id(&self) -> Option<&str> {
        self.channel_a_id.as_deref()
    }

    pub fn channel_b_id(&self) -> Option<&str> {
        self.channel_b_id.as_deref()
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn is_final(&self) -> bool {
        self.machine.is_final()
    }

    pub fn can_transition_to(&self, target: CallState) -> bool {
        self.machine.can_transition_to(target)
    }

    pub fn state_history(&self) -> &[CallState] {
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
