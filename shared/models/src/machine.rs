//! Generic guarded state machine shared by the Order and Call aggregates.
//!
//! Both machines have the same shape: a state enumeration, a static table of
//! allowed successors, a set of terminal states, and per-transition
//! bookkeeping (history, timestamps, error log). The machine never panics and
//! never throws; `transition_to` is a guarded no-op that reports rejection
//! through its return value.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Free-form metadata attached to aggregates and individual transitions.
pub type Metadata = Map<String, Value>;

/// A state enumeration usable by [`Machine`].
///
/// Implementations encode the full transition table: `successors` must be
/// exhaustive, and terminal states must return an empty slice.
pub trait StateSpec:
    Copy + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// States reachable from `self` in a single transition.
    fn successors(self) -> &'static [Self];

    /// Terminal states admit no further transitions.
    fn is_final(self) -> bool;

    /// Wire / persistence name, e.g. `"calling_a"`.
    fn as_str(self) -> &'static str;
}

/// One accepted transition, as recorded in `state_timestamps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One captured error, as recorded in `error_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub state: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// The generic machine: current state plus append-only bookkeeping.
///
/// `state_history` is strictly append-only and its last element always equals
/// `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: StateSpec")]
pub struct Machine<S: StateSpec> {
    state: S,
    state_history: Vec<S>,
    state_timestamps: Vec<TransitionRecord>,
    error_log: Vec<ErrorRecord>,
    metadata: Metadata,
}

impl<S: StateSpec> Machine<S> {
    /// A fresh machine in `initial`, with the creation instant recorded as the
    /// first timestamp entry.
    pub fn new(initial: S) -> Self {
        Self::with_metadata(initial, Metadata::new())
    }

    pub fn with_metadata(initial: S, metadata: Metadata) -> Self {
        Self {
            state: initial,
            state_history: vec![initial],
            state_timestamps: vec![TransitionRecord {
                state: initial.as_str().to_string(),
                previous_state: None,
                timestamp: Utc::now(),
                metadata: Metadata::new(),
                error: None,
            }],
            error_log: Vec::new(),
            metadata,
        }
    }

    /// Rebuild a machine from persisted parts. The store is the only caller.
    pub fn from_parts(
        state: S,
        state_history: Vec<S>,
        state_timestamps: Vec<TransitionRecord>,
        error_log: Vec<ErrorRecord>,
        metadata: Metadata,
    ) -> Self {
        Self {
            state,
            state_history,
            state_timestamps,
            error_log,
            metadata,
        }
    }

    /// Attempt a transition to `target`.
    ///
    /// Returns `false` without any side effect when the current state is
    /// terminal or `target` is not an allowed successor. On success the
    /// history, timestamp record and (if `error` is given) the error log are
    /// appended, and `metadata` is merged into the aggregate metadata.
    pub fn transition_to(
        &mut self,
        target: S,
        metadata: Option<Metadata>,
        error: Option<&str>,
    ) -> bool {
        if !self.can_transition_to(target) {
            return false;
        }

        let previous = self.state;
        let now = Utc::now();
        let entry_metadata = metadata.clone().unwrap_or_default();

        self.state = target;
        self.state_history.push(target);
        self.state_timestamps.push(TransitionRecord {
            state: target.as_str().to_string(),
            previous_state: Some(previous.as_str().to_string()),
            timestamp: now,
            metadata: entry_metadata.clone(),
            error: error.map(str::to_string),
        });

        if let Some(error) = error {
            self.error_log.push(ErrorRecord {
                state: target.as_str().to_string(),
                timestamp: now,
                error: error.to_string(),
                metadata: entry_metadata,
            });
        }

        if let Some(extra) = metadata {
            for (key, value) in extra {
                self.metadata.insert(key, value);
            }
        }

        true
    }

    pub fn can_transition_to(&self, target: S) -> bool {
        !self.is_final() && self.state.successors().contains(&target)
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn state_history(&self) -> &[S] {
        &self.state_history
    }

    pub fn state_timestamps(&self) -> &[TransitionRecord] {
        &self.state_timestamps
    }

    pub fn error_log(&self) -> &[ErrorRecord] {
        &self.error_log
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn insert_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    /// Timestamp of the first recorded entry (creation instant).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.state_timestamps
            .first()
            .map(|entry| entry.timestamp)
            .unwrap_or_else(Utc::now)
    }

    /// Timestamp of the most recent accepted transition.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state_timestamps
            .last()
            .map(|entry| entry.timestamp)
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Toy {
        Start,
        Middle,
        Done,
    }

    impl StateSpec for Toy {
        fn successors(self) -> &'static [Self] {
            match self {
                Toy::Start => &[Toy::Middle],
                Toy::Middle => &[Toy::Done],
                Toy::Done => &[],
            }
        }

        fn is_final(self) -> bool {
            matches!(self, Toy::Done)
        }

        fn as_str(self) -> &'static str {
            match self {
                Toy::Start => "start",
                Toy::Middle => "middle",
                Toy::Done => "done",
            }
        }
    }

    #[test]
    fn accepted_transition_appends_history_and_timestamps() {
        let mut machine = Machine::new(Toy::Start);
        assert!(machine.transition_to(Toy::Middle, None, None));

        assert_eq!(machine.state(), Toy::Middle);
        assert_eq!(machine.state_history(), &[Toy::Start, Toy::Middle]);
        assert_eq!(machine.state_timestamps().len(), 2);
        let last = machine.state_timestamps().last().unwrap();
        assert_eq!(last.state, "middle");
        assert_eq!(last.previous_state.as_deref(), Some("start"));
        assert!(machine.error_log().is_empty());
    }

    #[test]
    fn disallowed_transition_is_a_pure_no_op() {
        let mut machine = Machine::new(Toy::Start);
        let before = machine.clone();

        assert!(!machine.transition_to(Toy::Done, None, None));
        assert_eq!(machine, before);
    }

    #[test]
    fn self_transition_is_rejected() {
        let mut machine = Machine::new(Toy::Start);
        assert!(!machine.transition_to(Toy::Start, None, None));
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let mut machine = Machine::new(Toy::Start);
        assert!(machine.transition_to(Toy::Middle, None, None));
        assert!(machine.transition_to(Toy::Done, None, None));
        assert!(machine.is_final());

        assert!(!machine.transition_to(Toy::Middle, None, None));
        assert_eq!(machine.state_history().len(), 3);
    }

    #[test]
    fn error_is_captured_in_both_timestamp_entry_and_error_log() {
        let mut machine = Machine::new(Toy::Start);
        let mut meta = Metadata::new();
        meta.insert("cause".into(), serde_json::json!("16"));

        assert!(machine.transition_to(Toy::Middle, Some(meta), Some("line busy")));

        let entry = machine.state_timestamps().last().unwrap();
        assert_eq!(entry.error.as_deref(), Some("line busy"));
        assert_eq!(machine.error_log().len(), 1);
        assert_eq!(machine.error_log()[0].error, "line busy");
        assert_eq!(machine.error_log()[0].metadata["cause"], "16");
        assert_eq!(machine.metadata()["cause"], "16");
    }

    #[test]
    fn serde_round_trip_preserves_everything() {
        let mut machine = Machine::new(Toy::Start);
        machine.transition_to(Toy::Middle, None, Some("wobble"));

        let json = serde_json::to_string(&machine).unwrap();
        let back: Machine<Toy> = serde_json::from_str(&json).unwrap();
        assert_eq!(machine, back);
    }
}
