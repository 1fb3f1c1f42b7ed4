//! Request and response bodies for the REST surface.
//!
//! Snapshots are flattened, serialisable views of the aggregates; timestamps
//! serialise as ISO-8601 strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use models::machine::{ErrorRecord, Metadata, TransitionRecord};
use models::{CallAggregate, OrderAggregate};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub from: String,
    pub to: String,
    pub user_token: String,
    #[serde(default)]
    pub trunk: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: Uuid,
    pub state: String,
    pub user_token: String,
    pub number_a: String,
    pub number_b: String,
    pub caller_id: String,
    pub trunk_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<Uuid>,
    pub metadata: Metadata,
    pub state_history: Vec<String>,
    pub state_timestamps: Vec<TransitionRecord>,
    pub error_log: Vec<ErrorRecord>,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Present on status reads when a call is linked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSnapshot>,
}

impl From<&OrderAggregate> for OrderSnapshot {
    fn from(order: &OrderAggregate) -> Self {
        Self {
            order_id: order.order_id,
            state: order.state().to_string(),
            user_token: order.user_token.clone(),
            number_a: order.number_a.clone(),
            number_b: order.number_b.clone(),
            caller_id: order.caller_id.clone(),
            trunk_name: order.trunk_name.clone(),
            call_id: order.call_id(),
            metadata: order.metadata().clone(),
            state_history: order
                .state_history()
                .iter()
                .map(|state| state.to_string())
                .collect(),
            state_timestamps: order.state_timestamps().to_vec(),
            error_log: order.error_log().to_vec(),
            is_final: order.is_final(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
            completed_at: order.completed_at,
            failed_at: order.failed_at,
            cancelled_at: order.cancelled_at,
            call: None,
        }
    }
}

impl OrderSnapshot {
    pub fn with_call(mut self, call: Option<CallSnapshot>) -> Self {
        self.call = call;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub call_id: Uuid,
    pub order_id: Uuid,
    pub state: String,
    pub number_a: String,
    pub number_b: String,
    pub caller_id: String,
    pub trunk_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_a_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_b_id: Option<String>,
    pub metadata: Metadata,
    pub state_history: Vec<String>,
    pub state_timestamps: Vec<TransitionRecord>,
    pub error_log: Vec<ErrorRecord>,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl From<&CallAggregate> for CallSnapshot {
    fn from(call: &CallAggregate) -> Self {
        Self {
            call_id: call.call_id,
            order_id: call.order_id,
            state: call.state().to_string(),
            number_a: call.number_a.clone(),
            number_b: call.number_b.clone(),
            caller_id: call.caller_id.clone(),
            trunk_name: call.trunk_name.clone(),
            channel_a_id: call.channel_a_id().map(str::to_string),
            channel_b_id: call.channel_b_id().map(str::to_string),
            metadata: call.metadata().clone(),
            state_history: call
                .state_history()
                .iter()
                .map(|state| state.to_string())
                .collect(),
            state_timestamps: call.state_timestamps().to_vec(),
            error_log: call.error_log().to_vec(),
            is_final: call.is_final(),
            created_at: call.created_at(),
            updated_at: call.updated_at(),
            started_at: call.started_at,
            answered_at: call.answered_at,
            bridged_at: call.bridged_at,
            completed_at: call.completed_at,
            failed_at: call.failed_at,
            duration_seconds: call.duration_seconds,
        }
    }
}

/// The uniform error body: `{"status":"error","message":"…"}` plus optional
/// context for PBX failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            state: None,
            error_details: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
