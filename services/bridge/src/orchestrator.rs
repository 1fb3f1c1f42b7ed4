//! Drives an order through its lifecycle: create, execute against the PBX,
//! and read back status.
//!
//! Bridging is delegated to the PBX dialplan: `Originate` dials leg A into
//! the control context, which dials leg B and bridges. An accepted action
//! therefore moves the call to `BRIDGED` optimistically; the asynchronous
//! event stream later settles the true terminal state.

use std::sync::Arc;

use uuid::Uuid;

use dto::{CallSnapshot, CreateOrderRequest, OrderSnapshot};
use models::event::{call_event_name, order_event_name};
use models::machine::Metadata;
use models::{CallAggregate, CallState, EventDraft, EventRecord, OrderAggregate, OrderState};

use crate::ami::{AmiClient, AmiError, AmiManager, CorrelationIndex, Originate};
use crate::error::ApiError;
use crate::store::Store;

/// Dialplan context that performs leg B and the bridge.
pub const DIALPLAN_CONTEXT: &str = "securebridge-control";
pub const ORIGINATE_TIMEOUT_MS: u32 = 30_000;

pub struct Orchestrator {
    store: Arc<dyn Store>,
    ami: Arc<AmiManager>,
    index: Arc<CorrelationIndex>,
    default_trunk: String,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        ami: Arc<AmiManager>,
        index: Arc<CorrelationIndex>,
        default_trunk: String,
    ) -> Self {
        Self {
            store,
            ami,
            index,
            default_trunk,
        }
    }

    /// Create an order and park it in `PENDING`, ready for execution.
    pub async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<OrderSnapshot, ApiError> {
        let trunk = request
            .trunk
            .clone()
            .unwrap_or_else(|| self.default_trunk.clone());
        let mut order = OrderAggregate::new(
            request.user_token.clone(),
            request.from.clone(),
            request.to.clone(),
            request.from.clone(),
            trunk,
        );

        order.transition_to(OrderState::Pending, None, None);
        // One persisted write, one event: order.created covers construction
        // and the immediate move to pending.
        let created = EventDraft::for_order(&order, "order.created");
        self.store.save_order(&order, &[created]).await?;

        tracing::info!(order_id = %order.order_id, "order created");
        Ok(OrderSnapshot::from(&order))
    }

    /// Execute a pending order: connect the PBX, create the call, originate.
    pub async fn execute_order(&self, order_id: Uuid) -> Result<OrderSnapshot, ApiError> {
        let mut order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(ApiError::NotFound("order"))?;

        if order.is_final() {
            return Err(ApiError::Conflict(format!(
                "order {order_id} is already {}",
                order.state()
            )));
        }
        if !order.transition_to(OrderState::Processing, None, None) {
            return Err(ApiError::Conflict(format!(
                "order {order_id} cannot be executed from state {}",
                order.state()
            )));
        }
        self.store
            .save_order(
                &order,
                &[EventDraft::for_order(
                    &order,
                    order_event_name(OrderState::Processing),
                )],
            )
            .await?;

        // No call exists until the PBX session is up: a connection failure
        // fails the order alone.
        let client = match self.ami.ensure_connected().await {
            Ok(client) => client,
            Err(error) => return self.fail_order(order, &error).await,
        };

        let mut call = CallAggregate::new(
            order.order_id,
            order.number_a.clone(),
            order.number_b.clone(),
            order.caller_id.clone(),
            order.trunk_name.clone(),
        );
        order.set_call_id(call.call_id);
        order.transition_to(OrderState::Initiated, None, None);
        self.store
            .save_order(
                &order,
                &[EventDraft::for_order(
                    &order,
                    order_event_name(OrderState::Initiated),
                )],
            )
            .await?;

        call.transition_to(CallState::CallingA, None, None);
        self.store
            .save_call(
                &call,
                &[EventDraft::for_call(
                    &call,
                    call_event_name(CallState::CallingA),
                )],
            )
            .await?;

        // Register the ActionID before anything hits the wire so the
        // dispatcher can pin the OriginateResponse to this call.
        let action_id = AmiClient::new_action_id();
        self.index.bind_action(&action_id, call.call_id);

        match client.originate(&action_id, &self.originate_for(&order)).await {
            Ok(response) => {
                let mut metadata = Metadata::new();
                if let Some(message) = response.message() {
                    metadata.insert("response_message".into(), serde_json::json!(message));
                }
                call.transition_to(CallState::Bridged, Some(metadata), None);
                self.store
                    .save_call(
                        &call,
                        &[EventDraft::for_call(
                            &call,
                            call_event_name(CallState::Bridged),
                        )],
                    )
                    .await?;

                order.transition_to(OrderState::Verified, None, None);
                self.store
                    .save_order(
                        &order,
                        &[EventDraft::for_order(
                            &order,
                            order_event_name(OrderState::Verified),
                        )],
                    )
                    .await?;

                tracing::info!(
                    order_id = %order.order_id,
                    call_id = %call.call_id,
                    "originate accepted, call bridged via dialplan"
                );
                Ok(OrderSnapshot::from(&order).with_call(Some(CallSnapshot::from(&call))))
            }
            Err(error) => self.fail_call(order, call, &error).await,
        }
    }

    /// Order snapshot with the linked call nested, straight from the store.
    pub async fn order_status(&self, order_id: Uuid) -> Result<OrderSnapshot, ApiError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(ApiError::NotFound("order"))?;
        let call = match order.call_id() {
            Some(call_id) => self
                .store
                .get_call(call_id)
                .await?
                .map(|call| CallSnapshot::from(&call)),
            None => None,
        };
        Ok(OrderSnapshot::from(&order).with_call(call))
    }

    pub async fn call_status(&self, call_id: Uuid) -> Result<CallSnapshot, ApiError> {
        let call = self
            .store
            .get_call(call_id)
            .await?
            .ok_or(ApiError::NotFound("call"))?;
        Ok(CallSnapshot::from(&call))
    }

    /// Event log for an order, oldest first.
    pub async fn order_events(&self, order_id: Uuid) -> Result<Vec<EventRecord>, ApiError> {
        if self.store.get_order(order_id).await?.is_none() {
            return Err(ApiError::NotFound("order"));
        }
        Ok(self.store.events_for_order(order_id).await?)
    }

    fn originate_for(&self, order: &OrderAggregate) -> Originate {
        let user_token = if order.user_token.is_empty() {
            order.order_id.to_string()
        } else {
            order.user_token.clone()
        };
        Originate {
            channel: format!("SIP/{}/{}", order.trunk_name, order.number_a),
            context: DIALPLAN_CONTEXT.to_string(),
            exten: "s".to_string(),
            priority: 1,
            caller_id: order.number_a.clone(),
            timeout_ms: ORIGINATE_TIMEOUT_MS,
            variables: vec![
                ("ARG1".to_string(), order.number_a.clone()),
                ("ARG2".to_string(), order.number_b.clone()),
                ("USER_TOKEN".to_string(), user_token),
            ],
        }
    }

    async fn fail_order(
        &self,
        mut order: OrderAggregate,
        error: &AmiError,
    ) -> Result<OrderSnapshot, ApiError> {
        let message = error.to_string();
        order.transition_to(OrderState::Failed, None, Some(&message));
        self.store
            .save_order(
                &order,
                &[EventDraft::for_order(
                    &order,
                    order_event_name(OrderState::Failed),
                )],
            )
            .await?;
        tracing::error!(order_id = %order.order_id, %error, "order failed before call creation");
        Err(ApiError::from_ami(error, &order.state().to_string()))
    }

    async fn fail_call(
        &self,
        mut order: OrderAggregate,
        mut call: CallAggregate,
        error: &AmiError,
    ) -> Result<OrderSnapshot, ApiError> {
        let message = error.to_string();
        // A PBX rejection is a leg-A failure; everything else (timeout,
        // transport) is a system failure.
        let call_target = match error {
            AmiError::ActionRejected { .. } => CallState::FailedA,
            _ => CallState::FailedSystem,
        };
        call.transition_to(call_target, None, Some(&message));
        self.store
            .save_call(
                &call,
                &[EventDraft::for_call(&call, call_event_name(call_target))],
            )
            .await?;
        self.index.forget_call(call.call_id);

        order.transition_to(OrderState::Failed, None, Some(&message));
        self.store
            .save_order(
                &order,
                &[EventDraft::for_order(
                    &order,
                    order_event_name(OrderState::Failed),
                )],
            )
            .await?;

        tracing::error!(
            order_id = %order.order_id,
            call_id = %call.call_id,
            %error,
            "originate failed"
        );
        Err(ApiError::from_ami(error, &order.state().to_string()))
    }
}
