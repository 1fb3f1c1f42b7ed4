//! Postgres-backed store.
//!
//! Aggregate state plus its transition bookkeeping live as JSONB columns on
//! the entity row; every save upserts the row and appends the event rows in
//! the same transaction. `events.id` (bigserial) is the crash-safe total
//! order for the log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Pool, Postgres};
use uuid::Uuid;

use models::machine::{ErrorRecord, Metadata, TransitionRecord};
use models::{
    CallAggregate, CallState, EntityType, EventDraft, EventRecord, OrderAggregate, OrderState,
};

use crate::config::AsteriskConfigRow;

use super::Store;

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_order(
        &self,
        order: &OrderAggregate,
        events: &[EventDraft],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
                INSERT INTO orders (
                    order_id, user_token, number_a, number_b, caller_id,
                    trunk_name, call_id, state, state_history, state_timestamps,
                    error_log, metadata, is_final, created_at, updated_at,
                    completed_at, failed_at, cancelled_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (order_id) DO UPDATE SET
                    call_id = EXCLUDED.call_id,
                    state = EXCLUDED.state,
                    state_history = EXCLUDED.state_history,
                    state_timestamps = EXCLUDED.state_timestamps,
                    error_log = EXCLUDED.error_log,
                    metadata = EXCLUDED.metadata,
                    is_final = EXCLUDED.is_final,
                    updated_at = EXCLUDED.updated_at,
                    completed_at = EXCLUDED.completed_at,
                    failed_at = EXCLUDED.failed_at,
                    cancelled_at = EXCLUDED.cancelled_at
            "#,
        )
        .bind(order.order_id)
        .bind(&order.user_token)
        .bind(&order.number_a)
        .bind(&order.number_b)
        .bind(&order.caller_id)
        .bind(&order.trunk_name)
        .bind(order.call_id())
        .bind(order.state().to_string())
        .bind(serde_json::to_value(order.state_history())?)
        .bind(serde_json::to_value(order.state_timestamps())?)
        .bind(serde_json::to_value(order.error_log())?)
        .bind(serde_json::to_value(order.metadata())?)
        .bind(order.is_final())
        .bind(order.created_at())
        .bind(order.updated_at())
        .bind(order.completed_at)
        .bind(order.failed_at)
        .bind(order.cancelled_at)
        .execute(&mut *tx)
        .await?;

        for event in events {
            insert_event(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_call(&self, call: &CallAggregate, events: &[EventDraft]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
                INSERT INTO calls (
                    call_id, order_id, number_a, number_b, caller_id,
                    trunk_name, channel_a_id, channel_b_id, state,
                    state_history, state_timestamps, error_log, metadata,
                    is_final, created_at, updated_at, started_at, answered_at,
                    bridged_at, completed_at, failed_at, duration_seconds
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                        $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
                ON CONFLICT (call_id) DO UPDATE SET
                    channel_a_id = EXCLUDED.channel_a_id,
                    channel_b_id = EXCLUDED.channel_b_id,
                    state = EXCLUDED.state,
                    state_history = EXCLUDED.state_history,
                    state_timestamps = EXCLUDED.state_timestamps,
                    error_log = EXCLUDED.error_log,
                    metadata = EXCLUDED.metadata,
                    is_final = EXCLUDED.is_final,
                    updated_at = EXCLUDED.updated_at,
                    started_at = EXCLUDED.started_at,
                    answered_at = EXCLUDED.answered_at,
                    bridged_at = EXCLUDED.bridged_at,
                    completed_at = EXCLUDED.completed_at,
                    failed_at = EXCLUDED.failed_at,
                    duration_seconds = EXCLUDED.duration_seconds
            "#,
        )
        .bind(call.call_id)
        .bind(call.order_id)
        .bind(&call.number_a)
        .bind(&call.number_b)
        .bind(&call.caller_id)
        .bind(&call.trunk_name)
        .bind(call.channel_a_id())
        .bind(call.channel_b_id())
        .bind(call.state().to_string())
        .bind(serde_json::to_value(call.state_history())?)
        .bind(serde_json::to_value(call.state_timestamps())?)
        .bind(serde_json::to_value(call.error_log())?)
        .bind(serde_json::to_value(call.metadata())?)
        .bind(call.is_final())
        .bind(call.created_at())
        .bind(call.updated_at())
        .bind(call.started_at)
        .bind(call.answered_at)
        .bind(call.bridged_at)
        .bind(call.completed_at)
        .bind(call.failed_at)
        .bind(call.duration_seconds)
        .execute(&mut *tx)
        .await?;

        for event in events {
            insert_event(&mut *tx, event).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<OrderAggregate>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
                SELECT order_id, user_token, number_a, number_b, caller_id,
                       trunk_name, call_id, state, state_history,
                       state_timestamps, error_log, metadata,
                       completed_at, failed_at, cancelled_at
                FROM orders
                WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrderRow::into_aggregate).transpose()
    }

    async fn get_call(&self, call_id: Uuid) -> anyhow::Result<Option<CallAggregate>> {
        let row = sqlx::query_as::<_, CallRow>(
            r#"
                SELECT call_id, order_id, number_a, number_b, caller_id,
                       trunk_name, channel_a_id, channel_b_id, state,
                       state_history, state_timestamps, error_log, metadata,
                       started_at, answered_at, bridged_at, completed_at,
                       failed_at, duration_seconds
                FROM calls
                WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CallRow::into_aggregate).transpose()
    }

    async fn events_for_order(&self, order_id: Uuid) -> anyhow::Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
                SELECT id, event_id, event_type, entity_type, entity_id,
                       order_id, call_id, state, previous_state, metadata,
                       error_message, processed, created_at
                FROM events
                WHERE order_id = $1
                ORDER BY id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn ami_config(&self, name: &str) -> anyhow::Result<Option<AsteriskConfigRow>> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"SELECT host, port, username, secret FROM asterisk_config WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AsteriskConfigRow {
            host: row.host,
            port: row.port,
            username: row.username,
            secret: row.secret,
        }))
    }
}

async fn insert_event<'e, E: PgExecutor<'e>>(
    executor: E,
    event: &EventDraft,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
            INSERT INTO events (
                event_id, event_type, entity_type, entity_id, order_id,
                call_id, state, previous_state, metadata, error_message,
                processed, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&event.event_type)
    .bind(event.entity_type.as_str())
    .bind(event.entity_id)
    .bind(event.order_id)
    .bind(event.call_id)
    .bind(&event.state)
    .bind(&event.previous_state)
    .bind(serde_json::to_value(&event.metadata)?)
    .bind(&event.error_message)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: Uuid,
    user_token: String,
    number_a: String,
    number_b: String,
    caller_id: String,
    trunk_name: String,
    call_id: Option<Uuid>,
    state: String,
    state_history: serde_json::Value,
    state_timestamps: serde_json::Value,
    error_log: serde_json::Value,
    metadata: serde_json::Value,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_aggregate(self) -> anyhow::Result<OrderAggregate> {
        let state: OrderState = parse_state(&self.state)?;
        let state_history: Vec<OrderState> = serde_json::from_value(self.state_history)?;
        let state_timestamps: Vec<TransitionRecord> =
            serde_json::from_value(self.state_timestamps)?;
        let error_log: Vec<ErrorRecord> = serde_json::from_value(self.error_log)?;
        let metadata: Metadata = serde_json::from_value(self.metadata)?;

        Ok(OrderAggregate::rehydrate(
            self.order_id,
            self.user_token,
            self.number_a,
            self.number_b,
            self.caller_id,
            self.trunk_name,
            self.call_id,
            state,
            state_history,
            state_timestamps,
            error_log,
            metadata,
            self.completed_at,
            self.failed_at,
            self.cancelled_at,
        ))
    }
}

#[derive(sqlx::FromRow)]
struct CallRow {
    call_id: Uuid,
    order_id: Uuid,
    number_a: String,
    number_b: String,
    caller_id: String,
    trunk_name: String,
    channel_a_id: Option<String>,
    channel_b_id: Option<String>,
    state: String,
    state_history: serde_json::Value,
    state_timestamps: serde_json::Value,
    error_log: serde_json::Value,
    metadata: serde_json::Value,
    started_at: Option<DateTime<Utc>>,
    answered_at: Option<DateTime<Utc>>,
    bridged_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
}

impl CallRow {
    fn into_aggregate(self) -> anyhow::Result<CallAggregate> {
        let state: CallState = parse_state(&self.state)?;
        let state_history: Vec<CallState> = serde_json::from_value(self.state_history)?;
        let state_timestamps: Vec<TransitionRecord> =
            serde_json::from_value(self.state_timestamps)?;
        let error_log: Vec<ErrorRecord> = serde_json::from_value(self.error_log)?;
        let metadata: Metadata = serde_json::from_value(self.metadata)?;

        Ok(CallAggregate::rehydrate(
            self.call_id,
            self.order_id,
            self.number_a,
            self.number_b,
            self.caller_id,
            self.trunk_name,
            self.channel_a_id,
            self.channel_b_id,
            state,
            state_history,
            state_timestamps,
            error_log,
            metadata,
            self.started_at,
            self.answered_at,
            self.bridged_at,
            self.completed_at,
            self.failed_at,
            self.duration_seconds,
        ))
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    event_id: Uuid,
    event_type: String,
    entity_type: String,
    entity_id: Uuid,
    order_id: Option<Uuid>,
    call_id: Option<Uuid>,
    state: Option<String>,
    previous_state: Option<String>,
    metadata: serde_json::Value,
    error_message: Option<String>,
    processed: bool,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_record(self) -> anyhow::Result<EventRecord> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type {:?}", self.entity_type))?;
        Ok(EventRecord {
            event_id: self.event_id,
            seq: self.id,
            event_type: self.event_type,
            entity_type,
            entity_id: self.entity_id,
            order_id: self.order_id,
            call_id: self.call_id,
            state: self.state,
            previous_state: self.previous_state,
            metadata: serde_json::from_value(self.metadata)?,
            error_message: self.error_message,
            processed: self.processed,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    host: Option<String>,
    port: Option<i32>,
    username: Option<String>,
    secret: Option<String>,
}

fn parse_state<S: serde::de::DeserializeOwned>(name: &str) -> anyhow::Result<S> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| anyhow::anyhow!("unknown persisted state {name:?}"))
}
