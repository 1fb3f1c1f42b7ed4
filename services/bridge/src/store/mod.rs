//! Persistence: orders, calls, and the append-only event log.
//!
//! The store is the sole writer of all three tables. Saving an aggregate
//! together with its event drafts is atomic: no reader may observe the new
//! state without its events or the events without the state.

use async_trait::async_trait;
use uuid::Uuid;

use models::{CallAggregate, EventDraft, EventRecord, OrderAggregate};

use crate::config::AsteriskConfigRow;

pub mod memory;
pub mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert the order row and append its event rows in one atomic unit.
    async fn save_order(
        &self,
        order: &OrderAggregate,
        events: &[EventDraft],
    ) -> anyhow::Result<()>;

    /// Upsert the call row and append its event rows in one atomic unit.
    async fn save_call(&self, call: &CallAggregate, events: &[EventDraft]) -> anyhow::Result<()>;

    async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<OrderAggregate>>;

    async fn get_call(&self, call_id: Uuid) -> anyhow::Result<Option<CallAggregate>>;

    /// Event rows for an order (both entities), oldest first.
    async fn events_for_order(&self, order_id: Uuid) -> anyhow::Result<Vec<EventRecord>>;

    /// The `asterisk_config` row with the given name, if any.
    async fn ami_config(&self, name: &str) -> anyhow::Result<Option<AsteriskConfigRow>>;
}
