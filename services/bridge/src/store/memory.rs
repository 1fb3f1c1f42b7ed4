//! In-memory store used by the scenario tests.
//!
//! Same atomicity contract as the Postgres store: one mutex guards the save
//! of an aggregate and its events, so readers never see one without the
//! other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use models::{CallAggregate, EventDraft, EventRecord, OrderAggregate};

use crate::config::AsteriskConfigRow;

use super::Store;

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, OrderAggregate>,
    calls: HashMap<Uuid, CallAggregate>,
    events: Vec<EventRecord>,
    seq: i64,
    asterisk: HashMap<String, AsteriskConfigRow>,
}

impl Inner {
    fn append_events(&mut self, drafts: &[EventDraft]) {
        for draft in drafts {
            self.seq += 1;
            self.events.push(EventRecord {
                event_id: Uuid::new_v4(),
                seq: self.seq,
                event_type: draft.event_type.clone(),
                entity_type: draft.entity_type,
                entity_id: draft.entity_id,
                order_id: draft.order_id,
                call_id: draft.call_id,
                state: draft.state.clone(),
                previous_state: draft.previous_state.clone(),
                metadata: draft.metadata.clone(),
                error_message: draft.error_message.clone(),
                processed: false,
                created_at: Utc::now(),
            });
        }
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_ami_config(&self, name: &str, row: AsteriskConfigRow) {
        self.inner
            .lock()
            .await
            .asterisk
            .insert(name.to_string(), row);
    }

    /// Every event row, oldest first, regardless of entity.
    pub async fn all_events(&self) -> Vec<EventRecord> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn save_order(
        &self,
        order: &OrderAggregate,
        events: &[EventDraft],
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.orders.insert(order.order_id, order.clone());
        inner.append_events(events);
        Ok(())
    }

    async fn save_call(&self, call: &CallAggregate, events: &[EventDraft]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.insert(call.call_id, call.clone());
        inner.append_events(events);
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> anyhow::Result<Option<OrderAggregate>> {
        Ok(self.inner.lock().await.orders.get(&order_id).cloned())
    }

    async fn get_call(&self, call_id: Uuid) -> anyhow::Result<Option<CallAggregate>> {
        Ok(self.inner.lock().await.calls.get(&call_id).cloned())
    }

    async fn events_for_order(&self, order_id: Uuid) -> anyhow::Result<Vec<EventRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.order_id == Some(order_id))
            .cloned()
            .collect())
    }

    async fn ami_config(&self, name: &str) -> anyhow::Result<Option<AsteriskConfigRow>> {
        Ok(self.inner.lock().await.asterisk.get(name).cloned())
    }
}
