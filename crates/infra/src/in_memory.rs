//! In-memory outbox store for tests and local development.
//!
//! Implements the full delivery semantics — watermark materialization,
//! lease claims with expiry, token-fenced renew/finalize, error dedup —
//! so engine behaviour can be exercised without a database. The single
//! interior mutex plays the role of the materializer's advisory lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use postbox_core::{
    ConsumerGroup, DeliveryFilter, DeliveryLogEntry, ErrorId, ErrorRecord, GroupOffset, Message,
    MsgId, NewMessage, OutcomeCode, TaskId, TenantId, WorkItem,
};
use postbox_engine::{
    ClaimedDelivery, DeliveryOutcome, MaterializeReport, MessageStore, StoreError, WorkStore,
};

#[derive(Debug, Clone)]
struct StoredWorkItem {
    item: WorkItem,
    payload_type: String,
}

#[derive(Debug, Default)]
struct State {
    next_msg_id: i64,
    next_task_id: i64,
    messages: Vec<Message>,
    work_items: BTreeMap<TaskId, StoredWorkItem>,
    offsets: HashMap<(ConsumerGroup, TenantId), GroupOffset>,
    delivery_log: Vec<DeliveryLogEntry>,
    errors: HashMap<ErrorId, ErrorRecord>,
}

/// In-memory store implementing the engine port traits.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<State>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all work items, in task-id order.
    pub fn work_items(&self) -> Vec<WorkItem> {
        let state = self.state.lock().unwrap();
        state.work_items.values().map(|s| s.item.clone()).collect()
    }

    /// Snapshot of the delivery log, in finalize order.
    pub fn delivery_log(&self) -> Vec<DeliveryLogEntry> {
        self.state.lock().unwrap().delivery_log.clone()
    }

    /// Snapshot of the deduplicated error records.
    pub fn error_records(&self) -> Vec<ErrorRecord> {
        let state = self.state.lock().unwrap();
        state.errors.values().cloned().collect()
    }

    /// Snapshot of the message log.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    /// Force every lease into the past, simulating a claimer that
    /// crashed and let its leases lapse. Test/dev helper.
    pub fn expire_all_leases(&self) {
        let mut state = self.state.lock().unwrap();
        let past = Utc::now() - chrono::Duration::seconds(1);
        for stored in state.work_items.values_mut() {
            stored.item.lease_expires_at = past;
        }
    }

    fn in_scope(item: &WorkItem, group: &ConsumerGroup, filter: &DeliveryFilter) -> bool {
        item.consumer_group == *group
            && item.tenant_id == filter.tenant_id
            && item.part == filter.part
            && item.msg_created_at >= filter.from_date
            && item.msg_created_at <= filter.now_date
    }
}

#[async_trait]
impl MessageStore for InMemoryOutboxStore {
    async fn save(&self, messages: &[NewMessage]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        for new in messages {
            state.next_msg_id += 1;
            let msg_id = MsgId(state.next_msg_id);
            state.messages.push(Message {
                msg_id,
                payload_id: new.payload_id,
                tenant_id: new.tenant_id,
                part: new.part.clone(),
                payload_type: new.payload_type.clone(),
                payload: new.payload.clone(),
                payload_size: new.payload_size(),
                created_at: new.created_at,
            });
        }
        Ok(messages.len())
    }
}

#[async_trait]
impl WorkStore for InMemoryOutboxStore {
    async fn materialize_new_work(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
    ) -> Result<MaterializeReport, StoreError> {
        // The state mutex serializes concurrent materializers the way the
        // Postgres store's advisory lock does.
        let mut state = self.state.lock().unwrap();

        let watermark = state
            .offsets
            .entry((group.clone(), filter.tenant_id))
            .or_insert_with(|| GroupOffset::initial(group.clone(), filter.tenant_id))
            .watermark;

        let mut visible: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| {
                m.msg_id > watermark
                    && m.tenant_id == filter.tenant_id
                    && m.part == filter.part
                    && m.created_at >= filter.from_date
                    && m.created_at <= filter.now_date
                    && filter
                        .payload_type
                        .as_ref()
                        .is_none_or(|t| *t == m.payload_type)
            })
            .cloned()
            .collect();
        visible.sort_by_key(|m| m.msg_id);
        visible.truncate(batch_size);

        if visible.is_empty() {
            return Ok(MaterializeReport {
                inserted: 0,
                watermark,
            });
        }

        let now = Utc::now();
        let mut max_id = watermark;
        let inserted = visible.len();
        for msg in visible {
            state.next_task_id += 1;
            let task_id = TaskId(state.next_task_id);
            state.work_items.insert(
                task_id,
                StoredWorkItem {
                    item: WorkItem {
                        task_id,
                        consumer_group: group.clone(),
                        tenant_id: msg.tenant_id,
                        msg_id: msg.msg_id,
                        part: msg.part.clone(),
                        payload_id: msg.payload_id,
                        msg_created_at: msg.created_at,
                        lease_token: postbox_core::LeaseToken::new(),
                        lease_expires_at: now,
                        delivery_id: None,
                        attempt_count: 0,
                        outcome_code: OutcomeCode::Pending,
                        outcome_message: None,
                        outcome_created_at: None,
                        error_ref: None,
                        created_at: now,
                    },
                    payload_type: msg.payload_type.clone(),
                },
            );
            max_id = max_id.max(msg.msg_id);
        }

        if let Some(offset) = state.offsets.get_mut(&(group.clone(), filter.tenant_id)) {
            offset.watermark = max_id;
            offset.updated_at = now;
        }

        Ok(MaterializeReport {
            inserted,
            watermark: max_id,
        })
    }

    async fn claim_batch(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedDelivery>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let mut eligible: Vec<TaskId> = state
            .work_items
            .values()
            .filter(|stored| {
                Self::in_scope(&stored.item, group, filter)
                    && stored.item.outcome_code.is_claim_eligible()
                    && stored.item.lease_expires_at <= now
                    && filter
                        .payload_type
                        .as_ref()
                        .is_none_or(|t| *t == stored.payload_type)
            })
            .map(|stored| stored.item.task_id)
            .collect();
        eligible.sort();
        eligible.truncate(batch_size);

        let payloads: HashMap<MsgId, serde_json::Value> = state
            .messages
            .iter()
            .map(|m| (m.msg_id, m.payload.clone()))
            .collect();

        let mut claimed = Vec::with_capacity(eligible.len());
        for task_id in eligible {
            if let Some(stored) = state.work_items.get_mut(&task_id) {
                stored.item.outcome_code = OutcomeCode::Processing;
                stored.item.lease_token = filter.transact_id;
                stored.item.lease_expires_at = now + lease;
                claimed.push(ClaimedDelivery {
                    work_item: stored.item.clone(),
                    payload_type: stored.payload_type.clone(),
                    payload: payloads
                        .get(&stored.item.msg_id)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                });
            }
        }

        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        lease_duration: Duration,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let mut extended = 0;
        for stored in state.work_items.values_mut() {
            if Self::in_scope(&stored.item, group, filter)
                && stored.item.lease_token == filter.transact_id
            {
                stored.item.lease_expires_at = now + lease;
                extended += 1;
            }
        }
        Ok(extended)
    }

    async fn finalize(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        outcomes: &[DeliveryOutcome],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let mut finalized = 0;
        for outcome in outcomes {
            // Dedup errors first so the record exists even if every row
            // referencing it was fenced out meanwhile.
            let error_ref = outcome.failure.as_ref().map(|failure| {
                let record = ErrorRecord::new(&failure.error_type, &failure.error_text);
                let id = record.error_id.clone();
                state.errors.entry(id.clone()).or_insert(record);
                id
            });

            let Some(stored) = state.work_items.get_mut(&outcome.task_id) else {
                continue;
            };
            // Token fencing: a stale transact_id must not touch the row.
            if !Self::in_scope(&stored.item, group, filter)
                || stored.item.lease_token != filter.transact_id
            {
                continue;
            }

            let postpone = chrono::Duration::from_std(outcome.postpone).unwrap_or_default();
            let delivery_id = Uuid::now_v7();

            if !outcome.outcome.is_postponed() {
                stored.item.attempt_count += 1;
            }
            stored.item.outcome_code = outcome.outcome;
            stored.item.outcome_message = outcome.message.clone();
            stored.item.outcome_created_at = Some(now);
            stored.item.lease_expires_at = now + postpone;
            stored.item.error_ref = error_ref.clone();
            stored.item.delivery_id = Some(delivery_id);

            // Snapshot into a local first; `stored` borrows the same
            // state as `delivery_log`.
            let entry = DeliveryLogEntry {
                delivery_id,
                task_id: stored.item.task_id,
                consumer_group: stored.item.consumer_group.clone(),
                tenant_id: stored.item.tenant_id,
                msg_id: stored.item.msg_id,
                part: stored.item.part.clone(),
                payload_id: stored.item.payload_id,
                msg_created_at: stored.item.msg_created_at,
                lease_token: stored.item.lease_token,
                attempt_count: stored.item.attempt_count,
                outcome_code: outcome.outcome,
                outcome_message: outcome.message.clone(),
                outcome_created_at: now,
                error_ref,
            };
            state.delivery_log.push(entry);
            finalized += 1;
        }

        Ok(finalized)
    }

    async fn group_watermark(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
    ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .offsets
            .get(&(group.clone(), filter.tenant_id))
            .map(|o| (o.watermark, o.updated_at)))
    }
}
