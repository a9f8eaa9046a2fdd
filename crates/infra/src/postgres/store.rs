//! The production outbox store on sqlx/Postgres.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use postbox_core::{
    ConsumerGroup, DeliveryFilter, ErrorId, MsgId, NewMessage, OutcomeCode, PartitionKey, TaskId,
    WorkItem,
};
use postbox_engine::{
    ClaimedDelivery, DeliveryOutcome, MaterializeReport, MessageStore, StoreError, WorkStore,
};

use crate::partition::{PartitionManager, PartitionedTable};
use super::schema::PgPartitionManager;
use super::map_sqlx_error;

/// Postgres implementation of the engine's storage ports.
///
/// Shares one connection pool between the store and its partition
/// manager; cloning is cheap.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    partitions: PgPartitionManager,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        let partitions = PgPartitionManager::new(pool.clone());
        Self { pool, partitions }
    }

    pub fn partition_manager(&self) -> &PgPartitionManager {
        &self.partitions
    }

    /// Advisory-lock key for one (group, tenant) materializer. Derived
    /// from a content hash so every node computes the same key.
    fn materializer_lock_key(group: &ConsumerGroup, filter: &DeliveryFilter) -> i64 {
        let digest = Sha256::digest(format!("{}/{}", group, filter.tenant_id).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }

    fn work_item_from_row(row: &PgRow) -> Result<(WorkItem, String), StoreError> {
        let decode = |e: sqlx::Error| map_sqlx_error("decode work_item", e);

        let outcome_raw: i32 = row.try_get("outcome_code").map_err(decode)?;
        let outcome_code = OutcomeCode::from_code(outcome_raw)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let consumer_group: String = row.try_get("consumer_group").map_err(decode)?;
        let consumer_group = ConsumerGroup::new(consumer_group)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let error_ref: Option<String> = row.try_get("error_ref").map_err(decode)?;

        let item = WorkItem {
            task_id: TaskId(row.try_get("task_id").map_err(decode)?),
            consumer_group,
            tenant_id: row.try_get::<Uuid, _>("tenant_id").map_err(decode)?.into(),
            msg_id: MsgId(row.try_get("msg_id").map_err(decode)?),
            part: row.try_get("part").map_err(decode)?,
            payload_id: row.try_get::<Uuid, _>("payload_id").map_err(decode)?.into(),
            msg_created_at: row.try_get("msg_created_at").map_err(decode)?,
            lease_token: postbox_core::LeaseToken::from_uuid(
                row.try_get("lease_token").map_err(decode)?,
            ),
            lease_expires_at: row.try_get("lease_expires_at").map_err(decode)?,
            delivery_id: row.try_get("delivery_id").map_err(decode)?,
            attempt_count: row.try_get("attempt_count").map_err(decode)?,
            outcome_code,
            outcome_message: row.try_get("outcome_message").map_err(decode)?,
            outcome_created_at: row.try_get("outcome_created_at").map_err(decode)?,
            error_ref: error_ref.map(ErrorId::from_stored),
            created_at: row.try_get("created_at").map_err(decode)?,
        };
        let payload_type: String = row.try_get("payload_type").map_err(decode)?;
        Ok((item, payload_type))
    }
}

#[async_trait]
impl MessageStore for PgOutboxStore {
    #[instrument(skip(self, messages), fields(count = messages.len()), err)]
    async fn save(&self, messages: &[NewMessage]) -> Result<usize, StoreError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let keys: HashSet<PartitionKey> =
            messages.iter().map(NewMessage::partition_key).collect();
        let keys: Vec<PartitionKey> = keys.into_iter().collect();
        self.partitions
            .ensure_partitions(PartitionedTable::Message, &keys)
            .await?;

        let mut payload_ids = Vec::with_capacity(messages.len());
        let mut tenant_ids = Vec::with_capacity(messages.len());
        let mut parts = Vec::with_capacity(messages.len());
        let mut payload_types = Vec::with_capacity(messages.len());
        let mut payloads = Vec::with_capacity(messages.len());
        let mut payload_sizes = Vec::with_capacity(messages.len());
        let mut created_ats = Vec::with_capacity(messages.len());
        for msg in messages {
            payload_ids.push(*msg.payload_id.as_uuid());
            tenant_ids.push(*msg.tenant_id.as_uuid());
            parts.push(msg.part.clone());
            payload_types.push(msg.payload_type.clone());
            payloads.push(msg.payload.clone());
            payload_sizes.push(msg.payload_size());
            created_ats.push(msg.created_at);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO message
                (payload_id, tenant_id, part, payload_type, payload, payload_size, created_at)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::text[], $4::text[],
                $5::jsonb[], $6::bigint[], $7::timestamptz[]
            )
            "#,
        )
        .bind(&payload_ids)
        .bind(&tenant_ids)
        .bind(&parts)
        .bind(&payload_types)
        .bind(&payloads)
        .bind(&payload_sizes)
        .bind(&created_ats)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl WorkStore for PgOutboxStore {
    #[instrument(
        skip(self, filter),
        fields(group = %group, tenant_id = %filter.tenant_id, part = %filter.part),
        err
    )]
    async fn materialize_new_work(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
    ) -> Result<MaterializeReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        // One materializer per (group, tenant) at a time; released on
        // commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(Self::materializer_lock_key(group, filter))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        sqlx::query(
            r#"
            INSERT INTO group_offset (consumer_group, tenant_id)
            VALUES ($1, $2)
            ON CONFLICT (consumer_group, tenant_id) DO NOTHING
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("materialize", e))?;

        let watermark: i64 = sqlx::query_scalar(
            "SELECT watermark FROM group_offset WHERE consumer_group = $1 AND tenant_id = $2",
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("materialize", e))?;

        let inserted: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO work_item
                (consumer_group, tenant_id, msg_id, part, payload_id, payload_type, msg_created_at)
            SELECT $1, m.tenant_id, m.msg_id, m.part, m.payload_id, m.payload_type, m.created_at
            FROM message m
            WHERE m.tenant_id = $2
              AND m.part = $3
              AND m.created_at >= $4
              AND m.created_at <= $5
              AND m.msg_id > $6
              AND ($7::text IS NULL OR m.payload_type = $7)
            ORDER BY m.msg_id
            LIMIT $8
            ON CONFLICT (consumer_group, tenant_id, msg_id) DO NOTHING
            RETURNING msg_id
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .bind(&filter.part)
        .bind(filter.from_date)
        .bind(filter.now_date)
        .bind(watermark)
        .bind(filter.payload_type.as_deref())
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("materialize", e))?;

        let new_watermark = inserted.iter().copied().max().unwrap_or(watermark);
        if new_watermark > watermark {
            sqlx::query(
                r#"
                UPDATE group_offset SET watermark = $3, updated_at = now()
                WHERE consumer_group = $1 AND tenant_id = $2
                "#,
            )
            .bind(group.as_str())
            .bind(filter.tenant_id.as_uuid())
            .bind(new_watermark)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        debug!(inserted = inserted.len(), watermark = new_watermark, "materialized");
        Ok(MaterializeReport {
            inserted: inserted.len(),
            watermark: MsgId(new_watermark),
        })
    }

    #[instrument(
        skip(self, filter),
        fields(group = %group, tenant_id = %filter.tenant_id, transact_id = %filter.transact_id),
        err
    )]
    async fn claim_batch(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedDelivery>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE work_item w SET
                outcome_code = $9,
                lease_token = $10,
                lease_expires_at = now() + make_interval(secs => $11)
            WHERE w.task_id IN (
                SELECT task_id FROM work_item
                WHERE consumer_group = $1
                  AND tenant_id = $2
                  AND part = $3
                  AND msg_created_at >= $4
                  AND msg_created_at <= $5
                  AND outcome_code = ANY($6)
                  AND lease_expires_at <= now()
                  AND ($7::text IS NULL OR payload_type = $7)
                ORDER BY task_id
                LIMIT $8
                FOR UPDATE SKIP LOCKED
            )
            RETURNING w.*
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .bind(&filter.part)
        .bind(filter.from_date)
        .bind(filter.now_date)
        .bind(OutcomeCode::claim_eligible_codes())
        .bind(filter.payload_type.as_deref())
        .bind(batch_size as i64)
        .bind(OutcomeCode::Processing.code())
        .bind(filter.transact_id.as_uuid())
        .bind(lease_duration.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(Self::work_item_from_row(row)?);
        }
        items.sort_by_key(|(item, _)| item.task_id);

        if items.is_empty() {
            return Ok(Vec::new());
        }

        let msg_ids: Vec<i64> = items.iter().map(|(item, _)| item.msg_id.as_i64()).collect();
        let payload_rows = sqlx::query(
            r#"
            SELECT msg_id, payload FROM message
            WHERE tenant_id = $1
              AND part = $2
              AND created_at >= $3
              AND created_at <= $4
              AND msg_id = ANY($5)
            "#,
        )
        .bind(filter.tenant_id.as_uuid())
        .bind(&filter.part)
        .bind(filter.from_date)
        .bind(filter.now_date)
        .bind(&msg_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut payloads: HashMap<i64, JsonValue> = HashMap::with_capacity(payload_rows.len());
        for row in payload_rows {
            let msg_id: i64 = row
                .try_get("msg_id")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            let payload: JsonValue = row
                .try_get("payload")
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            payloads.insert(msg_id, payload);
        }

        let claimed = items
            .into_iter()
            .map(|(work_item, payload_type)| {
                let payload = payloads
                    .get(&work_item.msg_id.as_i64())
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                ClaimedDelivery {
                    work_item,
                    payload_type,
                    payload,
                }
            })
            .collect();
        Ok(claimed)
    }

    #[instrument(
        skip(self, filter),
        fields(group = %group, transact_id = %filter.transact_id),
        err
    )]
    async fn extend_lease(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        lease_duration: Duration,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_item SET
                lease_expires_at = now() + make_interval(secs => $7)
            WHERE consumer_group = $1
              AND tenant_id = $2
              AND part = $3
              AND msg_created_at >= $4
              AND msg_created_at <= $5
              AND lease_token = $6
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .bind(&filter.part)
        .bind(filter.from_date)
        .bind(filter.now_date)
        .bind(filter.transact_id.as_uuid())
        .bind(lease_duration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lease", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, filter, outcomes),
        fields(group = %group, transact_id = %filter.transact_id, count = outcomes.len()),
        err
    )]
    async fn finalize(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
        outcomes: &[DeliveryOutcome],
    ) -> Result<u64, StoreError> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let keys: HashSet<PartitionKey> = outcomes
            .iter()
            .map(|o| PartitionKey {
                tenant_id: filter.tenant_id,
                part: filter.part.clone(),
                day: o.msg_created_at.date_naive(),
            })
            .collect();
        let keys: Vec<PartitionKey> = keys.into_iter().collect();
        self.partitions
            .ensure_partitions(PartitionedTable::DeliveryLog, &keys)
            .await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;

        // Dedup error records first. First writer per id wins; rows that
        // were fenced out below still leave the record in place.
        let mut error_ids: Vec<String> = Vec::new();
        let mut error_types: Vec<String> = Vec::new();
        let mut error_texts: Vec<String> = Vec::new();
        let mut seen: HashSet<ErrorId> = HashSet::new();
        let mut error_refs: Vec<Option<String>> = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match &outcome.failure {
                Some(failure) => {
                    let id = ErrorId::from_failure_text(&failure.error_text);
                    if seen.insert(id.clone()) {
                        error_ids.push(id.as_str().to_string());
                        error_types.push(failure.error_type.clone());
                        error_texts.push(failure.error_text.clone());
                    }
                    error_refs.push(Some(id.as_str().to_string()));
                }
                None => error_refs.push(None),
            }
        }

        if !error_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO error_record (error_id, error_type, error_message)
                SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])
                ON CONFLICT (error_id) DO NOTHING
                "#,
            )
            .bind(&error_ids)
            .bind(&error_types)
            .bind(&error_texts)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;
        }

        let mut task_ids: Vec<i64> = Vec::with_capacity(outcomes.len());
        let mut codes: Vec<i32> = Vec::with_capacity(outcomes.len());
        let mut messages: Vec<Option<String>> = Vec::with_capacity(outcomes.len());
        let mut postpones: Vec<f64> = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            task_ids.push(outcome.task_id.as_i64());
            codes.push(outcome.outcome.code());
            messages.push(outcome.message.clone());
            postpones.push(outcome.postpone.as_secs_f64());
        }

        // Token-fenced flush: update the work item and append the log row
        // in one statement. A stale token matches nothing, so postponed
        // attempts keep `Postponed` from consuming an attempt.
        let result = sqlx::query(
            r#"
            WITH staged AS (
                SELECT * FROM UNNEST(
                    $7::bigint[], $8::int[], $9::text[], $10::float8[], $11::text[]
                ) AS s(task_id, outcome_code, outcome_message, postpone_secs, error_ref)
            ),
            updated AS (
                UPDATE work_item w SET
                    attempt_count = w.attempt_count
                        + CASE WHEN s.outcome_code = $12 THEN 0 ELSE 1 END,
                    outcome_code = s.outcome_code,
                    outcome_message = s.outcome_message,
                    outcome_created_at = now(),
                    lease_expires_at = now() + make_interval(secs => s.postpone_secs),
                    error_ref = s.error_ref,
                    delivery_id = gen_random_uuid()
                FROM staged s
                WHERE w.task_id = s.task_id
                  AND w.consumer_group = $1
                  AND w.tenant_id = $2
                  AND w.part = $3
                  AND w.msg_created_at >= $4
                  AND w.msg_created_at <= $5
                  AND w.lease_token = $6
                RETURNING w.*
            )
            INSERT INTO delivery_log
                (delivery_id, task_id, consumer_group, tenant_id, msg_id, part, payload_id,
                 msg_created_at, lease_token, attempt_count, outcome_code, outcome_message,
                 outcome_created_at, error_ref)
            SELECT delivery_id, task_id, consumer_group, tenant_id, msg_id, part, payload_id,
                   msg_created_at, lease_token, attempt_count, outcome_code, outcome_message,
                   outcome_created_at, error_ref
            FROM updated
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .bind(&filter.part)
        .bind(filter.from_date)
        .bind(filter.now_date)
        .bind(filter.transact_id.as_uuid())
        .bind(&task_ids)
        .bind(&codes)
        .bind(&messages)
        .bind(&postpones)
        .bind(&error_refs)
        .bind(OutcomeCode::Postponed.code())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("finalize", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("finalize", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, filter), fields(group = %group, tenant_id = %filter.tenant_id), err)]
    async fn group_watermark(
        &self,
        group: &ConsumerGroup,
        filter: &DeliveryFilter,
    ) -> Result<Option<(MsgId, DateTime<Utc>)>, StoreError> {
        let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT watermark, updated_at FROM group_offset
            WHERE consumer_group = $1 AND tenant_id = $2
            "#,
        )
        .bind(group.as_str())
        .bind(filter.tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("group_watermark", e))?;

        Ok(row.map(|(watermark, updated_at)| (MsgId(watermark), updated_at)))
    }
}
