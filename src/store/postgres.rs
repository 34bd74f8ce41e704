//! PostgreSQL store implementation.
//!
//! Every racy transition is a single conditional statement so the database
//! decides each race: confirmation is one `UPDATE … WHERE` with the quota and
//! deadline in the predicate, the batch claim locks its row inside a CTE, and
//! the scheduler's window release flips the flag only when no one else has.
//! Rows-affected of zero means the predicate lost, never a silent success.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::{BatchClaim, Confirmation, RequestStore};
use crate::domain::blood::{BloodGroup, Urgency};
use crate::domain::donor::DonorId;
use crate::domain::request::{BloodRequest, RequestId, RequestStatus};
use crate::domain::token::{ResponseToken, TokenRecord};
use crate::error::{BloodlineError, Result};

/// PostgreSQL implementation of [`RequestStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish "no such request" from "predicate lost" after a
    /// zero-row conditional update.
    async fn closed_or_missing(&self, id: RequestId) -> BloodlineError {
        let exists = sqlx::query("SELECT 1 FROM blood_requests WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => BloodlineError::AlreadyClosed(id),
            Ok(None) => BloodlineError::RequestNotFound(id),
            Err(e) => BloodlineError::Other(anyhow!("Failed to look up request: {}", e)),
        }
    }

    /// Persist deadline expiry for one request before reading it, so reads
    /// never observe a stale `active` past its deadline.
    async fn expire_if_overdue(&self, id: RequestId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE blood_requests
            SET status = 'expired', batch_in_progress = FALSE
            WHERE id = $1
              AND status = 'active'
              AND required_by < $2
              AND confirmed_units < quantity_needed
            "#,
        )
        .bind(*id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to apply expiry: {}", e)))?;
        Ok(())
    }
}

fn row_to_request(row: &PgRow) -> Result<BloodRequest> {
    let take = |e: sqlx::Error| BloodlineError::Other(anyhow!("Malformed request row: {}", e));

    let status: String = row.try_get("status").map_err(take)?;
    let blood_group: String = row.try_get("blood_group").map_err(take)?;
    let urgency: String = row.try_get("urgency").map_err(take)?;
    let notified: Vec<Uuid> = row.try_get("notified_donor_ids").map_err(take)?;
    let queue: Vec<Uuid> = row.try_get("remaining_donor_queue").map_err(take)?;

    Ok(BloodRequest {
        id: RequestId::from(row.try_get::<Uuid, _>("id").map_err(take)?),
        hospital: row.try_get("hospital").map_err(take)?,
        blood_group: blood_group.parse::<BloodGroup>()?,
        quantity_needed: row.try_get::<i32, _>("quantity_needed").map_err(take)? as u32,
        urgency: urgency.parse::<Urgency>()?,
        required_by: row.try_get("required_by").map_err(take)?,
        status: status
            .parse::<RequestStatus>()
            .map_err(|e| BloodlineError::Other(anyhow!(e)))?,
        confirmed_units: row.try_get::<i32, _>("confirmed_units").map_err(take)? as u32,
        batch_size: row.try_get::<i32, _>("batch_size").map_err(take)? as u32,
        response_window_minutes: row
            .try_get::<i32, _>("response_window_minutes")
            .map_err(take)? as u32,
        notified_donor_ids: notified.into_iter().map(DonorId::from).collect(),
        remaining_donor_queue: queue.into_iter().map(DonorId::from).collect(),
        batch_sent_at: row.try_get("batch_sent_at").map_err(take)?,
        batch_in_progress: row.try_get("batch_in_progress").map_err(take)?,
        created_at: row.try_get("created_at").map_err(take)?,
    })
}

fn row_to_token(row: &PgRow) -> Result<TokenRecord> {
    let take = |e: sqlx::Error| BloodlineError::Other(anyhow!("Malformed token row: {}", e));
    Ok(TokenRecord {
        token: ResponseToken::from(row.try_get::<Uuid, _>("token").map_err(take)?),
        request_id: RequestId::from(row.try_get::<Uuid, _>("request_id").map_err(take)?),
        donor_id: DonorId::from(row.try_get::<Uuid, _>("donor_id").map_err(take)?),
        created_at: row.try_get("created_at").map_err(take)?,
        consumed_at: row.try_get("consumed_at").map_err(take)?,
    })
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn insert_request(&self, request: &BloodRequest) -> Result<()> {
        let notified: Vec<Uuid> = request.notified_donor_ids.iter().map(|d| d.0).collect();
        let queue: Vec<Uuid> = request.remaining_donor_queue.iter().map(|d| d.0).collect();

        sqlx::query(
            r#"
            INSERT INTO blood_requests (
                id, hospital, blood_group, quantity_needed, urgency, required_by,
                status, confirmed_units, batch_size, response_window_minutes,
                notified_donor_ids, remaining_donor_queue, batch_sent_at,
                batch_in_progress, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(*request.id)
        .bind(&request.hospital)
        .bind(request.blood_group.as_str())
        .bind(request.quantity_needed as i32)
        .bind(request.urgency.as_str())
        .bind(request.required_by)
        .bind(request.status.as_str())
        .bind(request.confirmed_units as i32)
        .bind(request.batch_size as i32)
        .bind(request.response_window_minutes as i32)
        .bind(&notified)
        .bind(&queue)
        .bind(request.batch_sent_at)
        .bind(request.batch_in_progress)
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to insert request: {}", e)))?;

        Ok(())
    }

    async fn fetch_request(&self, id: RequestId, now: DateTime<Utc>) -> Result<BloodRequest> {
        self.expire_if_overdue(id, now).await?;

        let row = sqlx::query("SELECT * FROM blood_requests WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BloodlineError::Other(anyhow!("Failed to fetch request: {}", e)))?
            .ok_or(BloodlineError::RequestNotFound(id))?;

        row_to_request(&row)
    }

    async fn claim_next_batch(
        &self,
        id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchClaim>> {
        // Row lock inside the CTE makes the slice-and-update one transition;
        // the batch_in_progress / status predicate is the idempotence guard.
        let row = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id, remaining_donor_queue[1:batch_size] AS batch
                FROM blood_requests
                WHERE id = $1
                  AND status = 'active'
                  AND batch_in_progress = FALSE
                  AND required_by >= $2
                  AND cardinality(remaining_donor_queue) > 0
                FOR UPDATE
            )
            UPDATE blood_requests r
            SET notified_donor_ids = r.notified_donor_ids || c.batch,
                remaining_donor_queue = r.remaining_donor_queue[cardinality(c.batch) + 1:],
                batch_sent_at = $2,
                batch_in_progress = TRUE
            FROM claimed c
            WHERE r.id = c.id
            RETURNING c.batch
            "#,
        )
        .bind(*id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to claim batch: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let batch: Vec<Uuid> = row
            .try_get("batch")
            .map_err(|e| BloodlineError::Other(anyhow!("Malformed claim row: {}", e)))?;

        Ok(Some(BatchClaim {
            donor_ids: batch.into_iter().map(DonorId::from).collect(),
            sent_at: now,
        }))
    }

    async fn release_elapsed_batch(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE blood_requests
            SET batch_in_progress = FALSE
            WHERE id = $1
              AND status = 'active'
              AND batch_in_progress = TRUE
              AND confirmed_units < quantity_needed
              AND batch_sent_at IS NOT NULL
              AND batch_sent_at + make_interval(mins => response_window_minutes) <= $2
            "#,
        )
        .bind(*id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to release batch: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_batch_requests(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM blood_requests
            WHERE status = 'active'
              AND batch_in_progress = TRUE
              AND confirmed_units < quantity_needed
              AND batch_sent_at IS NOT NULL
              AND batch_sent_at + make_interval(mins => response_window_minutes) <= $1
            ORDER BY batch_sent_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to scan due batches: {}", e)))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(RequestId::from)
                    .map_err(|e| BloodlineError::Other(anyhow!("Malformed id row: {}", e)))
            })
            .collect()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>> {
        let rows = sqlx::query(
            r#"
            UPDATE blood_requests
            SET status = 'expired', batch_in_progress = FALSE
            WHERE status = 'active'
              AND required_by < $1
              AND confirmed_units < quantity_needed
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to expire requests: {}", e)))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(RequestId::from)
                    .map_err(|e| BloodlineError::Other(anyhow!("Malformed id row: {}", e)))
            })
            .collect()
    }

    async fn confirm_donation(&self, id: RequestId, now: DateTime<Utc>) -> Result<Confirmation> {
        // One indivisible conditional read-modify-write: quota, deadline, and
        // the fulfillment transition all live in this single statement.
        let row = sqlx::query(
            r#"
            UPDATE blood_requests
            SET confirmed_units = confirmed_units + 1,
                status = CASE
                    WHEN confirmed_units + 1 >= quantity_needed THEN 'fulfilled'
                    ELSE status
                END
            WHERE id = $1
              AND status = 'active'
              AND confirmed_units < quantity_needed
              AND required_by >= $2
            RETURNING confirmed_units, status
            "#,
        )
        .bind(*id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to confirm donation: {}", e)))?;

        let Some(row) = row else {
            return Err(self.closed_or_missing(id).await);
        };

        let confirmed_units = row
            .try_get::<i32, _>("confirmed_units")
            .map_err(|e| BloodlineError::Other(anyhow!("Malformed confirm row: {}", e)))?
            as u32;
        let status: String = row
            .try_get("status")
            .map_err(|e| BloodlineError::Other(anyhow!("Malformed confirm row: {}", e)))?;

        Ok(Confirmation {
            confirmed_units,
            fulfilled: status == "fulfilled",
        })
    }

    async fn cancel_request(&self, id: RequestId, _now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE blood_requests
            SET status = 'cancelled', batch_in_progress = FALSE
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(*id)
        .execute(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to cancel request: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(id).await);
        }
        Ok(())
    }

    async fn insert_token(&self, record: &TokenRecord) -> Result<()> {
        // Primary key on token enforces the uniqueness invariant.
        sqlx::query(
            r#"
            INSERT INTO response_tokens (token, request_id, donor_id, created_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.token.0)
        .bind(*record.request_id)
        .bind(*record.donor_id)
        .bind(record.created_at)
        .bind(record.consumed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to insert token: {}", e)))?;
        Ok(())
    }

    async fn consume_token(
        &self,
        token: ResponseToken,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord> {
        let row = sqlx::query(
            r#"
            UPDATE response_tokens
            SET consumed_at = $2
            WHERE token = $1 AND consumed_at IS NULL
            RETURNING token, request_id, donor_id, created_at, consumed_at
            "#,
        )
        .bind(token.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BloodlineError::Other(anyhow!("Failed to consume token: {}", e)))?
        .ok_or(BloodlineError::TokenNotFound)?;

        row_to_token(&row)
    }
}
