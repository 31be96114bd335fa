use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::time::Duration;

use crate::models::{ProcessedEvent, WebhookEventStatus};

/// Claim a delivery for processing in one statement.
///
/// Inserts the row on first receipt, or bumps the attempt count on
/// redelivery. Returns `None` when the event is already processed,
/// dead-lettered, or leased to a concurrent handler.
pub async fn claim_delivery(
    pool: &PgPool,
    event_id: &str,
    event_type: &str,
    payload: &JsonValue,
    lease: Duration,
) -> Result<Option<ProcessedEvent>, sqlx::Error> {
    sqlx::query_as::<_, ProcessedEvent>(
        r#"
        INSERT INTO processed_events (
            event_id, event_type, payload, status, processed, attempt_count,
            locked_until, received_at, last_attempt_at
        )
        VALUES ($1, $2, $3, 'processing', FALSE, 1,
                NOW() + make_interval(secs => $4), NOW(), NOW())
        ON CONFLICT (event_id) DO UPDATE
        SET status = 'processing',
            attempt_count = processed_events.attempt_count + 1,
            locked_until = EXCLUDED.locked_until,
            last_attempt_at = NOW()
        WHERE NOT processed_events.processed
          AND processed_events.status <> 'dead_lettered'
          AND (processed_events.locked_until IS NULL OR processed_events.locked_until < NOW())
        RETURNING *
        "#,
    )
    .bind(event_id)
    .bind(event_type)
    .bind(payload)
    .bind(lease.as_secs_f64())
    .fetch_optional(pool)
    .await
}

/// Claim a stored event for re-dispatch by the sweeper or an operator replay
pub async fn claim_stored(
    pool: &PgPool,
    event_id: &str,
    lease: Duration,
    include_dead_lettered: bool,
) -> Result<Option<ProcessedEvent>, sqlx::Error> {
    sqlx::query_as::<_, ProcessedEvent>(
        r#"
        UPDATE processed_events
        SET status = 'processing',
            attempt_count = attempt_count + 1,
            locked_until = NOW() + make_interval(secs => $2),
            last_attempt_at = NOW()
        WHERE event_id = $1
          AND NOT processed
          AND ($3 OR status <> 'dead_lettered')
          AND (locked_until IS NULL OR locked_until < NOW())
        RETURNING *
        "#,
    )
    .bind(event_id)
    .bind(lease.as_secs_f64())
    .bind(include_dead_lettered)
    .fetch_optional(pool)
    .await
}

pub async fn mark_processed(pool: &PgPool, event_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE processed_events
        SET status = 'processed',
            processed = TRUE,
            processed_at = NOW(),
            locked_until = NULL,
            next_attempt_at = NULL,
            last_error = NULL
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed attempt. Once `max_attempts` is reached the event is
/// dead-lettered instead of scheduled. Returns the resulting status.
pub async fn mark_failed(
    pool: &PgPool,
    event_id: &str,
    error: &str,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
) -> Result<WebhookEventStatus, sqlx::Error> {
    sqlx::query_scalar::<_, WebhookEventStatus>(
        r#"
        UPDATE processed_events
        SET status = CASE WHEN attempt_count >= $3
                          THEN 'dead_lettered'::webhook_event_status
                          ELSE 'failed'::webhook_event_status END,
            next_attempt_at = CASE WHEN attempt_count >= $3 THEN NULL ELSE $4 END,
            last_error = $2,
            locked_until = NULL
        WHERE event_id = $1
        RETURNING status
        "#,
    )
    .bind(event_id)
    .bind(error)
    .bind(max_attempts)
    .bind(next_attempt_at)
    .fetch_one(pool)
    .await
}

pub async fn find(pool: &PgPool, event_id: &str) -> Result<Option<ProcessedEvent>, sqlx::Error> {
    sqlx::query_as::<_, ProcessedEvent>("SELECT * FROM processed_events WHERE event_id = $1")
        .bind(event_id)
        .fetch_optional(pool)
        .await
}

pub async fn list(
    pool: &PgPool,
    status: Option<WebhookEventStatus>,
    limit: i64,
) -> Result<Vec<ProcessedEvent>, sqlx::Error> {
    sqlx::query_as::<_, ProcessedEvent>(
        r#"
        SELECT * FROM processed_events
        WHERE ($1::webhook_event_status IS NULL OR status = $1)
        ORDER BY received_at DESC
        LIMIT $2
        "#,
    )
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Events due for another attempt: failed rows whose backoff elapsed, plus
/// rows whose handler died holding the lease
pub async fn due_for_retry(pool: &PgPool, limit: i64) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r#"
        SELECT event_id FROM processed_events
        WHERE NOT processed
          AND (
            (status = 'failed' AND next_attempt_at <= NOW())
            OR (status = 'processing' AND locked_until < NOW())
          )
        ORDER BY COALESCE(next_attempt_at, locked_until) ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
