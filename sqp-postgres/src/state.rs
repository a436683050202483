use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

use crate::types::PipelineStatusType;

/// Row of `sqp.pipeline_state`, one per pipeline.
#[derive(Debug, Clone)]
pub struct PipelineStateRow {
    pub pipeline_id: String,
    pub status: PipelineStatusType,
    pub lock_id: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub step_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Row of `sqp.pipeline_state_history`, appended on every status change.
#[derive(Debug, Clone)]
pub struct StateTransitionRow {
    pub pipeline_id: String,
    pub from_status: Option<PipelineStatusType>,
    pub to_status: PipelineStatusType,
    pub forced: bool,
    pub lock_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn state_from_row(row: PgRow) -> PipelineStateRow {
    PipelineStateRow {
        pipeline_id: row.get("pipeline_id"),
        status: row.get("status"),
        lock_id: row.get("lock_id"),
        locked_at: row.get("locked_at"),
        last_run_time: row.get("last_run_time"),
        last_success_time: row.get("last_success_time"),
        current_step: row.get("current_step"),
        step_data: row.get("step_data"),
        metadata: row.get("metadata"),
        updated_at: row.get("updated_at"),
    }
}

/// Loads the state row of a pipeline.
pub async fn get_pipeline_state<'c, E>(
    executor: E,
    pipeline_id: &str,
) -> Result<Option<PipelineStateRow>, sqlx::Error>
where
    E: PgExecutor<'c>,
{
    let row = sqlx::query(
        r#"
        select pipeline_id, status, lock_id, locked_at, last_run_time, last_success_time,
               current_step, step_data, metadata, updated_at
        from sqp.pipeline_state
        where pipeline_id = $1
        "#,
    )
    .bind(pipeline_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(state_from_row))
}

/// Inserts or overwrites the state row of a pipeline.
pub async fn upsert_pipeline_state<'c, E>(
    executor: E,
    state: &PipelineStateRow,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into sqp.pipeline_state
            (pipeline_id, status, lock_id, locked_at, last_run_time, last_success_time,
             current_step, step_data, metadata, updated_at)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (pipeline_id)
        do update set
            status = excluded.status,
            lock_id = excluded.lock_id,
            locked_at = excluded.locked_at,
            last_run_time = excluded.last_run_time,
            last_success_time = excluded.last_success_time,
            current_step = excluded.current_step,
            step_data = excluded.step_data,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&state.pipeline_id)
    .bind(state.status)
    .bind(state.lock_id)
    .bind(state.locked_at)
    .bind(state.last_run_time)
    .bind(state.last_success_time)
    .bind(&state.current_step)
    .bind(&state.step_data)
    .bind(&state.metadata)
    .bind(state.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Writes `state` only if the stored lock id equals `expected_lock_id`.
///
/// `None` matches an unlocked row or a missing row. Returns whether the write happened.
pub async fn try_replace_pipeline_lock(
    pool: &PgPool,
    expected_lock_id: Option<Uuid>,
    state: &PipelineStateRow,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        update sqp.pipeline_state
        set status = $3,
            lock_id = $4,
            locked_at = $5,
            last_run_time = $6,
            last_success_time = $7,
            current_step = $8,
            step_data = $9,
            metadata = $10,
            updated_at = $11
        where pipeline_id = $1 and lock_id is not distinct from $2::uuid
        "#,
    )
    .bind(&state.pipeline_id)
    .bind(expected_lock_id)
    .bind(state.status)
    .bind(state.lock_id)
    .bind(state.locked_at)
    .bind(state.last_run_time)
    .bind(state.last_success_time)
    .bind(&state.current_step)
    .bind(&state.step_data)
    .bind(&state.metadata)
    .bind(state.updated_at)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 1 {
        return Ok(true);
    }

    if expected_lock_id.is_some() {
        return Ok(false);
    }

    let inserted = sqlx::query(
        r#"
        insert into sqp.pipeline_state
            (pipeline_id, status, lock_id, locked_at, last_run_time, last_success_time,
             current_step, step_data, metadata, updated_at)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (pipeline_id) do nothing
        "#,
    )
    .bind(&state.pipeline_id)
    .bind(state.status)
    .bind(state.lock_id)
    .bind(state.locked_at)
    .bind(state.last_run_time)
    .bind(state.last_success_time)
    .bind(&state.current_step)
    .bind(&state.step_data)
    .bind(&state.metadata)
    .bind(state.updated_at)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

/// Appends a status transition to the history.
pub async fn insert_state_transition<'c, E>(
    executor: E,
    transition: &StateTransitionRow,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into sqp.pipeline_state_history
            (pipeline_id, from_status, to_status, forced, lock_id, metadata, created_at)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&transition.pipeline_id)
    .bind(transition.from_status)
    .bind(transition.to_status)
    .bind(transition.forced)
    .bind(transition.lock_id)
    .bind(&transition.metadata)
    .bind(transition.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Loads a page of the transition history, newest first.
pub async fn get_state_history(
    pool: &PgPool,
    pipeline_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<StateTransitionRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        select pipeline_id, from_status, to_status, forced, lock_id, metadata, created_at
        from sqp.pipeline_state_history
        where pipeline_id = $1
        order by created_at desc, id desc
        limit $2 offset $3
        "#,
    )
    .bind(pipeline_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| StateTransitionRow {
            pipeline_id: row.get("pipeline_id"),
            from_status: row.get("from_status"),
            to_status: row.get("to_status"),
            forced: row.get("forced"),
            lock_id: row.get("lock_id"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Deletes history entries created before `cutoff`. Returns the number of deleted rows.
pub async fn delete_state_history_before<'c, E>(
    executor: E,
    pipeline_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        delete from sqp.pipeline_state_history
        where pipeline_id = $1 and created_at < $2
        "#,
    )
    .bind(pipeline_id)
    .bind(cutoff)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
