use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Row};
use uuid::Uuid;

/// Row of `sqp.pipeline_metrics`, one per run.
#[derive(Debug, Clone)]
pub struct RunMetricsRow {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub records_processed: i64,
    /// Latest attempt of every step, as a JSON array.
    pub steps: serde_json::Value,
    pub error: Option<String>,
}

/// Row of `sqp.pipeline_errors`.
#[derive(Debug, Clone)]
pub struct PipelineErrorRow {
    pub pipeline_id: String,
    pub run_id: Option<Uuid>,
    pub step: Option<String>,
    pub error_kind: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row of `sqp.pipeline_logs`.
#[derive(Debug, Clone)]
pub struct PipelineLogRow {
    pub pipeline_id: String,
    pub run_id: Option<Uuid>,
    pub level: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Inserts or updates the metrics row of a run.
pub async fn upsert_run_metrics<'c, E>(executor: E, metrics: &RunMetricsRow) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into sqp.pipeline_metrics
            (run_id, pipeline_id, status, start_time, end_time, duration_ms,
             records_processed, steps, error)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (run_id)
        do update set
            status = excluded.status,
            end_time = excluded.end_time,
            duration_ms = excluded.duration_ms,
            records_processed = excluded.records_processed,
            steps = excluded.steps,
            error = excluded.error
        "#,
    )
    .bind(metrics.run_id)
    .bind(&metrics.pipeline_id)
    .bind(&metrics.status)
    .bind(metrics.start_time)
    .bind(metrics.end_time)
    .bind(metrics.duration_ms)
    .bind(metrics.records_processed)
    .bind(&metrics.steps)
    .bind(&metrics.error)
    .execute(executor)
    .await?;

    Ok(())
}

/// Loads the most recent runs of a pipeline, newest first.
pub async fn get_recent_runs(
    pool: &PgPool,
    pipeline_id: &str,
    limit: i64,
) -> Result<Vec<RunMetricsRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        select run_id, pipeline_id, status, start_time, end_time, duration_ms,
               records_processed, steps, error
        from sqp.pipeline_metrics
        where pipeline_id = $1
        order by start_time desc
        limit $2
        "#,
    )
    .bind(pipeline_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| RunMetricsRow {
            run_id: row.get("run_id"),
            pipeline_id: row.get("pipeline_id"),
            status: row.get("status"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            duration_ms: row.get("duration_ms"),
            records_processed: row.get("records_processed"),
            steps: row.get("steps"),
            error: row.get("error"),
        })
        .collect())
}

/// Appends an error entry.
pub async fn insert_pipeline_error<'c, E>(
    executor: E,
    error: &PipelineErrorRow,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into sqp.pipeline_errors
            (pipeline_id, run_id, step, error_kind, message, context, created_at)
        values ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&error.pipeline_id)
    .bind(error.run_id)
    .bind(&error.step)
    .bind(&error.error_kind)
    .bind(&error.message)
    .bind(&error.context)
    .bind(error.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Loads the errors recorded since `since`, newest first.
pub async fn get_errors_since(
    pool: &PgPool,
    pipeline_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<PipelineErrorRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        select pipeline_id, run_id, step, error_kind, message, context, created_at
        from sqp.pipeline_errors
        where pipeline_id = $1 and created_at >= $2
        order by created_at desc, id desc
        "#,
    )
    .bind(pipeline_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| PipelineErrorRow {
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            step: row.get("step"),
            error_kind: row.get("error_kind"),
            message: row.get("message"),
            context: row.get("context"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Appends a log entry.
pub async fn insert_pipeline_log<'c, E>(executor: E, log: &PipelineLogRow) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into sqp.pipeline_logs
            (pipeline_id, run_id, level, message, metadata, created_at)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&log.pipeline_id)
    .bind(log.run_id)
    .bind(&log.level)
    .bind(&log.message)
    .bind(&log.metadata)
    .bind(log.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Loads the most recent log entries, newest first.
pub async fn get_recent_logs(
    pool: &PgPool,
    pipeline_id: &str,
    limit: i64,
) -> Result<Vec<PipelineLogRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        select pipeline_id, run_id, level, message, metadata, created_at
        from sqp.pipeline_logs
        where pipeline_id = $1
        order by created_at desc, id desc
        limit $2
        "#,
    )
    .bind(pipeline_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| PipelineLogRow {
            pipeline_id: row.get("pipeline_id"),
            run_id: row.get("run_id"),
            level: row.get("level"),
            message: row.get("message"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Deletes metrics, errors and logs older than `cutoff` in one transaction.
///
/// Returns the total number of deleted rows.
pub async fn delete_monitor_data_before(
    pool: &PgPool,
    pipeline_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let metrics = sqlx::query(
        r#"
        delete from sqp.pipeline_metrics
        where pipeline_id = $1 and start_time < $2
        "#,
    )
    .bind(pipeline_id)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    let errors = sqlx::query(
        r#"
        delete from sqp.pipeline_errors
        where pipeline_id = $1 and created_at < $2
        "#,
    )
    .bind(pipeline_id)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    let logs = sqlx::query(
        r#"
        delete from sqp.pipeline_logs
        where pipeline_id = $1 and created_at < $2
        "#,
    )
    .bind(pipeline_id)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(metrics.rows_affected() + errors.rows_affected() + logs.rows_affected())
}
