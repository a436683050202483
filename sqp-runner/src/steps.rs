//! Step capabilities wired into the orchestrator by the runner.
//!
//! - [`WarehouseExtractor`] runs the `query` of an extract step through the connection pool.
//! - [`AggregationTransformer`] aggregates extracted rows into calendar periods.
//! - [`PostgresSyncer`] upserts records into a table of the sink database.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Weekday;
use pg_escape::quote_identifier;
use sqlx::PgPool;
use sqp::aggregation::{AggregationOptions, PeriodType, SearchQueryRecord, aggregate_by_period};
use sqp::clients::{ClientFactory, QueryParam, WarehouseClient};
use sqp::error::{ErrorKind, SyncError, SyncResult};
use sqp::pipeline::{Extractor, StepOutput, SyncOutcome, Syncer, Transformer};
use sqp::pool::ConnectionPool;
use sqp::{bail, sync_error};
use sqp_config::shared::PipelineStepConfig;
use tracing::{debug, info, warn};

/// Step option holding the SQL of an extract step.
const QUERY_OPTION: &str = "query";

/// Step option holding the named parameters of the query.
const PARAMS_OPTION: &str = "params";

/// Maximum number of records written by a single upsert statement.
const DEFAULT_SYNC_BATCH_SIZE: usize = 1000;

const PRIMARY_KEY_QUERY: &str = r#"
    select a.attname::text
    from pg_index i
    join pg_attribute a on a.attrelid = i.indrelid and a.attnum = any(i.indkey)
    where i.indrelid = $1::text::regclass and i.indisprimary
    order by array_position(i.indkey::int2[], a.attnum)
"#;

/// Extracts rows from the warehouse with a pooled client.
pub struct WarehouseExtractor<F: ClientFactory> {
    pool: ConnectionPool<F>,
}

impl<F: ClientFactory> WarehouseExtractor<F> {
    pub fn new(pool: ConnectionPool<F>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<F: ClientFactory> Extractor for WarehouseExtractor<F> {
    async fn extract(&self, step: &PipelineStepConfig) -> SyncResult<StepOutput> {
        let Some(sql) = step.config.get(QUERY_OPTION).and_then(|v| v.as_str()) else {
            bail!(
                ErrorKind::ConfigError,
                "Extract step has no query",
                format!("step `{}` must set the `{QUERY_OPTION}` option", step.name)
            );
        };
        let params = query_params(step)?;

        let rows = self
            .pool
            .with_client(|client| async move {
                match client.estimate_query_cost(sql).await {
                    Ok(cost) => debug!(
                        step = %step.name,
                        bytes_processed = cost.bytes_processed,
                        cost_usd = cost.cost_usd,
                        "estimated extract query cost"
                    ),
                    Err(err) => warn!(step = %step.name, error = %err.message(), "could not estimate extract query cost"),
                }

                client.query(sql, &params).await
            })
            .await?;

        info!(step = %step.name, rows = rows.len(), "extracted rows from warehouse");

        let record_count = rows.len();
        let data = serde_json::Value::Array(rows.into_iter().map(serde_json::Value::Object).collect());

        Ok(StepOutput::new(data).with_metadata("record_count", record_count))
    }
}

fn query_params(step: &PipelineStepConfig) -> SyncResult<Vec<QueryParam>> {
    match step.config.get(PARAMS_OPTION) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Object(params)) => Ok(params
            .iter()
            .map(|(name, value)| QueryParam::new(name.clone(), value.clone()))
            .collect()),
        Some(_) => bail!(
            ErrorKind::ConfigError,
            "Invalid query parameters",
            format!("`{PARAMS_OPTION}` of step `{}` must be an object", step.name)
        ),
    }
}

/// Aggregates search query performance rows by calendar period.
///
/// Reads the `period_type` (default `weekly`), `include_share_metrics` and `week_start`
/// options of the step.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationTransformer;

#[async_trait]
impl Transformer for AggregationTransformer {
    async fn transform(
        &self,
        data: serde_json::Value,
        step: &PipelineStepConfig,
    ) -> SyncResult<StepOutput> {
        let period_type = match step.config.get("period_type").and_then(|v| v.as_str()) {
            Some(period_type) => period_type.parse::<PeriodType>()?,
            None => PeriodType::Weekly,
        };
        let options = aggregation_options(step)?;
        let records = parse_records(&data)?;

        let aggregated = aggregate_by_period(&records, period_type, options)?;
        debug!(
            step = %step.name,
            input_records = records.len(),
            groups = aggregated.len(),
            %period_type,
            "aggregated records"
        );

        let record_count = aggregated.len();
        let data = serde_json::to_value(&aggregated)?;

        Ok(StepOutput::new(data)
            .with_metadata("record_count", record_count)
            .with_metadata("period_type", period_type.as_static_str()))
    }
}

fn aggregation_options(step: &PipelineStepConfig) -> SyncResult<AggregationOptions> {
    let mut options = AggregationOptions {
        include_share_metrics: step
            .config
            .get("include_share_metrics")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        ..AggregationOptions::default()
    };

    if let Some(week_start) = step.config.get("week_start").and_then(|v| v.as_str()) {
        options.week_start = week_start.parse::<Weekday>().map_err(|_| {
            sync_error!(
                ErrorKind::ConfigError,
                "Invalid week start",
                format!("`{week_start}` is not a day of the week")
            )
        })?;
    }

    Ok(options)
}

fn parse_records(data: &serde_json::Value) -> SyncResult<Vec<SearchQueryRecord>> {
    let Some(rows) = data.as_array() else {
        bail!(
            ErrorKind::InvalidData,
            "Transform input is not a list of records"
        );
    };

    rows.iter()
        .map(|row| match row {
            serde_json::Value::Object(record) => SearchQueryRecord::from_record(record),
            _ => Err(sync_error!(
                ErrorKind::InvalidData,
                "Transform input is not a list of records",
                format!("found `{row}`")
            )),
        })
        .collect()
}

/// Upserts records into tables of the sink database.
///
/// Columns are the union of the record keys. Rows conflicting on the primary key of the target
/// table are updated in place, so reruns of a period overwrite its previous values.
#[derive(Debug, Clone)]
pub struct PostgresSyncer {
    pool: PgPool,
    batch_size: usize,
}

impl PostgresSyncer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
        }
    }

    async fn primary_key_columns(&self, table: &str) -> SyncResult<Vec<String>> {
        let columns = sqlx::query_scalar::<_, String>(PRIMARY_KEY_QUERY)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        Ok(columns)
    }
}

#[async_trait]
impl Syncer for PostgresSyncer {
    async fn sync(&self, data: serde_json::Value, target_table: &str) -> SyncResult<SyncOutcome> {
        let serde_json::Value::Array(records) = data else {
            bail!(
                ErrorKind::InvalidData,
                "Load input is not a list of records",
                format!("cannot sync `{data}` into `{target_table}`")
            );
        };

        if records.is_empty() {
            debug!(table = target_table, "nothing to sync");
            return Ok(SyncOutcome {
                success: true,
                records_processed: 0,
            });
        }

        let table = quote_table_name(target_table);
        let columns = record_columns(&records)?;
        let key_columns = self.primary_key_columns(&table).await?;
        let statement = build_upsert_statement(&table, &columns, &key_columns);

        let mut transaction = self.pool.begin().await?;
        let mut records_processed = 0;
        for batch in records.chunks(self.batch_size) {
            let result = sqlx::query(&statement)
                .bind(serde_json::Value::Array(batch.to_vec()))
                .execute(&mut *transaction)
                .await?;
            records_processed += result.rows_affected();
        }
        transaction.commit().await?;

        info!(
            table = target_table,
            records_processed, "synced records into sink"
        );

        Ok(SyncOutcome {
            success: true,
            records_processed,
        })
    }
}

/// Quotes every dot-separated part of a possibly schema-qualified table name.
fn quote_table_name(table: &str) -> String {
    table
        .split('.')
        .map(|part| quote_identifier(part).into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

fn record_columns(records: &[serde_json::Value]) -> SyncResult<BTreeSet<String>> {
    let mut columns = BTreeSet::new();
    for record in records {
        let Some(record) = record.as_object() else {
            return Err(SyncError::from((
                ErrorKind::InvalidData,
                "Load input is not a list of records",
                format!("found `{record}`"),
            )));
        };
        columns.extend(record.keys().cloned());
    }

    Ok(columns)
}

/// Builds an insert of `$1`, a jsonb array of records, into `table`.
///
/// `table` must already be quoted.
fn build_upsert_statement(
    table: &str,
    columns: &BTreeSet<String>,
    key_columns: &[String],
) -> String {
    let quoted = |column: &String| quote_identifier(column).into_owned();
    let column_list = columns.iter().map(quoted).collect::<Vec<_>>().join(", ");

    let mut statement = format!(
        "insert into {table} ({column_list}) select {column_list} from jsonb_populate_recordset(null::{table}, $1)"
    );

    if key_columns.is_empty() {
        return statement;
    }

    let key_list = key_columns.iter().map(quoted).collect::<Vec<_>>().join(", ");
    let updates = columns
        .iter()
        .filter(|column| !key_columns.contains(column))
        .map(|column| {
            let column = quoted(column);
            format!("{column} = excluded.{column}")
        })
        .collect::<Vec<_>>();

    if updates.is_empty() {
        statement.push_str(&format!(" on conflict ({key_list}) do nothing"));
    } else {
        statement.push_str(&format!(
            " on conflict ({key_list}) do update set {}",
            updates.join(", ")
        ));
    }

    statement
}
