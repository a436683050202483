use gcp_bigquery_client::Client;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::query_parameter::QueryParameter;
use gcp_bigquery_client::model::query_parameter_type::QueryParameterType;
use gcp_bigquery_client::model::query_parameter_value::QueryParameterValue;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::yup_oauth2::parse_service_account_key;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::bail;
use crate::clients::{ClientFactory, QueryCost, QueryParam, WarehouseClient};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::types::Record;

/// Query used to check that a client can still reach the warehouse.
const HEALTH_CHECK_QUERY: &str = "select 1";

/// Warehouse client backed by the BigQuery REST API.
pub struct BigQueryClient {
    project_id: String,
    client: Client,
}

impl BigQueryClient {
    /// Creates a client from a service account key JSON string.
    pub async fn new_with_key(project_id: String, sa_key: &str) -> SyncResult<BigQueryClient> {
        let sa_key = parse_service_account_key(sa_key).map_err(|err| {
            SyncError::from((
                ErrorKind::AuthenticationError,
                "Invalid BigQuery service account key",
                err.to_string(),
            ))
            .with_source(err)
        })?;
        let client = Client::from_service_account_key(sa_key, false)
            .await
            .map_err(bq_error_to_sync_error)?;

        Ok(BigQueryClient { project_id, client })
    }

    async fn run(&self, request: QueryRequest) -> Result<ResultSet, BQError> {
        let query_response = self.client.job().query(&self.project_id, request).await?;

        Ok(ResultSet::new_from_query_response(query_response))
    }

    fn build_request(sql: &str, params: &[QueryParam]) -> SyncResult<QueryRequest> {
        let mut request = QueryRequest::new(sql.to_string());
        if params.is_empty() {
            return Ok(request);
        }

        let parameters = params
            .iter()
            .map(to_query_parameter)
            .collect::<SyncResult<Vec<_>>>()?;
        request.parameter_mode = Some("NAMED".to_string());
        request.query_parameters = Some(parameters);

        Ok(request)
    }
}

impl WarehouseClient for BigQueryClient {
    async fn query(&self, sql: &str, params: &[QueryParam]) -> SyncResult<Vec<Record>> {
        let request = Self::build_request(sql, params)?;
        let mut result_set = self.run(request).await.map_err(bq_error_to_sync_error)?;

        let column_names = result_set.column_names();
        let mut rows = Vec::new();
        while result_set.next_row() {
            let mut record = Record::new();
            for (index, column_name) in column_names.iter().enumerate() {
                let value = result_set
                    .get_json_value(index)
                    .map_err(bq_error_to_sync_error)?
                    .unwrap_or(serde_json::Value::Null);
                record.insert(column_name.clone(), value);
            }
            rows.push(record);
        }

        debug!(rows = rows.len(), "bigquery query completed");

        Ok(rows)
    }

    async fn test_connection(&self) -> bool {
        match self.run(QueryRequest::new(HEALTH_CHECK_QUERY.to_string())).await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "bigquery health check failed");
                false
            }
        }
    }

    async fn estimate_query_cost(&self, sql: &str) -> SyncResult<QueryCost> {
        let mut request = QueryRequest::new(sql.to_string());
        request.dry_run = Some(true);

        let response = self
            .client
            .job()
            .query(&self.project_id, request)
            .await
            .map_err(bq_error_to_sync_error)?;

        let bytes_processed = match response.total_bytes_processed {
            Some(bytes) => bytes.parse::<u64>().map_err(|err| {
                SyncError::from((
                    ErrorKind::InvalidData,
                    "BigQuery returned an invalid byte count",
                    err.to_string(),
                ))
            })?,
            None => 0,
        };

        Ok(QueryCost::from_bytes(bytes_processed))
    }

    async fn close(&self) {
        debug!(project_id = %self.project_id, "closing bigquery client");
    }
}

/// Creates [`BigQueryClient`]s for a fixed project and service account.
pub struct BigQueryClientFactory {
    project_id: String,
    service_account_key: SecretString,
}

impl BigQueryClientFactory {
    pub fn new(project_id: String, service_account_key: SecretString) -> Self {
        Self {
            project_id,
            service_account_key,
        }
    }
}

impl ClientFactory for BigQueryClientFactory {
    type Client = BigQueryClient;

    async fn create_client(&self) -> SyncResult<BigQueryClient> {
        BigQueryClient::new_with_key(
            self.project_id.clone(),
            self.service_account_key.expose_secret(),
        )
        .await
    }
}

fn to_query_parameter(param: &QueryParam) -> SyncResult<QueryParameter> {
    let (parameter_type, value) = match &param.value {
        serde_json::Value::String(value) => ("STRING", value.clone()),
        serde_json::Value::Bool(value) => ("BOOL", value.to_string()),
        serde_json::Value::Number(value) if value.is_f64() => ("FLOAT64", value.to_string()),
        serde_json::Value::Number(value) => ("INT64", value.to_string()),
        _ => bail!(
            ErrorKind::ConfigError,
            "Unsupported query parameter type",
            format!("parameter `{}` must be a string, number or boolean", param.name)
        ),
    };

    Ok(QueryParameter {
        name: Some(param.name.clone()),
        parameter_type: Some(QueryParameterType {
            r#type: parameter_type.to_string(),
            array_type: None,
            struct_types: None,
        }),
        parameter_value: Some(QueryParameterValue {
            value: Some(value),
            array_values: None,
            struct_values: None,
        }),
    })
}

/// Maps a [`BQError`] to a [`SyncError`] whose kind drives retry classification.
pub fn bq_error_to_sync_error(err: BQError) -> SyncError {
    let (kind, description) = match &err {
        BQError::InvalidServiceAccountKey(_)
        | BQError::AuthError(_)
        | BQError::YupAuthError(_)
        | BQError::NoToken => (ErrorKind::AuthenticationError, "BigQuery authentication failed"),
        BQError::RequestError(_) => (ErrorKind::NetworkError, "BigQuery request failed"),
        BQError::ResponseError { error } => match error.error.code {
            401 => (ErrorKind::AuthenticationError, "BigQuery authentication failed"),
            403 if err.to_string().to_lowercase().contains("quota")
                || err.to_string().to_lowercase().contains("ratelimit") =>
            {
                (ErrorKind::QuotaExceeded, "BigQuery quota exceeded")
            }
            403 => (ErrorKind::PermissionDenied, "BigQuery permission denied"),
            429 => (ErrorKind::QuotaExceeded, "BigQuery rate limit exceeded"),
            400 | 404 => (ErrorKind::QueryFailed, "BigQuery rejected the query"),
            500..=599 => (ErrorKind::NetworkError, "BigQuery service unavailable"),
            _ => (ErrorKind::QueryFailed, "BigQuery response error"),
        },
        BQError::SerializationError(_) => (
            ErrorKind::DeserializationError,
            "BigQuery JSON deserialization failed",
        ),
        _ => (ErrorKind::Unknown, "BigQuery operation failed"),
    };

    let detail = err.to_string();
    SyncError::from((kind, description, detail)).with_source(err)
}
