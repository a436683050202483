use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Credentials of the BigQuery project records are extracted from.
#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    /// Service account key JSON.
    pub service_account_key: SecretString,
}

impl BigQueryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "warehouse.project_id".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}
