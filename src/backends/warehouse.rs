use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::backends::{BackendOutput, BackendRequest, ColumnSchema, QueryBackend, TableSchema, SAMPLE_ROWS};
use crate::core::{Dialect, Row, Value};
use crate::error::{BackendError, QueryEngineError, Result};

pub const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_TOKEN_ENV: &str = "BIGQUERY_ACCESS_TOKEN";

/// Connection settings for the remote warehouse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    pub endpoint: String,
    pub project: String,
    pub dataset: String,
    pub location: Option<String>,
    /// File holding a bearer token, raw or as `{"access_token": "..."}`
    pub credentials_path: Option<PathBuf>,
    /// Environment variable consulted when no credentials file is set
    pub token_env: String,
    pub connect_timeout_secs: u64,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project: String::new(),
            dataset: String::new(),
            location: None,
            credentials_path: None,
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl WarehouseSettings {
    /// `project.dataset`, used to qualify table names in generated queries
    pub fn qualifier(&self) -> String {
        format!("{}.{}", self.project, self.dataset)
    }
}

/// BigQuery v2 REST backend
pub struct WarehouseBackend {
    client: Client,
    settings: WarehouseSettings,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<SchemaBody>,
    #[serde(default)]
    rows: Vec<RowBody>,
    #[serde(default)]
    total_bytes_processed: Option<String>,
    #[serde(default)]
    total_bytes_billed: Option<String>,
    #[serde(default)]
    job_reference: Option<JobReference>,
    /// Set when more rows wait behind `jobs.getQueryResults`
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SchemaBody {
    #[serde(default)]
    fields: Vec<FieldBody>,
}

#[derive(Debug, Deserialize)]
struct FieldBody {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowBody {
    #[serde(default)]
    f: Vec<CellBody>,
}

#[derive(Debug, Deserialize)]
struct CellBody {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TableBody {
    #[serde(default)]
    schema: SchemaBody,
}

#[derive(Debug, Default, Deserialize)]
struct TableDataBody {
    #[serde(default)]
    rows: Vec<RowBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListBody {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl WarehouseBackend {
    /// Create backend, resolving the bearer token from file or environment
    pub fn new(settings: WarehouseSettings) -> Result<Self> {
        let token = resolve_token(&settings)?;
        Self::with_token(settings, token)
    }

    /// Create backend with an already obtained bearer token
    pub fn with_token(settings: WarehouseSettings, token: impl Into<String>) -> Result<Self> {
        if settings.project.is_empty() || settings.dataset.is_empty() {
            return Err(QueryEngineError::Config(
                "warehouse backend needs both project and dataset".to_string(),
            ));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            settings,
            token: token.into(),
        })
    }

    pub fn settings(&self) -> &WarehouseSettings {
        &self.settings
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            self.settings.endpoint.trim_end_matches('/'),
            urlencoding::encode(&self.settings.project),
            urlencoding::encode(&self.settings.dataset)
        )
    }

    fn table_url(&self, table: &str) -> String {
        let table = table.rsplit('.').next().unwrap_or(table);
        format!("{}/tables/{}", self.dataset_url(), urlencoding::encode(table))
    }

    /// `jobs.getQueryResults` for the page after `page_token`
    async fn next_page(
        &self,
        job: &JobReference,
        page_token: &str,
        max_results: Option<usize>,
        timeout: Duration,
    ) -> std::result::Result<QueryResponse, BackendError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.settings.endpoint.trim_end_matches('/'),
            urlencoding::encode(&self.settings.project),
            urlencoding::encode(&job.job_id)
        );

        let mut params = vec![
            ("pageToken", page_token.to_string()),
            ("timeoutMs", timeout.as_millis().to_string()),
        ];
        if let Some(n) = max_results {
            params.push(("maxResults", n.to_string()));
        }
        if let Some(location) = job.location.as_ref().or(self.settings.location.as_ref()) {
            params.push(("location", location.clone()));
        }

        let page: QueryResponse = self
            .send(self.client.get(&url).query(&params).timeout(timeout))
            .await?;
        if !page.job_complete {
            return Err(BackendError::Timeout(format!(
                "result page for job {} not ready within {} ms",
                job.job_id,
                timeout.as_millis()
            )));
        }
        Ok(page)
    }

    /// Send with bearer auth and decode a success body, mapping failures
    async fn send<T: for<'de> Deserialize<'de>>(&self, builder: RequestBuilder) -> std::result::Result<T, BackendError> {
        let response = builder
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Unknown(format!("Invalid JSON from warehouse: {}", e)))
    }
}

#[async_trait]
impl QueryBackend for WarehouseBackend {
    async fn execute(&self, request: &BackendRequest) -> std::result::Result<BackendOutput, BackendError> {
        let url = format!(
            "{}/projects/{}/queries",
            self.settings.endpoint.trim_end_matches('/'),
            urlencoding::encode(&self.settings.project)
        );

        let mut body = json!({
            "query": request.sql,
            "useLegacySql": false,
            "timeoutMs": request.timeout.as_millis() as u64,
            "defaultDataset": {
                "projectId": self.settings.project,
                "datasetId": self.settings.dataset,
            },
        });
        if let Some(location) = &self.settings.location {
            body["location"] = json!(location);
        }
        if let Some(limit) = request.fetch_limit {
            body["maxResults"] = json!(limit);
        }
        if let Some(max_bytes) = request.max_bytes_billed {
            // int64 fields travel as strings
            body["maximumBytesBilled"] = json!(max_bytes.to_string());
        }

        let response: QueryResponse = self
            .send(self.client.post(&url).json(&body).timeout(request.timeout))
            .await?;

        if !response.job_complete {
            return Err(BackendError::Timeout(format!(
                "query job did not complete within {} ms",
                request.timeout.as_millis()
            )));
        }

        let QueryResponse {
            schema,
            rows: first_page,
            total_bytes_processed,
            total_bytes_billed,
            job_reference,
            mut page_token,
            ..
        } = response;

        let fields = schema.unwrap_or_default().fields;
        let columns = fields.iter().map(|f| f.name.clone()).collect();
        let mut rows: Vec<Row> = first_page.iter().map(|row| to_row(&fields, row)).collect();

        // The first page can be cut short by response size; keep reading
        // until the fetch limit is met or the job has no more rows
        while let Some(token) = page_token.take().filter(|t| !t.is_empty()) {
            let remaining = match request.fetch_limit {
                Some(limit) if rows.len() >= limit => break,
                Some(limit) => Some(limit - rows.len()),
                None => None,
            };
            let job = job_reference.as_ref().ok_or_else(|| {
                BackendError::Unknown("paged query response without a job reference".to_string())
            })?;

            let page = self.next_page(job, &token, remaining, request.timeout).await?;
            rows.extend(page.rows.iter().map(|row| to_row(&fields, row)));
            page_token = page.page_token;
        }

        tracing::debug!("Warehouse returned {} rows", rows.len());
        Ok(BackendOutput {
            columns,
            rows,
            bytes_processed: total_bytes_processed.and_then(|b| b.parse().ok()),
            bytes_billed: total_bytes_billed.and_then(|b| b.parse().ok()),
        })
    }

    async fn describe_table(&self, table: &str) -> std::result::Result<TableSchema, BackendError> {
        let url = self.table_url(table);
        let meta: TableBody = self.send(self.client.get(&url)).await?;
        let data: TableDataBody = self
            .send(
                self.client
                    .get(format!("{}/data", url))
                    .query(&[("maxResults", SAMPLE_ROWS.to_string())]),
            )
            .await?;

        let columns = meta
            .schema
            .fields
            .iter()
            .map(|f| ColumnSchema {
                name: f.name.clone(),
                data_type: f.field_type.clone(),
                nullable: f.mode.as_deref() != Some("REQUIRED"),
            })
            .collect();
        let sample_rows = data
            .rows
            .iter()
            .take(SAMPLE_ROWS)
            .map(|row| to_row(&meta.schema.fields, row))
            .collect();

        Ok(TableSchema {
            name: table.to_string(),
            columns,
            sample_rows,
        })
    }

    async fn list_tables(&self) -> std::result::Result<Vec<String>, BackendError> {
        let url = format!("{}/tables", self.dataset_url());
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self.client.get(&url);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            let page: TableListBody = self.send(builder).await?;
            names.extend(page.tables.into_iter().map(|t| t.table_reference.table_id));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }

    fn name(&self) -> &str {
        "bigquery"
    }

    fn dialect(&self) -> Dialect {
        Dialect::BigQuery
    }

    async fn health_check(&self) -> std::result::Result<(), BackendError> {
        let _: serde_json::Value = self.send(self.client.get(self.dataset_url())).await?;
        Ok(())
    }
}

fn resolve_token(settings: &WarehouseSettings) -> Result<String> {
    if let Some(path) = &settings.credentials_path {
        let raw = std::fs::read_to_string(path)?;
        let token = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(doc) => doc
                .get("access_token")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    QueryEngineError::Config(format!("{} has no access_token field", path.display()))
                })?,
            Err(_) => raw.trim().to_string(),
        };
        return Ok(token);
    }

    std::env::var(&settings.token_env).map_err(|_| {
        QueryEngineError::Config(format!(
            "no warehouse credentials: set credentials_path or {}",
            settings.token_env
        ))
    })
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else {
        BackendError::Unknown(format!("Warehouse request failed: {}", err))
    }
}

fn map_status(status: StatusCode, body: &str) -> BackendError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let message = parsed
        .as_ref()
        .map(|e| e.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let reason = parsed
        .as_ref()
        .and_then(|e| e.error.errors.first())
        .map(|d| d.reason.as_str())
        .unwrap_or_default();

    match (status.as_u16(), reason) {
        (_, "accessDenied") | (401, _) | (403, _) => BackendError::AccessDenied(message),
        (_, "notFound") | (404, _) => BackendError::NotFound(message),
        (_, "timeout") | (408, _) | (504, _) => BackendError::Timeout(message),
        (400, _) => BackendError::BadRequest(message),
        _ => BackendError::Unknown(message),
    }
}

fn to_row(fields: &[FieldBody], row: &RowBody) -> Row {
    fields
        .iter()
        .zip(row.f.iter())
        .map(|(field, cell)| (field.name.clone(), to_value(field, &cell.v)))
        .collect()
}

/// Cells arrive as strings; the schema decides the scalar type
fn to_value(field: &FieldBody, raw: &serde_json::Value) -> Value {
    let text = match raw {
        serde_json::Value::Null => return Value::Null,
        serde_json::Value::String(s) => s.as_str(),
        other => return Value::Text(other.to_string()),
    };
    if field.mode.as_deref() == Some("REPEATED") {
        return Value::Text(text.to_string());
    }

    match field.field_type.as_str() {
        "INTEGER" | "INT64" => text.parse().map(Value::Int).unwrap_or_else(|_| Value::from(text)),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => {
            text.parse().map(Value::Float).unwrap_or_else(|_| Value::from(text))
        }
        "BOOLEAN" | "BOOL" => Value::Bool(text.eq_ignore_ascii_case("true")),
        _ => Value::from(text),
    }
}
