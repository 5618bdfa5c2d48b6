//! BigQuery REST v2 client.
//!
//! Authenticates with application default credentials through `gcp_auth`
//! and talks JSON over `reqwest`. Each client bills jobs to one project; the
//! client pool rotates several of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use shredder_types::table::TableRef;
use shredder_types::warehouse::{
    CopyJobConfig, Job, JobKind, JobRef, Partitioning, QueryJobConfig, TableMetadata, TableSpec,
};

use super::{split_decorator, Result, Row, Warehouse, WarehouseError};

const API_ROOT: &str = "https://bigquery.googleapis.com/bigquery/v2";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];

const POLL_INITIAL_MS: u64 = 1_000;
const POLL_MAX_MS: u64 = 30_000;
const QUERY_TIMEOUT_MS: u64 = 60_000;

/// BigQuery client billing jobs to a single project.
pub struct BigQueryClient {
    project: String,
    location: Option<String>,
    token_provider: Arc<dyn TokenProvider>,
    http: reqwest::Client,
    api_root: String,
}

impl std::fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("project", &self.project)
            .field("location", &self.location)
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

impl BigQueryClient {
    /// Create a client using application default credentials.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Auth`] if no credentials can be found, or
    /// [`WarehouseError::Request`] if the HTTP client can't be built.
    pub async fn new(project: impl Into<String>) -> Result<Self> {
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| WarehouseError::Auth(format!("Failed to initialize GCP auth: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| WarehouseError::Request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_provider(project, token_provider, http))
    }

    /// Create a client sharing an existing token provider and HTTP client.
    #[must_use]
    pub fn with_provider(
        project: impl Into<String>,
        token_provider: Arc<dyn TokenProvider>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            project: project.into(),
            location: None,
            token_provider,
            http,
            api_root: API_ROOT.to_string(),
        }
    }

    /// Another client with the same credentials billing `project`.
    #[must_use]
    pub fn for_project(&self, project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            location: self.location.clone(),
            token_provider: Arc::clone(&self.token_provider),
            http: self.http.clone(),
            api_root: self.api_root.clone(),
        }
    }

    /// Pin new jobs to a location (e.g. `US`).
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(SCOPES)
            .await
            .map_err(|e| WarehouseError::Auth(format!("Failed to get GCP access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| WarehouseError::Request(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| WarehouseError::Decode(e.to_string()));
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(WarehouseError::NotFound(message));
        }
        Err(WarehouseError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.api_root, table.project, table.dataset, table.table
        )
    }

    fn jobs_url(&self) -> String {
        format!("{}/projects/{}/jobs", self.api_root, self.project)
    }

    async fn insert_job(&self, configuration: Value, dry_run: bool) -> Result<Job> {
        let mut job_reference = json!({ "projectId": self.project });
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }
        let mut configuration = configuration;
        configuration["dryRun"] = json!(dry_run);
        let body = json!({
            "jobReference": job_reference,
            "configuration": configuration,
        });
        let resource: JobResource = self.send(self.http.post(self.jobs_url()).json(&body)).await?;
        resource.into_job(dry_run)
    }

    async fn fetch_job(&self, job: &JobRef) -> Result<JobResource> {
        let mut request = self
            .http
            .get(format!("{}/projects/{}/jobs/{}", self.api_root, job.project, job.job_id));
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        self.send(request).await
    }

    async fn run_rows(&self, sql: &str, use_legacy_sql: bool) -> Result<Vec<Row>> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": use_legacy_sql,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }
        let url = format!("{}/projects/{}/queries", self.api_root, self.project);
        let mut page: QueryResponse = self.send(self.http.post(url).json(&body)).await?;
        let mut rows = Vec::new();
        let mut delay = POLL_INITIAL_MS;
        loop {
            if page.job_complete.unwrap_or(false) {
                page.check_errors()?;
                rows.extend(page.decode_rows()?);
                if page.page_token.is_none() {
                    return Ok(rows);
                }
            } else {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(POLL_MAX_MS);
            }
            let reference = page
                .job_reference
                .as_ref()
                .ok_or_else(|| WarehouseError::Decode("query response has no jobReference".into()))?;
            let mut request = self.http.get(format!(
                "{}/projects/{}/queries/{}",
                self.api_root, reference.project_id, reference.job_id.as_deref().unwrap_or_default()
            ));
            if let Some(location) = &reference.location {
                request = request.query(&[("location", location)]);
            }
            if let Some(token) = &page.page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let schema = page.schema.take();
            page = self.send(request).await?;
            if page.schema.is_none() {
                page.schema = schema;
            }
        }
    }

    async fn list_paged<T: DeserializeOwned + Paged>(&self, url: String) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url);
            if let Some(token) = &token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: T = self.send(request).await?;
            token = page.next_page_token();
            names.extend(page.names());
            if token.is_none() {
                return Ok(names);
            }
        }
    }
}

fn table_reference(raw: &str) -> Result<Value> {
    let (table_id, decorator) = split_decorator(raw);
    let table = TableRef::parse(table_id, None)
        .map_err(|e| WarehouseError::Decode(format!("invalid destination: {e}")))?;
    let table_id = match decorator {
        Some(partition) => format!("{}${partition}", table.table),
        None => table.table,
    };
    Ok(json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table_id,
    }))
}

fn partition_summary_sql(table: &TableRef) -> String {
    format!(
        "SELECT partition_id FROM [{}:{}.{}$__PARTITIONS_SUMMARY__]",
        table.project, table.dataset, table.table
    )
}

fn parse_u64(raw: Option<&String>) -> Option<u64> {
    raw.and_then(|v| v.parse().ok())
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn project(&self) -> &str {
        &self.project
    }

    async fn get_table(&self, table: &TableRef) -> Result<Option<TableMetadata>> {
        match self
            .send::<TableResource>(self.http.get(self.table_url(table)))
            .await
        {
            Ok(resource) => Ok(Some(resource.into_metadata(table.clone()))),
            Err(WarehouseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<()> {
        let fields: Vec<Value> = spec
            .fields
            .iter()
            .map(|f| json!({ "name": f.name, "type": f.field_type }))
            .collect();
        let mut body = json!({
            "tableReference": {
                "projectId": spec.table.project,
                "datasetId": spec.table.dataset,
                "tableId": spec.table.table,
            },
            "schema": { "fields": fields },
        });
        if spec.time_partitioned {
            body["timePartitioning"] = json!({ "type": "DAY" });
        }
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.api_root, spec.table.project, spec.table.dataset
        );
        let _: Value = self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }

    async fn list_partition_ids(&self, table: &TableRef) -> Result<Vec<String>> {
        let rows = self.run_rows(&partition_summary_sql(table), true).await?;
        rows.into_iter()
            .map(|row| match row.get("partition_id") {
                Some(Value::String(id)) => Ok(id.clone()),
                other => Err(WarehouseError::Decode(format!(
                    "unexpected partition_id value: {other:?}"
                ))),
            })
            .collect()
    }

    async fn query(&self, sql: &str, config: &QueryJobConfig) -> Result<Job> {
        let mut query = json!({
            "query": sql,
            "useLegacySql": config.use_legacy_sql,
            "priority": config.priority.as_str(),
        });
        if let Some(destination) = &config.destination {
            query["destinationTable"] = table_reference(destination)?;
        }
        if let Some(disposition) = config.write_disposition {
            query["writeDisposition"] = json!(disposition.as_str());
        }
        if let Some(fields) = &config.clustering_fields {
            query["clustering"] = json!({ "fields": fields });
        }
        self.insert_job(json!({ "query": query }), config.dry_run).await
    }

    async fn copy_tables(
        &self,
        sources: &[String],
        destination: &str,
        config: &CopyJobConfig,
    ) -> Result<Job> {
        let source_tables = sources
            .iter()
            .map(|s| table_reference(s))
            .collect::<Result<Vec<_>>>()?;
        let copy = json!({
            "sourceTables": source_tables,
            "destinationTable": table_reference(destination)?,
            "writeDisposition": config.write_disposition.as_str(),
            "createDisposition": config.create_disposition.as_str(),
        });
        self.insert_job(json!({ "copy": copy }), false).await
    }

    async fn get_job(&self, job: &JobRef) -> Result<Job> {
        self.fetch_job(job).await?.into_job(false)
    }

    async fn wait_job(&self, job: &JobRef) -> Result<Job> {
        let mut delay = POLL_INITIAL_MS;
        loop {
            let current = self.fetch_job(job).await?.into_job(false)?;
            if current.ended {
                return Ok(current);
            }
            tracing::debug!(job_id = %job, delay_ms = delay, "Job still running");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay = (delay * 2).min(POLL_MAX_MS);
        }
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        self.run_rows(sql, false).await
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Value]) -> Result<Vec<String>> {
        let body = json!({
            "skipInvalidRows": false,
            "rows": rows.iter().map(|row| json!({ "json": row })).collect::<Vec<_>>(),
        });
        let url = format!("{}/insertAll", self.table_url(table));
        let response: InsertAllResponse = self.send(self.http.post(url).json(&body)).await?;
        Ok(response
            .insert_errors
            .unwrap_or_default()
            .into_iter()
            .flat_map(|RowInsertErrors { index, errors }| {
                errors
                    .into_iter()
                    .map(move |e| format!("row {index}: {}", e.describe()))
            })
            .collect())
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>> {
        self.list_paged::<DatasetList>(format!("{}/projects/{project}/datasets", self.api_root))
            .await
    }

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>> {
        self.list_paged::<TableList>(format!(
            "{}/projects/{project}/datasets/{dataset}/tables",
            self.api_root
        ))
        .await
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    num_bytes: Option<String>,
    num_rows: Option<String>,
    time_partitioning: Option<TimePartitioningResource>,
    range_partitioning: Option<RangePartitioningResource>,
    clustering: Option<ClusteringResource>,
    schema: Option<SchemaResource>,
}

#[derive(Debug, Deserialize)]
struct TimePartitioningResource {
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangePartitioningResource {
    field: String,
    range: RangeResource,
}

#[derive(Debug, Deserialize)]
struct RangeResource {
    start: String,
    end: String,
    interval: String,
}

#[derive(Debug, Deserialize)]
struct ClusteringResource {
    fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaResource {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
}

impl TableResource {
    fn into_metadata(self, table: TableRef) -> TableMetadata {
        let partitioning = match (self.range_partitioning, self.time_partitioning) {
            (Some(range), _) => Some(Partitioning::Range {
                field: range.field,
                start: range.range.start.parse().unwrap_or_default(),
                end: range.range.end.parse().unwrap_or_default(),
                interval: range.range.interval.parse().unwrap_or(1),
            }),
            (None, Some(time)) => Some(Partitioning::Time { field: time.field }),
            (None, None) => None,
        };
        TableMetadata {
            table,
            num_bytes: parse_u64(self.num_bytes.as_ref()),
            num_rows: parse_u64(self.num_rows.as_ref()),
            partitioning,
            clustering_fields: self.clustering.map(|c| c.fields),
            columns: self
                .schema
                .map(|s| s.fields.into_iter().map(|f| f.name).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceResource {
    project_id: String,
    job_id: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResource {
    state: Option<String>,
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatisticsResource {
    total_bytes_processed: Option<String>,
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatisticsResource {
    creation_time: Option<String>,
    total_bytes_processed: Option<String>,
    query: Option<QueryStatisticsResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationResource {
    destination_table: Option<TableReferenceResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceResource {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Deserialize)]
struct JobConfigurationResource {
    query: Option<DestinationResource>,
    copy: Option<DestinationResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: Option<JobReferenceResource>,
    status: Option<JobStatusResource>,
    statistics: Option<JobStatisticsResource>,
    configuration: Option<JobConfigurationResource>,
}

impl JobResource {
    fn into_job(self, dry_run: bool) -> Result<Job> {
        let reference = match (dry_run, self.job_reference) {
            (false, Some(r)) => {
                let job_id = r
                    .job_id
                    .ok_or_else(|| WarehouseError::Decode("job has no jobId".into()))?;
                Some(JobRef::new(r.project_id, r.location, job_id))
            }
            (false, None) => {
                return Err(WarehouseError::Decode("job has no jobReference".into()));
            }
            (true, _) => None,
        };
        let status = self.status;
        let ended = dry_run
            || status
                .as_ref()
                .and_then(|s| s.state.as_deref())
                .is_some_and(|state| state == "DONE");
        let errors = status.map_or_else(Vec::new, |s| {
            if s.errors.is_empty() {
                s.error_result.iter().map(ErrorProto::describe).collect()
            } else {
                s.errors.iter().map(ErrorProto::describe).collect()
            }
        });
        let (kind, destination) = match self.configuration {
            Some(JobConfigurationResource { copy: Some(copy), .. }) => {
                (JobKind::Copy, copy.destination_table)
            }
            Some(JobConfigurationResource { query: Some(query), .. }) => {
                (JobKind::Query, query.destination_table)
            }
            _ => (JobKind::Query, None),
        };
        let statistics = self.statistics;
        let created = statistics
            .as_ref()
            .and_then(|s| s.creation_time.as_ref())
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let query_stats = statistics.as_ref().and_then(|s| s.query.as_ref());
        let total_bytes_processed = parse_u64(
            query_stats
                .and_then(|q| q.total_bytes_processed.as_ref())
                .or_else(|| statistics.as_ref().and_then(|s| s.total_bytes_processed.as_ref())),
        );
        let num_dml_affected_rows =
            parse_u64(query_stats.and_then(|q| q.num_dml_affected_rows.as_ref()));
        Ok(Job {
            reference,
            kind,
            created,
            ended,
            errors,
            destination: destination
                .map(|t| format!("{}.{}.{}", t.project_id, t.dataset_id, t.table_id)),
            total_bytes_processed,
            num_dml_affected_rows,
        })
    }
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReferenceResource>,
    job_complete: Option<bool>,
    schema: Option<QuerySchema>,
    #[serde(default)]
    rows: Vec<QueryRow>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

impl QueryResponse {
    fn check_errors(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(WarehouseError::JobFailed {
            job_id: self
                .job_reference
                .as_ref()
                .and_then(|r| r.job_id.clone())
                .unwrap_or_default(),
            errors: self.errors.iter().map(ErrorProto::describe).collect(),
        })
    }

    fn decode_rows(&mut self) -> Result<Vec<Row>> {
        let rows = std::mem::take(&mut self.rows);
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| WarehouseError::Decode("query rows without schema".into()))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                schema
                    .fields
                    .iter()
                    .zip(row.f)
                    .map(|(field, cell)| (field.name.clone(), cell.v))
                    .collect()
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    insert_errors: Option<Vec<RowInsertErrors>>,
}

#[derive(Debug, Deserialize)]
struct RowInsertErrors {
    index: u64,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

trait Paged {
    fn next_page_token(&self) -> Option<String>;
    fn names(self) -> Vec<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    next_page_token: Option<String>,
    #[serde(default)]
    datasets: Vec<DatasetListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

impl Paged for DatasetList {
    fn next_page_token(&self) -> Option<String> {
        self.next_page_token.clone()
    }

    fn names(self) -> Vec<String> {
        self.datasets
            .into_iter()
            .map(|d| d.dataset_reference.dataset_id)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    next_page_token: Option<String>,
    #[serde(default)]
    tables: Vec<TableListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReferenceResource,
}

impl Paged for TableList {
    fn next_page_token(&self) -> Option<String> {
        self.next_page_token.clone()
    }

    fn names(self) -> Vec<String> {
        self.tables
            .into_iter()
            .map(|t| t.table_reference.table_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_reference_keeps_partition_decorator() {
        let reference = table_reference("p.d.t$20240101").unwrap();
        assert_eq!(reference["projectId"], "p");
        assert_eq!(reference["datasetId"], "d");
        assert_eq!(reference["tableId"], "t$20240101");
    }

    #[test]
    fn partition_summary_uses_legacy_table_syntax() {
        assert_eq!(
            partition_summary_sql(&TableRef::new("p", "d", "t")),
            "SELECT partition_id FROM [p:d.t$__PARTITIONS_SUMMARY__]"
        );
    }

    #[test]
    fn table_resource_decodes_range_partitioning() {
        let resource: TableResource = serde_json::from_value(json!({
            "numBytes": "1024",
            "numRows": "3",
            "rangePartitioning": {
                "field": "bucket",
                "range": { "start": "0", "end": "100", "interval": "10" }
            },
            "clustering": { "fields": ["client_id"] },
            "schema": { "fields": [{ "name": "bucket" }, { "name": "client_id" }] }
        }))
        .unwrap();
        let meta = resource.into_metadata(TableRef::new("p", "d", "t"));
        assert_eq!(meta.num_bytes, Some(1024));
        assert_eq!(
            meta.partitioning,
            Some(Partitioning::Range {
                field: "bucket".into(),
                start: 0,
                end: 100,
                interval: 10
            })
        );
        assert_eq!(meta.clustering_fields, Some(vec!["client_id".to_string()]));
        assert!(meta.has_column("client_id"));
    }

    #[test]
    fn job_resource_decodes_done_query_with_errors() {
        let resource: JobResource = serde_json::from_value(json!({
            "jobReference": { "projectId": "billing", "jobId": "abc", "location": "US" },
            "status": {
                "state": "DONE",
                "errorResult": { "reason": "invalidQuery", "message": "bad" },
                "errors": [{ "reason": "invalidQuery", "message": "bad" }]
            },
            "statistics": {
                "creationTime": "1700000000000",
                "query": { "totalBytesProcessed": "42", "numDmlAffectedRows": "5" }
            },
            "configuration": { "query": {} }
        }))
        .unwrap();
        let job = resource.into_job(false).unwrap();
        assert!(job.ended);
        assert_eq!(job.errors, vec!["invalidQuery: bad".to_string()]);
        assert_eq!(job.total_bytes_processed, Some(42));
        assert_eq!(job.num_dml_affected_rows, Some(5));
        assert_eq!(job.reference.unwrap().full_id(), "billing:US.abc");
        assert_eq!(job.created.timestamp(), 1_700_000_000);
    }

    #[test]
    fn job_resource_decodes_copy_destination() {
        let resource: JobResource = serde_json::from_value(json!({
            "jobReference": { "projectId": "billing", "jobId": "cp" },
            "status": { "state": "RUNNING" },
            "configuration": { "copy": { "destinationTable": {
                "projectId": "p", "datasetId": "d", "tableId": "t$20240101"
            } } }
        }))
        .unwrap();
        let job = resource.into_job(false).unwrap();
        assert_eq!(job.kind, JobKind::Copy);
        assert!(!job.ended);
        assert_eq!(job.destination.as_deref(), Some("p.d.t$20240101"));
    }

    #[test]
    fn dry_run_job_has_no_reference() {
        let resource: JobResource = serde_json::from_value(json!({
            "jobReference": { "projectId": "billing" },
            "statistics": { "totalBytesProcessed": "9" }
        }))
        .unwrap();
        let job = resource.into_job(true).unwrap();
        assert!(job.reference.is_none());
        assert!(job.ended);
        assert_eq!(job.total_bytes_processed, Some(9));
    }

    #[test]
    fn query_response_rows_are_keyed_by_schema() {
        let mut response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": { "fields": [{ "name": "task_id" }, { "name": "job_id" }] },
            "rows": [{ "f": [{ "v": "p.d.t$1" }, { "v": "billing:US.j" }] }]
        }))
        .unwrap();
        let rows = response.decode_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["task_id"], "p.d.t$1");
        assert_eq!(rows[0]["job_id"], "billing:US.j");
    }
}
