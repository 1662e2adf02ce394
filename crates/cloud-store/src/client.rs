//! PostgREST client for the central cloud database.
//!
//! Every table is addressed as `{base_url}/rest/v1/{table}`. Rows are matched
//! with `?{field}=eq.{value}` filters; the service key is sent both as
//! `apikey` and as a bearer token.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;

use edgesync_core::sync::{Identifier, JsonEncoding, Record, StoreAdapter};
use edgesync_core::StoreResult;

use crate::error::{CloudStoreError, Result};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const DEFAULT_PAGE_SIZE: usize = 1000;
const REST_PATH: &str = "rest/v1";

/// PostgREST error payload.
#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

/// The slice of the OpenAPI document served at the PostgREST root that we read.
#[derive(Debug, Default, Deserialize)]
struct OpenApiDocument {
    #[serde(default)]
    definitions: HashMap<String, OpenApiDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenApiDefinition {
    #[serde(default)]
    properties: HashMap<String, Value>,
}

fn body_preview(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Total from a `Content-Range` header (`0-24/573` or `*/0`).
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn eq_filter(identifier: &Identifier) -> String {
    format!(
        "{}=eq.{}",
        urlencoding::encode(&identifier.field),
        urlencoding::encode(&identifier.key())
    )
}

/// [`StoreAdapter`] over a PostgREST endpoint.
pub struct CloudStore {
    client: reqwest::Client,
    rest_url: String,
    service_key: String,
    page_size: usize,
    /// Column each table's snapshot is ordered by, so pages do not overlap.
    primary_keys: HashMap<String, String>,
    columns_cache: Mutex<Option<HashMap<String, HashSet<String>>>>,
}

impl CloudStore {
    /// Create a new cloud store client.
    ///
    /// * `base_url` - project URL, e.g. `https://xyz.supabase.co`
    /// * `service_key` - service-role key; bypasses row-level security
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self> {
        if service_key.trim().is_empty() {
            return Err(CloudStoreError::invalid_request("Service key is empty"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            rest_url: format!("{}/{}", base_url.trim_end_matches('/'), REST_PATH),
            service_key: service_key.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            primary_keys: HashMap::new(),
            columns_cache: Mutex::new(None),
        })
    }

    /// Orders paged snapshots of each listed table by its key column.
    pub fn with_primary_keys<I, T, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = (T, K)>,
        T: Into<String>,
        K: Into<String>,
    {
        self.primary_keys
            .extend(keys.into_iter().map(|(table, key)| (table.into(), key.into())));
        self
    }

    fn order_param(&self, table: &str) -> String {
        match self.primary_keys.get(table) {
            Some(key) => format!("&order={}.asc", urlencoding::encode(key)),
            None => String::new(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_value = HeaderValue::from_str(&self.service_key)
            .map_err(|_| CloudStoreError::invalid_request("Invalid service key format"))?;
        headers.insert("apikey", key_value);

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.service_key))
            .map_err(|_| CloudStoreError::invalid_request("Invalid service key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_url, urlencoding::encode(table))
    }

    /// Reads the body and turns non-2xx statuses into [`CloudStoreError::Api`].
    async fn check_response(response: reqwest::Response) -> Result<(HeaderMap, String)> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if status.is_success() {
            debug!("[CloudStore] Response status: {}", status);
            return Ok((headers, body));
        }

        debug!("[CloudStore] Response error ({}): {}", status, body_preview(&body));
        match serde_json::from_str::<PostgrestErrorBody>(&body) {
            Ok(error) => {
                let mut message = error.message.unwrap_or_else(|| "Request failed".to_string());
                if let Some(details) = error.details.filter(|d| !d.is_empty()) {
                    message = format!("{} ({})", message, details);
                }
                Err(CloudStoreError::api(status.as_u16(), error.code, message))
            }
            Err(_) => Err(CloudStoreError::api(
                status.as_u16(),
                None,
                format!("Request failed: {}", body_preview(&body)),
            )),
        }
    }

    /// Full table contents, fetched page by page. Each page is one request
    /// under the client timeout.
    pub async fn select_rows(&self, table: &str) -> Result<Vec<Record>> {
        let order = self.order_param(table);
        if order.is_empty() {
            warn!("[CloudStore] No key column known for {}; page order is not stable", table);
        }
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = format!(
                "{}?select=*{}&limit={}&offset={}",
                self.table_url(table),
                order,
                self.page_size,
                offset
            );
            let response = self.client.get(&url).headers(self.headers()?).send().await?;
            let (_, body) = Self::check_response(response).await?;
            let page: Vec<Record> = serde_json::from_str(&body)?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        debug!("[CloudStore] Selected {} row(s) from {}", rows.len(), table);
        Ok(rows)
    }

    pub async fn insert_row(&self, table: &str, record: &Record) -> Result<()> {
        let response = self
            .client
            .post(self.table_url(table))
            .headers(self.headers()?)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// PATCH by identifier. Returns the number of rows PostgREST updated.
    pub async fn update_row(
        &self,
        table: &str,
        identifier: &Identifier,
        patch: &Record,
    ) -> Result<u64> {
        // Only the key column comes back, enough to count the matched rows.
        let url = format!(
            "{}?{}&select={}",
            self.table_url(table),
            eq_filter(identifier),
            urlencoding::encode(&identifier.field)
        );
        let response = self
            .client
            .patch(&url)
            .headers(self.headers()?)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        let (_, body) = Self::check_response(response).await?;
        let updated: Vec<Value> = serde_json::from_str(&body)?;
        Ok(updated.len() as u64)
    }

    pub async fn delete_row(&self, table: &str, identifier: &Identifier) -> Result<()> {
        let url = format!("{}?{}", self.table_url(table), eq_filter(identifier));
        let response = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .header("Prefer", "return=minimal")
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Row count via `Prefer: count=exact`.
    pub async fn count_rows(&self, table: &str) -> Result<u64> {
        let url = format!("{}?select=*&limit=0", self.table_url(table));
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let (headers, _) = Self::check_response(response).await?;
        headers
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| CloudStoreError::invalid_request("Missing or malformed Content-Range header"))
    }

    /// Column names from the OpenAPI schema. The document is fetched once per client.
    pub async fn table_columns(&self, table: &str) -> Result<HashSet<String>> {
        if let Some(columns) = self.cached_columns(table) {
            return Ok(columns);
        }

        let response = self
            .client
            .get(format!("{}/", self.rest_url))
            .headers(self.headers()?)
            .header(ACCEPT, "application/openapi+json")
            .send()
            .await?;
        let (_, body) = Self::check_response(response).await?;
        let document: OpenApiDocument = serde_json::from_str(&body)?;
        let schema: HashMap<String, HashSet<String>> = document
            .definitions
            .into_iter()
            .map(|(name, definition)| (name, definition.properties.into_keys().collect()))
            .collect();
        debug!("[CloudStore] Loaded schema for {} table(s)", schema.len());

        let columns = schema.get(table).cloned();
        if let Ok(mut cache) = self.columns_cache.lock() {
            *cache = Some(schema);
        }
        columns.ok_or_else(|| {
            CloudStoreError::api(404, None, format!("Table '{}' is not exposed by the API", table))
        })
    }

    fn cached_columns(&self, table: &str) -> Option<HashSet<String>> {
        self.columns_cache
            .lock()
            .ok()
            .and_then(|cache| cache.as_ref().and_then(|schema| schema.get(table).cloned()))
    }
}

#[async_trait]
impl StoreAdapter for CloudStore {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn json_encoding(&self) -> JsonEncoding {
        JsonEncoding::Native
    }

    async fn select(&self, table: &str) -> StoreResult<Vec<Record>> {
        Ok(self.select_rows(table).await?)
    }

    async fn insert(&self, table: &str, record: &Record) -> StoreResult<()> {
        Ok(self.insert_row(table, record).await?)
    }

    async fn update(&self, table: &str, identifier: &Identifier, patch: &Record) -> StoreResult<u64> {
        Ok(self.update_row(table, identifier, patch).await?)
    }

    async fn delete(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        Ok(self.delete_row(table, identifier).await?)
    }

    async fn columns(&self, table: &str) -> StoreResult<HashSet<String>> {
        Ok(self.table_columns(table).await?)
    }

    async fn count(&self, table: &str) -> StoreResult<u64> {
        Ok(self.count_rows(table).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesync_core::StoreError;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        request_line: String,
        headers: HashMap<String, String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    struct MockResponse {
        status: u16,
        body: String,
        content_range: Option<String>,
    }

    impl MockResponse {
        fn json(status: u16, body: Value) -> Self {
            Self {
                status,
                body: body.to_string(),
                content_range: None,
            }
        }

        fn empty(status: u16) -> Self {
            Self {
                status,
                body: String::new(),
                content_range: None,
            }
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            request_line,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            401 => "Unauthorized",
            409 => "Conflict",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        response: &MockResponse,
    ) -> std::io::Result<()> {
        let content_range = response
            .content_range
            .as_ref()
            .map(|range| format!("Content-Range: {}\r\n", range))
            .unwrap_or_default();
        let raw = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            response.status,
            status_text(response.status),
            content_range,
            response.body.len(),
            response.body
        );
        stream.write_all(raw.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        responses: Vec<MockResponse>,
    ) -> (String, Arc<TokioMutex<Vec<CapturedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(responses)));
        let captured_clone = Arc::clone(&captured);

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let Some(request) = read_http_request(&mut stream).await else {
                    continue;
                };
                captured_clone.lock().await.push(request);
                let response = scripted.lock().await.pop_front().unwrap_or_else(|| {
                    MockResponse::json(500, json!({ "message": "unexpected request" }))
                });
                let _ = write_http_response(&mut stream, &response).await;
            }
        });

        (format!("http://{}", addr), captured)
    }

    fn client(base_url: &str) -> CloudStore {
        CloudStore::new(base_url, "service-key", Duration::from_secs(5)).expect("client")
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("0-24/573"), Some(573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
    }

    #[test]
    fn empty_service_key_is_rejected() {
        let result = CloudStore::new("http://localhost", " ", Duration::from_secs(1));
        assert!(matches!(result, Err(CloudStoreError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn insert_posts_the_record_with_service_credentials() {
        let (base_url, captured) = start_mock_server(vec![MockResponse::empty(201)]).await;
        let store = client(&base_url);

        store
            .insert("users", &record(json!({ "uuid": "u1", "email": "a@x.com" })))
            .await
            .expect("insert");

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_line, "POST /rest/v1/users HTTP/1.1");
        assert_eq!(requests[0].headers.get("apikey").map(String::as_str), Some("service-key"));
        assert_eq!(
            requests[0].headers.get("authorization").map(String::as_str),
            Some("Bearer service-key")
        );
        assert_eq!(
            requests[0].headers.get("prefer").map(String::as_str),
            Some("return=minimal")
        );
        let sent: Value = serde_json::from_str(&requests[0].body).expect("json body");
        assert_eq!(sent, json!({ "uuid": "u1", "email": "a@x.com" }));
    }

    #[tokio::test]
    async fn duplicate_insert_surfaces_unique_violation() {
        let (base_url, _captured) = start_mock_server(vec![MockResponse::json(
            409,
            json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint \"users_pkey\"",
                "details": "Key (uuid)=(u1) already exists."
            }),
        )])
        .await;
        let store = client(&base_url);

        let err = store
            .insert("users", &record(json!({ "uuid": "u1" })))
            .await
            .expect_err("conflict");

        assert!(err.is_unique_violation(), "{err:?}");
    }

    #[tokio::test]
    async fn update_and_delete_filter_on_the_encoded_identifier() {
        let (base_url, captured) = start_mock_server(vec![
            MockResponse::json(200, json!([{ "email": "a+b@x.com" }])),
            MockResponse::empty(204),
        ])
        .await;
        let store = client(&base_url);
        let id = Identifier::new("email", "a+b@x.com");

        let matched = store
            .update("users", &id, &record(json!({ "name": "A" })))
            .await
            .expect("update");
        store.delete("users", &id).await.expect("delete");

        assert_eq!(matched, 1);
        let requests = captured.lock().await;
        assert_eq!(
            requests[0].request_line,
            "PATCH /rest/v1/users?email=eq.a%2Bb%40x.com&select=email HTTP/1.1"
        );
        assert_eq!(
            requests[0].headers.get("prefer").map(String::as_str),
            Some("return=representation")
        );
        assert_eq!(requests[0].body, r#"{"name":"A"}"#);
        assert_eq!(
            requests[1].request_line,
            "DELETE /rest/v1/users?email=eq.a%2Bb%40x.com HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn update_reports_when_no_row_matched() {
        let (base_url, _captured) = start_mock_server(vec![MockResponse::json(200, json!([]))]).await;
        let store = client(&base_url);

        let matched = store
            .update("users", &Identifier::new("uuid", "u1"), &record(json!({ "name": "A" })))
            .await
            .expect("update");

        assert_eq!(matched, 0);
    }

    #[tokio::test]
    async fn select_pages_until_a_short_page() {
        let (base_url, captured) = start_mock_server(vec![
            MockResponse::json(200, json!([{ "id": 1 }, { "id": 2 }])),
            MockResponse::json(200, json!([{ "id": 3 }])),
        ])
        .await;
        let mut store = client(&base_url).with_primary_keys([("sites", "id")]);
        store.page_size = 2;

        let rows = store.select("sites").await.expect("select");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["id"], json!(3));
        let requests = captured.lock().await;
        assert_eq!(
            requests[0].request_line,
            "GET /rest/v1/sites?select=*&order=id.asc&limit=2&offset=0 HTTP/1.1"
        );
        assert_eq!(
            requests[1].request_line,
            "GET /rest/v1/sites?select=*&order=id.asc&limit=2&offset=2 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn count_reads_the_content_range_total() {
        let (base_url, captured) = start_mock_server(vec![MockResponse {
            status: 200,
            body: "[]".to_string(),
            content_range: Some("*/42".to_string()),
        }])
        .await;
        let store = client(&base_url);

        assert_eq!(store.count("users").await.expect("count"), 42);
        let requests = captured.lock().await;
        assert_eq!(requests[0].headers.get("prefer").map(String::as_str), Some("count=exact"));
    }

    #[tokio::test]
    async fn columns_come_from_the_cached_openapi_document() {
        let (base_url, captured) = start_mock_server(vec![MockResponse::json(
            200,
            json!({
                "swagger": "2.0",
                "definitions": {
                    "users": { "properties": { "uuid": {}, "email": {}, "name": {} } },
                    "sites": { "properties": { "id": {}, "slug": {} } }
                }
            }),
        )])
        .await;
        let store = client(&base_url);

        let users = store.columns("users").await.expect("users columns");
        let sites = store.columns("sites").await.expect("sites columns");

        assert_eq!(users.len(), 3);
        assert!(sites.contains("slug"));
        assert_eq!(captured.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn server_errors_map_to_unavailable() {
        let (base_url, _captured) = start_mock_server(vec![MockResponse::json(
            503,
            json!({ "message": "upstream unavailable" }),
        )])
        .await;
        let store = client(&base_url);

        let err = store.select("users").await.expect_err("unavailable");

        assert!(matches!(err, StoreError::Unavailable(_)), "{err:?}");
    }
}
