//! Document store (REST) client.
//!
//! `GET {api}/diagrams/{id}` returns the stored record; `PUT {api}/diagrams/{id}`
//! with `{ "modelJson": <document>, "aiRunId"?: "..." }` persists a snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug)]
pub enum RemoteStoreError {
    /// Request never completed (connect, timeout, body read)
    Transport(String),
    /// Non-success status, with the server's `error` message when it sent one
    Status { status: u16, message: String },
    /// Response body was not the expected JSON
    Decode(String),
    NotFound(String),
}

impl fmt::Display for RemoteStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Request failed: {msg}"),
            Self::Status { status, message } => write!(f, "HTTP {status}: {message}"),
            Self::Decode(msg) => write!(f, "Invalid response body: {msg}"),
            Self::NotFound(id) => write!(f, "Diagram not found: {id}"),
        }
    }
}

impl std::error::Error for RemoteStoreError {}

impl From<reqwest::Error> for RemoteStoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Stored diagram as returned by the document store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiagramRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "modelJson", alias = "model_json", alias = "model")]
    pub model: Value,
}

/// Body of a persistence write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    /// The document as a JSON object, not a string.
    pub model_json: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_run_id: Option<String>,
}

impl SaveRequest {
    /// Snapshots that fail to parse are sent as a JSON string.
    pub fn from_snapshot(snapshot: &str, ai_run_id: Option<String>) -> Self {
        let model_json = serde_json::from_str(snapshot)
            .unwrap_or_else(|_| Value::String(snapshot.to_string()));
        Self {
            model_json,
            ai_run_id,
        }
    }
}

#[async_trait]
pub trait DiagramStore: Send + Sync {
    async fn fetch(&self, document_id: &str) -> Result<DiagramRecord, RemoteStoreError>;

    async fn save(&self, document_id: &str, request: &SaveRequest) -> Result<(), RemoteStoreError>;
}

/// Joins `path` onto `base`, inserting `/api` unless the path already has it.
pub fn api_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if path.starts_with("/api") {
        format!("{base}{path}")
    } else {
        format!("{base}/api{path}")
    }
}

pub struct HttpDiagramStore {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpDiagramStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.is_empty());
        self
    }

    fn diagram_url(&self, document_id: &str) -> String {
        api_url(&self.base_url, &format!("/diagrams/{document_id}"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(
        document_id: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteStoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteStoreError::NotFound(document_id.to_string()));
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        Err(RemoteStoreError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DiagramStore for HttpDiagramStore {
    async fn fetch(&self, document_id: &str) -> Result<DiagramRecord, RemoteStoreError> {
        let url = self.diagram_url(document_id);
        log::debug!("GET {url}");
        let resp = self.authorize(self.client.get(&url)).send().await?;
        let resp = Self::check(document_id, resp).await?;
        Ok(resp.json::<DiagramRecord>().await?)
    }

    async fn save(&self, document_id: &str, request: &SaveRequest) -> Result<(), RemoteStoreError> {
        let url = self.diagram_url(document_id);
        log::debug!("PUT {url}");
        let resp = self
            .authorize(self.client.put(&url))
            .json(request)
            .send()
            .await?;
        Self::check(document_id, resp).await?;
        Ok(())
    }
}

/// In-process store with failure injection.
#[derive(Default)]
pub struct MemoryDiagramStore {
    records: Mutex<HashMap<String, Value>>,
    saves: Mutex<Vec<(String, SaveRequest)>>,
    fail_next_saves: Mutex<usize>,
}

impl MemoryDiagramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document_id: impl Into<String>, model: Value) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(document_id.into(), model);
        }
    }

    /// Make the next `count` saves fail with a transport error.
    pub fn fail_next_saves(&self, count: usize) {
        if let Ok(mut pending) = self.fail_next_saves.lock() {
            *pending = count;
        }
    }

    /// Successful saves, in order.
    pub fn saves(&self) -> Vec<(String, SaveRequest)> {
        self.saves.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn model(&self, document_id: &str) -> Option<Value> {
        self.records.lock().ok()?.get(document_id).cloned()
    }

    fn poisoned() -> RemoteStoreError {
        RemoteStoreError::Transport("in-memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl DiagramStore for MemoryDiagramStore {
    async fn fetch(&self, document_id: &str) -> Result<DiagramRecord, RemoteStoreError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        let model = records
            .get(document_id)
            .cloned()
            .ok_or_else(|| RemoteStoreError::NotFound(document_id.to_string()))?;
        Ok(DiagramRecord {
            id: Some(document_id.to_string()),
            name: None,
            model,
        })
    }

    async fn save(&self, document_id: &str, request: &SaveRequest) -> Result<(), RemoteStoreError> {
        {
            let mut pending = self.fail_next_saves.lock().map_err(|_| Self::poisoned())?;
            if *pending > 0 {
                *pending -= 1;
                return Err(RemoteStoreError::Transport("simulated network error".to_string()));
            }
        }
        self.records
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(document_id.to_string(), request.model_json.clone());
        self.saves
            .lock()
            .map_err(|_| Self::poisoned())?
            .push((document_id.to_string(), request.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_url_prefix() {
        assert_eq!(
            api_url("http://localhost:3000/", "/diagrams/d1"),
            "http://localhost:3000/api/diagrams/d1"
        );
        assert_eq!(
            api_url("http://localhost:3000", "api/diagrams/d1"),
            "http://localhost:3000/api/diagrams/d1"
        );
    }

    #[test]
    fn test_record_accepts_alternate_model_fields() {
        let a: DiagramRecord = serde_json::from_value(json!({"id": "d1", "modelJson": "{}"})).unwrap();
        assert_eq!(a.model, json!("{}"));
        let b: DiagramRecord = serde_json::from_value(json!({"model_json": {"class": "x"}})).unwrap();
        assert_eq!(b.model, json!({"class": "x"}));
        let c: DiagramRecord = serde_json::from_value(json!({"name": "empty"})).unwrap();
        assert!(c.model.is_null());
    }

    #[test]
    fn test_save_request_body() {
        let req = SaveRequest::from_snapshot(r#"{"nodeDataArray":[]}"#, None);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"modelJson": {"nodeDataArray": []}})
        );
        let tagged = SaveRequest::from_snapshot("not json", Some("run-7".into()));
        assert_eq!(
            serde_json::to_value(&tagged).unwrap(),
            json!({"modelJson": "not json", "aiRunId": "run-7"})
        );
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryDiagramStore::new();
        store.fail_next_saves(1);
        let req = SaveRequest::from_snapshot("{}", None);

        assert!(matches!(
            store.save("d1", &req).await,
            Err(RemoteStoreError::Transport(_))
        ));
        store.save("d1", &req).await.unwrap();
        assert_eq!(store.saves().len(), 1);
        assert_eq!(store.fetch("d1").await.unwrap().model, json!({}));
        assert!(matches!(
            store.fetch("missing").await,
            Err(RemoteStoreError::NotFound(_))
        ));
    }
}
