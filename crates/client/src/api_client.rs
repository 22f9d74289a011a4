//! Request/response boundary to the document store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crmsync_shared::{Document, FetchError, FetchJob, FetchParams, ResourceKey, WriteTarget};
use reqwest::Client;
use serde_json::Value;

/// Reads and writes against the document store.
///
/// The realtime core only depends on this trait; [`HttpFetchClient`] is the
/// production implementation.
#[async_trait]
pub trait FetchClient: Send + Sync + 'static {
    async fn get(&self, key: &ResourceKey, params: &FetchParams) -> Result<Vec<Document>, FetchError>;

    /// Upsert `data` into the documents matched by `target`; returns the stored document.
    async fn write(
        &self,
        key: &ResourceKey,
        target: &WriteTarget,
        data: &Document,
    ) -> Result<Document, FetchError>;

    /// Delete the documents matched by `target`; returns the store's acknowledgement.
    async fn remove(&self, key: &ResourceKey, target: &WriteTarget) -> Result<Value, FetchError>;
}

/// Supplies the bearer token for each request. Token issuance and refresh
/// live outside this crate.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn bearer_token(&self) -> Option<String>;
}

/// [`FetchClient`] posting [`FetchJob`] descriptors to a single JSON endpoint.
#[derive(Clone)]
pub struct HttpFetchClient {
    client: Client,
    endpoint: String,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl HttpFetchClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            tokens: None,
        }
    }

    /// Build a client whose requests give up after `timeout`.
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            tokens: None,
        })
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST a job and return the decoded JSON body (`null` for an empty body).
    async fn run_job(&self, job: &FetchJob) -> Result<Value, FetchError> {
        let mut rb = self.client.post(&self.endpoint).json(job);
        if let Some(tokens) = &self.tokens {
            if let Some(token) = tokens.bearer_token().await {
                rb = rb.bearer_auth(token);
            }
        }

        let resp = rb.send().await.map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(FetchError::Http { status, body: text });
        }

        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| FetchError::Deserialize(e.to_string()))?
        };
        rejection(&value).map_or(Ok(value), Err)
    }
}

/// A 2xx body of the form `{ "error": "..." }` is a refusal.
fn rejection(value: &Value) -> Option<FetchError> {
    match value.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(FetchError::Rejected(message.clone())),
        other => Some(FetchError::Rejected(other.to_string())),
    }
}

/// Accept a bare array or an array wrapped as `{ "data": [...] }`.
fn into_documents(value: Value) -> Result<Vec<Document>, FetchError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => return Err(FetchError::Deserialize("expected an array of documents".into())),
        },
        Value::Null => Vec::new(),
        other => {
            return Err(FetchError::Deserialize(format!(
                "expected an array of documents, got {other}"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(doc) => Ok(doc),
            other => Err(FetchError::Deserialize(format!("expected a document, got {other}"))),
        })
        .collect()
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn get(&self, key: &ResourceKey, params: &FetchParams) -> Result<Vec<Document>, FetchError> {
        let value = self.run_job(&FetchJob::get(key, params)).await?;
        let docs = into_documents(value)?;
        crate::log_debug!("{}: fetched {} document(s)", key, docs.len());
        Ok(docs)
    }

    async fn write(
        &self,
        key: &ResourceKey,
        target: &WriteTarget,
        data: &Document,
    ) -> Result<Document, FetchError> {
        match self.run_job(&FetchJob::upsert(key, target, data)).await? {
            Value::Object(doc) => Ok(doc),
            // Stores that answer an upsert without a body accepted the data as sent.
            Value::Null => Ok(data.clone()),
            other => Err(FetchError::Deserialize(format!(
                "expected the stored document, got {other}"
            ))),
        }
    }

    async fn remove(&self, key: &ResourceKey, target: &WriteTarget) -> Result<Value, FetchError> {
        self.run_job(&FetchJob::delete(key, target)).await
    }
}

impl std::fmt::Debug for HttpFetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetchClient")
            .field("endpoint", &self.endpoint)
            .field("token_provider", &self.tokens.is_some())
            .finish()
    }
}
