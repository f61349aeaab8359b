//! Content-store adapter (WordPress-style REST API).

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{Config, PostTypes};
use crate::error::SyncError;
use crate::model::EntityType;
use crate::resilience::Guard;

pub mod model;

pub use model::RecordPayload;
use model::{is_blank, PostRef};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create a record tagged with `external_id`; returns the store's id.
    async fn create_record(
        &self,
        entity: EntityType,
        external_id: i64,
        payload: &RecordPayload,
    ) -> Result<String, SyncError>;

    /// Partial update: only non-blank fields are sent.
    async fn update_record(
        &self,
        entity: EntityType,
        internal_id: &str,
        payload: &RecordPayload,
    ) -> Result<(), SyncError>;

    async fn find_by_external_id(
        &self,
        entity: EntityType,
        external_id: i64,
    ) -> Result<Option<String>, SyncError>;

    /// Authenticated reachability check used before a run starts.
    async fn ping(&self) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct WordPressClient {
    http: Client,
    base_url: Url,
    token: String,
    external_id_key: String,
    post_types: PostTypes,
    guard: Option<Guard>,
}

impl fmt::Debug for WordPressClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordPressClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WordPressClient {
    pub fn new(cfg: &Config, guard: Option<Guard>) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(&cfg.content_store.base_url).context("invalid content_store.base_url")?;
        let client = Self::with_base_url(
            base_url,
            cfg.content_store.token.clone(),
            cfg.content_store.external_id_key.clone(),
            cfg.content_store.post_types.clone(),
        )?;
        Ok(match guard {
            Some(guard) => client.with_guard(guard),
            None => client,
        })
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_base_url(
        base_url: Url,
        token: String,
        external_id_key: String,
        post_types: PostTypes,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("esi-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()
            .context("building content store http client")?;
        Ok(Self {
            http,
            base_url,
            token,
            external_id_key,
            post_types,
            guard: None,
        })
    }

    fn post_type(&self, entity: EntityType) -> &str {
        self.post_types.for_entity(entity)
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Validation(format!("bad content store path {path}: {e}")))
    }

    pub fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, SyncError> {
        let mut builder = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .build()
            .map_err(|e| SyncError::Validation(format!("failed to build request: {e}")))
    }

    async fn send(&self, request: reqwest::Request) -> Result<Value, SyncError> {
        debug!(method = %request.method(), url = %request.url().path(), "content store request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SyncError::TransientNetwork(e.to_string()))?;
        let status = res.status();
        if status.is_success() {
            return res
                .json::<Value>()
                .await
                .map_err(|e| SyncError::TransientNetwork(format!("unreadable response: {e}")));
        }
        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    /// Build and send one request, through the breaker and retry policy when
    /// configured.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let url = self.url_with_query(path, query)?;
        let attempt = || {
            let request = self.build_request(method.clone(), url.clone(), body);
            async move {
                match request {
                    Ok(request) => self.send(request).await,
                    Err(e) => Err(e),
                }
            }
        };
        match &self.guard {
            Some(guard) => guard.call(attempt).await,
            None => attempt().await,
        }
    }

    /// Like `call`, but never repeats the request. A lost response to a
    /// create may still have created the record.
    async fn call_once(&self, method: Method, path: &str, body: &Value) -> Result<Value, SyncError> {
        let request = self.build_request(method, self.url(path)?, Some(body))?;
        match &self.guard {
            Some(guard) => guard.call_once(self.send(request)).await,
            None => self.send(request).await,
        }
    }

    fn url_with_query(&self, path: &str, query: &[(&str, String)]) -> Result<Url, SyncError> {
        let mut url = self.url(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

fn classify_status(status: StatusCode, body: String) -> SyncError {
    match status.as_u16() {
        401 | 403 => {
            warn!(%status, "content store rejected credentials");
            SyncError::ContentStoreAuth(format!("{status}: {body}"))
        }
        429 | 500..=599 => {
            warn!(%status, "content store unavailable");
            SyncError::TransientNetwork(format!("{status}: {body}"))
        }
        // Rejection of one record says nothing about the store's health.
        code => SyncError::Validation(format!("content store rejected request ({code}): {body}")),
    }
}

/// Request body for create/update. Blank title and meta values are omitted;
/// an update sends `null` for cleared keys, which deletes the stored meta.
pub fn build_record_body(
    payload: &RecordPayload,
    external_id_key: &str,
    external_id: Option<i64>,
) -> Value {
    let mut meta = Map::new();
    if let Some(id) = external_id {
        meta.insert(external_id_key.to_string(), json!(id));
    }
    for (key, value) in &payload.meta {
        if !is_blank(value) {
            meta.insert(key.clone(), value.clone());
        }
    }
    if external_id.is_none() {
        for key in &payload.cleared {
            meta.insert(key.clone(), Value::Null);
        }
    }

    let mut body = Map::new();
    if let Some(title) = payload.title.as_deref().filter(|t| !t.trim().is_empty()) {
        body.insert("title".into(), json!(title));
    }
    if external_id.is_some() {
        body.insert("status".into(), json!("publish"));
    }
    if !meta.is_empty() {
        body.insert("meta".into(), Value::Object(meta));
    }
    Value::Object(body)
}

fn first_id(value: &Value) -> Option<String> {
    let first = match value {
        Value::Array(items) => items.first()?.clone(),
        other => other.clone(),
    };
    serde_json::from_value::<PostRef>(first)
        .ok()
        .and_then(|r| r.id_string())
}

#[async_trait]
impl ContentStore for WordPressClient {
    async fn create_record(
        &self,
        entity: EntityType,
        external_id: i64,
        payload: &RecordPayload,
    ) -> Result<String, SyncError> {
        let body = build_record_body(payload, &self.external_id_key, Some(external_id));
        let path = self.post_type(entity).to_string();
        let created = self.call_once(Method::POST, &path, &body).await?;
        first_id(&created).ok_or_else(|| {
            SyncError::ContentStore(format!("create {entity}/{external_id} returned no id"))
        })
    }

    async fn update_record(
        &self,
        entity: EntityType,
        internal_id: &str,
        payload: &RecordPayload,
    ) -> Result<(), SyncError> {
        let body = build_record_body(payload, &self.external_id_key, None);
        let path = format!("{}/{}", self.post_type(entity), internal_id);
        self.call(Method::POST, &path, &[], Some(&body)).await?;
        Ok(())
    }

    async fn find_by_external_id(
        &self,
        entity: EntityType,
        external_id: i64,
    ) -> Result<Option<String>, SyncError> {
        let path = self.post_type(entity).to_string();
        let query = [
            ("meta_key", self.external_id_key.clone()),
            ("meta_value", external_id.to_string()),
            ("status", "any".to_string()),
            ("per_page", "1".to_string()),
            ("_fields", "id".to_string()),
        ];
        let found = self.call(Method::GET, &path, &query, None).await?;
        Ok(first_id(&found))
    }

    async fn ping(&self) -> Result<(), SyncError> {
        // The index route answers anonymous requests; this one checks the token.
        self.call(Method::GET, "users/me", &[("context", "edit".to_string())], None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_types() -> PostTypes {
        PostTypes {
            character: "eve_character".into(),
            corporation: "eve_corporation".into(),
            blueprint: "eve_blueprint".into(),
            planet: "eve_planet".into(),
            contract: "eve_contract".into(),
        }
    }

    #[test]
    fn create_body_tags_external_id() {
        let payload = RecordPayload::titled("Rifter Blueprint")
            .with("runs", -1)
            .with("location_flag", "Hangar");
        let body = build_record_body(&payload, "_eve_external_id", Some(1001));
        assert_eq!(body["title"], "Rifter Blueprint");
        assert_eq!(body["status"], "publish");
        assert_eq!(body["meta"]["_eve_external_id"], 1001);
        assert_eq!(body["meta"]["runs"], -1);
    }

    #[test]
    fn blank_fields_are_omitted() {
        let payload = RecordPayload::titled("  ")
            .with("description", "")
            .with("alliance_id", Value::Null)
            .with("items", json!([]))
            .with("member_count", 12);
        let body = build_record_body(&payload, "_eve_external_id", None);
        assert!(body.get("title").is_none());
        assert!(body.get("status").is_none());
        let meta = body["meta"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta["member_count"], 12);
    }

    #[test]
    fn cleared_keys_are_nulled_on_update_only() {
        let mut payload = RecordPayload::titled("Contract 7").with("is_outbid", false);
        payload.set_or_clear("suggested_price", None::<f64>);
        payload.set_or_clear("competitor_price", Some(90.0));

        let update = build_record_body(&payload, "_eve_external_id", None);
        assert_eq!(update["meta"]["suggested_price"], Value::Null);
        assert_eq!(update["meta"]["competitor_price"], 90.0);
        assert_eq!(update["meta"]["is_outbid"], false);

        let create = build_record_body(&payload, "_eve_external_id", Some(7));
        assert!(!create["meta"]
            .as_object()
            .unwrap()
            .contains_key("suggested_price"));
    }

    #[test]
    fn first_id_accepts_array_or_object() {
        assert_eq!(first_id(&json!([{ "id": 12 }])), Some("12".into()));
        assert_eq!(first_id(&json!({ "id": "abc" })), Some("abc".into()));
        assert_eq!(first_id(&json!([])), None);
    }

    #[test]
    fn build_request_sets_headers() {
        let client = WordPressClient::with_base_url(
            Url::parse("https://cms.example.test/wp-json/wp/v2/").unwrap(),
            "token".into(),
            "_eve_external_id".into(),
            post_types(),
        )
        .unwrap();
        let url = client.url("eve_blueprint/5").unwrap();
        let request = client
            .build_request(Method::POST, url, Some(&json!({ "title": "x" })))
            .unwrap();
        assert_eq!(request.url().path(), "/wp-json/wp/v2/eve_blueprint/5");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn record_rejections_do_not_look_like_outages() {
        let err = classify_status(StatusCode::BAD_REQUEST, "bad meta".into());
        assert!(!err.counts_against_breaker());
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new());
        assert!(matches!(err, SyncError::TransientNetwork(_)));
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_status(status, "rest_forbidden".into());
            assert!(matches!(err, SyncError::ContentStoreAuth(_)));
            assert!(err.is_source_fatal());
        }
    }
}
