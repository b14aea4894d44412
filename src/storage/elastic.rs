//! Elasticsearch REST client for the document store seam.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::{DocumentStore, Hit, SearchQuery, SortOrder, StoreError};
use crate::config::StoreConfig;

pub struct ElasticStore {
    client: Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
    timestamp_field: String,
    severity_term_field: String,
}

impl ElasticStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
            timestamp_field: config.timestamp_field.clone(),
            severity_term_field: config.severity_term_field.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, pass.as_deref()),
            None => req,
        }
    }

    /// Translate a query into the Elasticsearch search DSL.
    pub fn search_body(&self, query: &SearchQuery) -> Value {
        let mut filters = Vec::new();
        if let Some(after) = &query.after {
            filters.push(json!({
                "range": { self.timestamp_field.as_str(): {
                    "gt": after.to_rfc3339_opts(SecondsFormat::AutoSi, true)
                } }
            }));
        }
        if let Some(severity) = &query.severity {
            filters.push(json!({
                "term": { self.severity_term_field.as_str(): severity.as_str() }
            }));
        }
        let order = match query.sort {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        let clause = if filters.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({ "bool": { "filter": filters } })
        };
        json!({
            "size": query.size,
            "sort": [{ self.timestamp_field.as_str(): order }],
            "query": clause,
        })
    }
}

async fn send(req: RequestBuilder) -> Result<reqwest::Response, StoreError> {
    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            StoreError::Connection(format!("request timed out: {}", e))
        } else {
            StoreError::Connection(e.to_string())
        }
    })?;
    Ok(resp)
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Pull `hits.hits[]` out of a search response.
pub fn parse_hits(body: &Value) -> Result<Vec<Hit>, StoreError> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Decode("search response has no hits.hits array".to_string()))?;

    Ok(hits
        .iter()
        .map(|h| Hit {
            index: h.get("_index").and_then(Value::as_str).unwrap_or_default().to_string(),
            id: h.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
            source: h.get("_source").cloned().unwrap_or(Value::Null),
        })
        .collect())
}

#[async_trait::async_trait]
impl DocumentStore for ElasticStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let resp = send(self.authed(self.client.get(self.url("/")))).await?;
        check(resp).await?;
        Ok(())
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
        let req = self
            .client
            .post(self.url(&format!("{}/_search", index)))
            .query(&[("ignore_unavailable", "true")])
            .json(&self.search_body(query));
        let resp = check(send(self.authed(req)).await?).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        parse_hits(&body)
    }

    async fn index(&self, index: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        let req = self
            .client
            .put(self.url(&format!("{}/_doc/{}", index, id)))
            .json(document);
        check(send(self.authed(req)).await?).await?;
        Ok(())
    }

    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError> {
        let req = self.client.head(self.url(&format!("{}/_doc/{}", index, id)));
        let resp = send(self.authed(req)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check(resp).await.map(|_| true),
        }
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        let req = self
            .client
            .post(self.url(&format!("{}/_refresh", index)))
            .query(&[("ignore_unavailable", "true")]);
        check(send(self.authed(req)).await?).await?;
        Ok(())
    }
}
