//! Typed HTTP client for the trellis daemon REST API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::rest::{CancelResult, DeleteAccidents, DeleteResult, Health, ProvisionAccepted};
use crate::domain::monitoring::{Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::node::{NewNode, NodeView};
use crate::mesh::{MeshReport, MeshStatus};
use crate::node_log::LogPage;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// For endpoints that talk to nodes before answering: adding a node and
/// retrying its connection run an SSH check, a mesh sync visits every peer.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct TrellisClient {
    base_url: String,
    http: Client,
    remote_timeout: Duration,
}

impl TrellisClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeouts(base_url, REQUEST_TIMEOUT, REMOTE_TIMEOUT)
    }

    pub fn with_timeouts(base_url: &str, request: Duration, remote: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            remote_timeout: remote,
        })
    }

    pub async fn health(&self) -> Result<Health> {
        self.get("/health").await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeView>> {
        self.get("/api/v1/nodes").await
    }

    pub async fn node(&self, id: &str) -> Result<NodeView> {
        self.get(&format!("/api/v1/nodes/{id}")).await
    }

    pub async fn add_node(&self, req: &NewNode) -> Result<NodeView> {
        let url = self.url("/api/v1/nodes");
        let builder = self.http.post(&url).json(req).timeout(self.remote_timeout);
        self.fetch(builder, "POST", &url).await
    }

    pub async fn remove_node(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/api/v1/nodes/{id}"));
        self.send(self.http.delete(&url), "DELETE", &url).await?;
        Ok(())
    }

    pub async fn provision(&self, id: &str) -> Result<ProvisionAccepted> {
        self.post(&format!("/api/v1/nodes/{id}/provision")).await
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelResult> {
        self.post(&format!("/api/v1/nodes/{id}/cancel")).await
    }

    pub async fn retry_connection(&self, id: &str) -> Result<NodeView> {
        let url = self.url(&format!("/api/v1/nodes/{id}/retry-connection"));
        let builder = self.http.post(&url).timeout(self.remote_timeout);
        self.fetch(builder, "POST", &url).await
    }

    pub async fn logs(&self, id: &str, page: Option<usize>, page_size: Option<usize>) -> Result<LogPage> {
        let mut query = Vec::new();
        if let Some(page) = page {
            query.push(("page", page.to_string()));
        }
        if let Some(size) = page_size {
            query.push(("page_size", size.to_string()));
        }
        self.get_query(&format!("/api/v1/nodes/{id}/logs"), &query).await
    }

    pub async fn stats(&self, id: &str, limit: Option<usize>) -> Result<Vec<Stat>> {
        let query: Vec<(&str, String)> = limit.map(|l| ("limit", l.to_string())).into_iter().collect();
        self.get_query(&format!("/api/v1/nodes/{id}/stats"), &query).await
    }

    pub async fn pings(&self, id: &str, limit: Option<usize>) -> Result<Vec<Ping>> {
        let query: Vec<(&str, String)> = limit.map(|l| ("limit", l.to_string())).into_iter().collect();
        self.get_query(&format!("/api/v1/nodes/{id}/pings"), &query).await
    }

    pub async fn accidents(&self, filter: &AccidentQuery) -> Result<Page<Accident>> {
        let mut query = Vec::new();
        if let Some(ref node_id) = filter.node_id {
            query.push(("node_id", node_id.clone()));
        }
        if let Some(since) = filter.since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            query.push(("until", until.to_rfc3339()));
        }
        if let Some(resolved) = filter.resolved {
            query.push(("resolved", resolved.to_string()));
        }
        if let Some(page) = filter.page {
            query.push(("page", page.to_string()));
        }
        if let Some(size) = filter.page_size {
            query.push(("page_size", size.to_string()));
        }
        self.get_query("/api/v1/accidents", &query).await
    }

    pub async fn delete_accidents(&self, ids: Vec<String>) -> Result<DeleteResult> {
        self.post_json("/api/v1/accidents/delete", &DeleteAccidents { ids })
            .await
    }

    pub async fn sync_mesh(&self) -> Result<MeshReport> {
        let url = self.url("/api/v1/mesh/sync");
        let builder = self.http.post(&url).timeout(self.remote_timeout);
        self.fetch(builder, "POST", &url).await
    }

    pub async fn mesh_status(&self) -> Result<MeshStatus> {
        self.get("/api/v1/mesh/status").await
    }

    // ── Internal helpers ───────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_query(path, &[]).await
    }

    async fn get_query<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        self.fetch(self.http.get(&url).query(query), "GET", &url).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        self.fetch(self.http.post(&url), "POST", &url).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        self.fetch(self.http.post(&url).json(body), "POST", &url).await
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder, method: &str, url: &str) -> Result<T> {
        let resp = self.send(req, method, url).await?;
        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }

    /// Send a request; a non-success status becomes an error carrying the
    /// daemon's message.
    async fn send(&self, req: RequestBuilder, method: &str, url: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("{} {}", method, url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.is_empty() {
                bail!("{} returned {}", url, status);
            }
            bail!("{} returned {}: {}", url, status, body);
        }
        Ok(resp)
    }
}
