use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::recipe::Recipe;

/// The control-plane-issued tuple directing a worker which families to
/// emit at what rate. Replaces the previous assignment atomically on
/// change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub worker_id: String,
    #[serde(default)]
    pub families: Vec<String>,
    pub multiplier: f64,
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,
    #[serde(default)]
    pub schema_drift: f64,
    #[serde(default)]
    pub error_injection: f64,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_burst_factor() -> f64 {
    1.0
}

impl Assignment {
    /// Change detection: two assignments describe the same work when
    /// their families, multiplier, and burst factor match.
    pub fn same_work(&self, other: &Assignment) -> bool {
        self.families == other.families
            && self.multiplier == other.multiplier
            && self.burst_factor == other.burst_factor
    }
}

/// One entry of the recipe catalog listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeSummary {
    pub family_id: String,
    #[serde(default)]
    pub metric_name: String,
}

/// Callback type for recording control-plane request metrics:
/// (endpoint_name, status).
pub type MetricsCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// HTTP client for the control-plane REST API.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: parking_lot::RwLock<Option<String>>,
    metrics: Option<MetricsCallback>,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: parking_lot::RwLock::new(None),
            metrics: None,
        })
    }

    /// Sets a metrics callback receiving (endpoint_name, status).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    /// Applies the assignment-supplied credential to subsequent requests.
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    fn record_request(&self, endpoint: &str, status: &str) {
        if let Some(cb) = &self.metrics {
            cb(endpoint, status);
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).header("Accept", "application/json");

        if let Some(token) = self.auth_token.read().clone() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        request
            .send()
            .await
            .with_context(|| format!("requesting {path}"))
    }

    /// Fetches the worker's current assignment; 404 means none yet.
    pub async fn fetch_assignment(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let path = format!("/api/v1/workers/{worker_id}/assignment");
        let endpoint = "assignment";

        let response = match self.get(&path).await {
            Ok(r) => r,
            Err(e) => {
                self.record_request(endpoint, "error");
                return Err(e);
            }
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.record_request(endpoint, "none");
            return Ok(None);
        }

        if !response.status().is_success() {
            self.record_request(endpoint, "error");
            bail!("assignment poll returned status {}", response.status());
        }

        let assignment: Assignment = response
            .json()
            .await
            .context("decoding assignment")
            .inspect_err(|_| self.record_request(endpoint, "error"))?;

        self.record_request(endpoint, "success");
        Ok(Some(assignment))
    }

    /// Fetches and validates one family recipe. Bodies may arrive
    /// zstd-compressed (`Content-Encoding: zstd`).
    pub async fn fetch_recipe(&self, family_id: &str) -> Result<Recipe> {
        let path = format!("/api/v1/recipes/{family_id}");
        let endpoint = "recipe";

        let response = match self.get(&path).await {
            Ok(r) => r,
            Err(e) => {
                self.record_request(endpoint, "error");
                return Err(e);
            }
        };

        if !response.status().is_success() {
            self.record_request(endpoint, "error");
            bail!(
                "recipe fetch for {family_id} returned status {}",
                response.status(),
            );
        }

        let compressed = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("zstd"));

        let body = response.bytes().await.context("reading recipe body")?;
        let raw = if compressed {
            zstd::decode_all(&body[..]).context("decompressing recipe body")?
        } else {
            body.to_vec()
        };

        let recipe = Recipe::from_json(&raw)
            .with_context(|| format!("loading recipe for family {family_id}"))
            .inspect_err(|_| self.record_request(endpoint, "error"))?;

        self.record_request(endpoint, "success");
        Ok(recipe)
    }

    /// Lists the recipe catalog.
    pub async fn list_recipes(&self) -> Result<Vec<RecipeSummary>> {
        let endpoint = "recipes";

        let response = match self.get("/api/v1/recipes").await {
            Ok(r) => r,
            Err(e) => {
                self.record_request(endpoint, "error");
                return Err(e);
            }
        };

        if !response.status().is_success() {
            self.record_request(endpoint, "error");
            bail!("recipe list returned status {}", response.status());
        }

        let summaries: Vec<RecipeSummary> = response
            .json()
            .await
            .context("decoding recipe list")
            .inspect_err(|_| self.record_request(endpoint, "error"))?;

        self.record_request(endpoint, "success");
        Ok(summaries)
    }
}
