use crate::model::{AlertRule, AlertRuleInput, EntityId, RosterEntry, Sample, Stats};
use crate::poll::{FetchError, SampleFetcher};
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid request: {0}")]
    Validation(String),
}

pub struct DashboardApi {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl DashboardApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, base_url, timeout)
    }

    pub fn with_client(client: Client, base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Validation(format!("server_url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Validation(format!(
                "server_url '{base_url}' cannot be used as a base URL"
            )));
        }
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub async fn list_clients(&self) -> Result<Vec<RosterEntry>, ApiError> {
        self.get(&["api", "clients"], &[]).await
    }

    pub async fn latest_samples(&self, id: &EntityId) -> Result<Vec<Sample>, ApiError> {
        self.get(&["api", "metrics", id.as_str(), "latest"], &[])
            .await
    }

    pub async fn history(&self, id: &EntityId, hours: Option<u32>) -> Result<Vec<Sample>, ApiError> {
        let query = hours_query(hours);
        self.get(&["api", "metrics", id.as_str()], &query).await
    }

    pub async fn stats(&self, id: &EntityId, hours: Option<u32>) -> Result<Vec<Stats>, ApiError> {
        let query = hours_query(hours);
        self.get(&["api", "stats", id.as_str()], &query).await
    }

    pub async fn alert_rules(&self) -> Result<Vec<AlertRule>, ApiError> {
        self.get(&["api", "alerts"], &[]).await
    }

    pub async fn create_alert_rule(&self, rule: &AlertRuleInput) -> Result<AlertRule, ApiError> {
        rule.validate()
            .map_err(|e| ApiError::Validation(e.to_string()))?;
        let response = self
            .client
            .post(self.url(&["api", "alerts"])?)
            .timeout(self.timeout)
            .json(rule)
            .send()
            .await?;
        parse_json(response).await
    }

    pub async fn delete_alert_rule(&self, id: i64) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.url(&["api", "alerts", &id.to_string()])?)
            .timeout(self.timeout)
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }

    pub async fn settings(&self) -> Result<HashMap<String, String>, ApiError> {
        self.get(&["api", "settings"], &[]).await
    }

    pub async fn update_settings(&self, settings: &HashMap<String, String>) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&["api", "settings"])?)
            .timeout(self.timeout)
            .json(settings)
            .send()
            .await?;
        ensure_success(response).await.map(|_| ())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.url(segments)?)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await?;
        parse_json(response).await
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::Validation("server_url has no path".to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }
}

#[async_trait]
impl SampleFetcher for DashboardApi {
    async fn fetch(&self, id: &EntityId) -> Result<Vec<Sample>, FetchError> {
        Ok(self.latest_samples(id).await?)
    }
}

fn hours_query(hours: Option<u32>) -> Vec<(&'static str, String)> {
    hours
        .map(|h| vec![("hours", h.to_string())])
        .unwrap_or_default()
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<T>().await?)
}
