//! HTTP client for the reporting service

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;
use viewmetrics_shared::{Dataset, FetchError, MetricsError, Result};

use crate::{check_view_id, ViewSource};

/// Fetches view data as JSON records from `{base_url}/api/views/{view_id}/data`
pub struct HttpViewSource {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpViewSource {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| MetricsError::Config(format!("invalid source base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(MetricsError::Config(format!(
                "source base_url '{base_url}' cannot be used as a base"
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn view_url(&self, view_id: &str) -> std::result::Result<Url, FetchError> {
        self.base_url
            .join(&format!("api/views/{view_id}/data"))
            .map_err(|e| FetchError::new(view_id, format!("invalid view URL: {e}")))
    }
}

#[async_trait]
impl ViewSource for HttpViewSource {
    async fn fetch_view(&self, view_id: &str) -> std::result::Result<Dataset, FetchError> {
        check_view_id(view_id)?;
        let url = self.view_url(view_id)?;
        tracing::debug!(view_id, url = %url, "Fetching view data");

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::new(view_id, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(view_id, %status, "Reporting service rejected view request");
            return Err(FetchError::new(
                view_id,
                format!("reporting service returned {status}"),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FetchError::new(view_id, format!("invalid response body: {e}")))?;

        let dataset = Dataset::from_records_value(&body)
            .map_err(|e| FetchError::new(view_id, e.to_string()))?;

        tracing::debug!(view_id, rows = dataset.len(), "Fetched view data");
        Ok(dataset)
    }

    fn source_name(&self) -> &'static str {
        "http"
    }
}
