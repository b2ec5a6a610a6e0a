//! FHIR REST search as a data source.
//!
//! Issues `GET {base}/{resourceType}?_lastUpdated=ge{start}&_lastUpdated=lt{end}`
//! searches sorted by `_lastUpdated` and follows the bundle's `next` link as the
//! continuation token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use super::{DataSource, SourceError, SourcePage};
use crate::config::SourceConfig;
use crate::jobs::DataPeriod;

#[derive(Debug, Deserialize)]
struct Bundle {
    #[serde(default)]
    entry: Vec<BundleEntry>,
    #[serde(default)]
    link: Vec<BundleLink>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    resource: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

pub struct FhirApiDataSource {
    client: reqwest::Client,
    base_url: Url,
    page_size: u32,
}

impl FhirApiDataSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SourceError::fatal(format!("failed to build HTTP client: {e}")))?;

        let base_url = config
            .parsed_base_url()
            .map_err(|e| SourceError::fatal(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size,
        })
    }

    fn search_url(&self, resource_type: &str, period: &DataPeriod) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::fatal(format!("base url {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .push(resource_type);

        url.query_pairs_mut()
            .append_pair(
                "_lastUpdated",
                &format!("ge{}", period.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            )
            .append_pair(
                "_lastUpdated",
                &format!("lt{}", period.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            )
            .append_pair("_count", &self.page_size.to_string())
            .append_pair("_sort", "_lastUpdated");

        Ok(url)
    }

    /// Continuation links must point back at the configured server.
    fn continuation_url(&self, token: &str) -> Result<Url, SourceError> {
        let url = Url::parse(token)
            .map_err(|e| SourceError::fatal(format!("invalid continuation link: {e}")))?;

        if url.origin() != self.base_url.origin() {
            return Err(SourceError::fatal(format!(
                "continuation link {url} leaves the configured server"
            )));
        }
        Ok(url)
    }
}

#[async_trait]
impl DataSource for FhirApiDataSource {
    async fn fetch(
        &self,
        resource_type: &str,
        period: &DataPeriod,
        continuation_token: Option<&str>,
    ) -> Result<SourcePage, SourceError> {
        let url = match continuation_token.filter(|t| !t.is_empty()) {
            Some(token) => self.continuation_url(token)?,
            None => self.search_url(resource_type, period)?,
        };
        debug!(resource_type, url = %url, "Fetching FHIR search page");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|e| SourceError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.ok();
            return Err(SourceError::from_status(status.as_u16(), body, retry_after));
        }

        let bundle: Bundle = response
            .json()
            .await
            .map_err(|e| SourceError::fatal(format!("malformed search bundle: {e}")))?;

        let next_continuation_token = bundle
            .link
            .into_iter()
            .find(|link| link.relation == "next")
            .map(|link| link.url)
            .filter(|url| !url.is_empty());

        Ok(SourcePage {
            records: bundle.entry.into_iter().filter_map(|e| e.resource).collect(),
            next_continuation_token,
        })
    }
}
