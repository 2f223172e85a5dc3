use super::{normalize_doi, PaperMetadata, PaperQuery, ProviderOutcome, SourceProvider};
use crate::error::{classify_reqwest, classify_status};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::instrument;

/// Unpaywall open-access lookup. DOI-only: given a DOI it returns the best
/// known legal OA copy, so it backs both direct DOI fetches and the
/// secondary lookup after a title search recovers a DOI.
pub struct UnpaywallProvider {
    client: reqwest::Client,
    base_url: String,
    email: String,
}

impl UnpaywallProvider {
    pub fn new(user_agent: &str, contact_email: &str, timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.unpaywall.org", user_agent, contact_email, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        contact_email: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build unpaywall client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: contact_email.to_string(),
        })
    }

    async fn lookup(&self, doi: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/v2/{}?email={}",
            self.base_url,
            urlencoding::encode(doi),
            urlencoding::encode(&self.email)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(ProviderOutcome::NotFound {
                reason: "doi unknown to unpaywall".to_string(),
                doi: None,
                metadata: None,
            });
        }
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(classify_status(
                status.as_u16(),
                retry_after.as_deref(),
                self.name(),
                "unpaywall lookup failed",
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;

        let doi = body
            .get("doi")
            .and_then(Value::as_str)
            .map(normalize_doi)
            .unwrap_or_else(|| doi.to_string());
        let metadata = PaperMetadata {
            title: body.get("title").and_then(Value::as_str).map(str::to_string),
            authors: Vec::new(),
            journal: body
                .get("journal_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            year: body.get("year").and_then(Value::as_u64).map(|y| y as u32),
            doi: Some(doi.clone()),
            abstract_text: None,
        };

        // Prefer the direct PDF of the best location, fall back to any
        // OA location that carries one
        let pdf_url = body
            .pointer("/best_oa_location/url_for_pdf")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                body.get("oa_locations")
                    .and_then(Value::as_array)
                    .and_then(|locations| {
                        locations
                            .iter()
                            .find_map(|l| l.get("url_for_pdf").and_then(Value::as_str))
                    })
                    .map(str::to_string)
            });

        Ok(match pdf_url {
            Some(pdf_url) => ProviderOutcome::Found { pdf_url, metadata },
            None => ProviderOutcome::NotFound {
                reason: "no open-access pdf recorded".to_string(),
                doi: Some(doi),
                metadata: Some(metadata),
            },
        })
    }
}

#[async_trait]
impl SourceProvider for UnpaywallProvider {
    fn name(&self) -> &str {
        "unpaywall"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn supports_doi_lookup(&self) -> bool {
        true
    }

    #[instrument(skip(self, query))]
    async fn invoke(&self, query: &PaperQuery) -> Result<ProviderOutcome> {
        match &query.doi {
            Some(doi) => self.lookup(doi).await,
            // No remote call for title queries; this source is keyed by DOI
            None => Ok(ProviderOutcome::NotFound {
                reason: "unpaywall requires a doi".to_string(),
                doi: None,
                metadata: None,
            }),
        }
    }
}
