use super::{
    is_title_match, normalize_doi, PaperMetadata, PaperQuery, ProviderOutcome, SourceProvider,
};
use crate::error::{classify_reqwest, classify_status};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// OpenAlex works search. No authentication, generous limits, and the
/// `open_access` block points straight at a free full text when one exists.
pub struct OpenAlexProvider {
    client: reqwest::Client,
    base_url: String,
    mailto: String,
}

impl OpenAlexProvider {
    pub fn new(user_agent: &str, contact_email: &str, timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.openalex.org", user_agent, contact_email, timeout)
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
            .map_err(|e| Error::Config(format!("failed to build openalex client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mailto: contact_email.to_string(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
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
                "openalex query failed",
            ));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| classify_reqwest(&e, self.name()))
    }

    async fn search_title(&self, title: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/works?search={}&per-page=5&mailto={}",
            self.base_url,
            urlencoding::encode(title),
            urlencoding::encode(&self.mailto)
        );
        let Some(body) = self.get_json(&url).await? else {
            return Ok(miss("no search response"));
        };

        let works = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for work in &works {
            let Some(candidate) = work.get("display_name").and_then(Value::as_str) else {
                continue;
            };
            if !is_title_match(title, candidate) {
                debug!(candidate = %candidate, "openalex hit rejected by title match");
                continue;
            }
            return Ok(outcome_from_work(work));
        }

        Ok(miss("no matching openalex work"))
    }

    async fn lookup_doi(&self, doi: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/works/doi:{}?mailto={}",
            self.base_url,
            urlencoding::encode(doi),
            urlencoding::encode(&self.mailto)
        );
        let Some(body) = self.get_json(&url).await? else {
            return Ok(miss("doi unknown to openalex"));
        };
        Ok(outcome_from_work(&body))
    }
}

fn miss(reason: &str) -> ProviderOutcome {
    ProviderOutcome::NotFound {
        reason: reason.to_string(),
        doi: None,
        metadata: None,
    }
}

fn outcome_from_work(work: &Value) -> ProviderOutcome {
    let metadata = metadata_from_work(work);

    // `oa_url` from the open_access block is the curated link; the primary
    // location's pdf_url is the raw fallback
    let pdf_url = work
        .pointer("/open_access/oa_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            work.pointer("/primary_location/pdf_url")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    match pdf_url {
        Some(pdf_url) => ProviderOutcome::Found { pdf_url, metadata },
        None => ProviderOutcome::NotFound {
            reason: "work has no open-access url".to_string(),
            doi: metadata.doi.clone(),
            metadata: Some(metadata),
        },
    }
}

fn metadata_from_work(work: &Value) -> PaperMetadata {
    PaperMetadata {
        title: work
            .get("display_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        authors: work
            .get("authorships")
            .and_then(Value::as_array)
            .map(|authorships| {
                authorships
                    .iter()
                    .filter_map(|a| a.pointer("/author/display_name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        journal: work
            .pointer("/primary_location/source/display_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        year: work
            .get("publication_year")
            .and_then(Value::as_u64)
            .map(|y| y as u32),
        // OpenAlex serves DOIs with the resolver prefix attached
        doi: work
            .get("doi")
            .and_then(Value::as_str)
            .map(normalize_doi),
        abstract_text: None,
    }
}

#[async_trait]
impl SourceProvider for OpenAlexProvider {
    fn name(&self) -> &str {
        "openalex"
    }

    fn priority(&self) -> u8 {
        3
    }

    fn supports_doi_lookup(&self) -> bool {
        true
    }

    #[instrument(skip(self, query))]
    async fn invoke(&self, query: &PaperQuery) -> Result<ProviderOutcome> {
        if let Some(doi) = &query.doi {
            return self.lookup_doi(doi).await;
        }
        if let Some(title) = &query.title {
            return self.search_title(title).await;
        }
        Ok(miss("empty query"))
    }
}
