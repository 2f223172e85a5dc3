use super::{
    is_title_match, normalize_doi, PaperMetadata, PaperQuery, ProviderOutcome, SourceProvider,
};
use crate::error::{classify_reqwest, classify_status};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const SEARCH_FIELDS: &str = "title,authors,year,venue,openAccessPdf,externalIds";

/// Semantic Scholar Graph API fetcher. Broad coverage and an
/// `openAccessPdf` field, but aggressively rate limited without an API key.
pub struct SemanticScholarProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarProvider {
    pub fn new(user_agent: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.semanticscholar.org", user_agent, api_key, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build semantic scholar client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
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
                "semantic scholar query failed",
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
            "{}/graph/v1/paper/search?query={}&limit=5&fields={SEARCH_FIELDS}",
            self.base_url,
            urlencoding::encode(title)
        );
        let Some(body) = self.get_json(&url).await? else {
            return Ok(miss("no search response"));
        };

        let hits = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // First pass takes a direct open-access PDF, second pass settles
        // for a DOI the aggregator can resolve elsewhere
        for hit in &hits {
            if !matches(title, hit) {
                continue;
            }
            if let Some(pdf_url) = open_access_pdf(hit) {
                return Ok(ProviderOutcome::Found {
                    pdf_url,
                    metadata: metadata_from_paper(hit),
                });
            }
        }
        for hit in &hits {
            if !matches(title, hit) {
                continue;
            }
            if let Some(doi) = external_doi(hit) {
                debug!(doi = %doi, "semantic scholar hit has doi but no pdf");
                return Ok(ProviderOutcome::NotFound {
                    reason: "no open-access pdf on matching paper".to_string(),
                    doi: Some(doi),
                    metadata: Some(metadata_from_paper(hit)),
                });
            }
        }

        Ok(miss("no matching semantic scholar paper"))
    }

    async fn lookup_doi(&self, doi: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/graph/v1/paper/DOI:{}?fields={SEARCH_FIELDS}",
            self.base_url,
            urlencoding::encode(doi)
        );
        let Some(body) = self.get_json(&url).await? else {
            return Ok(miss("doi unknown to semantic scholar"));
        };

        if let Some(pdf_url) = open_access_pdf(&body) {
            return Ok(ProviderOutcome::Found {
                pdf_url,
                metadata: metadata_from_paper(&body),
            });
        }
        Ok(ProviderOutcome::NotFound {
            reason: "no open-access pdf recorded".to_string(),
            doi: external_doi(&body),
            metadata: Some(metadata_from_paper(&body)),
        })
    }
}

fn miss(reason: &str) -> ProviderOutcome {
    ProviderOutcome::NotFound {
        reason: reason.to_string(),
        doi: None,
        metadata: None,
    }
}

fn matches(wanted: &str, paper: &Value) -> bool {
    paper
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|candidate| is_title_match(wanted, candidate))
}

fn open_access_pdf(paper: &Value) -> Option<String> {
    paper
        .pointer("/openAccessPdf/url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn external_doi(paper: &Value) -> Option<String> {
    paper
        .pointer("/externalIds/DOI")
        .and_then(Value::as_str)
        .map(normalize_doi)
}

fn metadata_from_paper(paper: &Value) -> PaperMetadata {
    PaperMetadata {
        title: paper
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        authors: paper
            .get("authors")
            .and_then(Value::as_array)
            .map(|authors| {
                authors
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        journal: paper
            .get("venue")
            .and_then(Value::as_str)
            .map(str::to_string),
        year: paper.get("year").and_then(Value::as_u64).map(|y| y as u32),
        doi: external_doi(paper),
        abstract_text: None,
    }
}

#[async_trait]
impl SourceProvider for SemanticScholarProvider {
    fn name(&self) -> &str {
        "semantic_scholar"
    }

    fn priority(&self) -> u8 {
        2
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> SemanticScholarProvider {
        SemanticScholarProvider::with_base_url(
            &server.uri(),
            "paper-fetcher-test",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_search_prefers_open_access_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "title": "Attention Is All You Need",
                        "year": 2017,
                        "venue": "NeurIPS",
                        "authors": [{"name": "Ashish Vaswani"}],
                        "openAccessPdf": {"url": "https://pdfs.example/attention.pdf"},
                        "externalIds": {"DOI": "10.5555/attention"}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("Attention Is All You Need"))
            .await
            .unwrap();

        match outcome {
            ProviderOutcome::Found { pdf_url, metadata } => {
                assert_eq!(pdf_url, "https://pdfs.example/attention.pdf");
                assert_eq!(metadata.year, Some(2017));
                assert_eq!(metadata.doi.as_deref(), Some("10.5555/attention"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_search_falls_back_to_doi_without_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "title": "Attention Is All You Need",
                        "openAccessPdf": null,
                        "externalIds": {"DOI": "10.5555/ATTENTION"}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("Attention Is All You Need"))
            .await
            .unwrap();
        assert_eq!(outcome.discovered_doi(), Some("10.5555/attention"));
    }

    #[tokio::test]
    async fn test_mismatched_hits_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {
                        "title": "A Completely Different Study Of Gradient Descent",
                        "openAccessPdf": {"url": "https://pdfs.example/wrong.pdf"}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("Attention Is All You Need"))
            .await
            .unwrap();
        assert!(!outcome.is_found());
    }

    #[tokio::test]
    async fn test_doi_lookup_resolves_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/DOI:10.5555%2Fattention"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "Attention Is All You Need",
                "openAccessPdf": {"url": "https://pdfs.example/attention.pdf"}
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_doi("10.5555/attention"))
            .await
            .unwrap();
        assert!(outcome.is_found());
    }

    #[tokio::test]
    async fn test_rate_limit_classified_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("anything"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
