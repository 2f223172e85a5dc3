use super::{
    is_title_match, normalize_doi, PaperMetadata, PaperQuery, ProviderOutcome, SourceProvider,
};
use crate::error::{classify_reqwest, classify_status};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// CrossRef works API fetcher.
///
/// Rarely holds a PDF itself but is the authoritative DOI registry, so it
/// doubles as the engine's metadata resolver for title queries and as a
/// direct DOI lookup source.
pub struct CrossRefProvider {
    client: reqwest::Client,
    base_url: String,
    mailto: String,
}

impl CrossRefProvider {
    pub fn new(user_agent: &str, contact_email: &str, timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.crossref.org", user_agent, contact_email, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        contact_email: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("{user_agent} (mailto:{contact_email})"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build crossref client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mailto: contact_email.to_string(),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(Value::Null);
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
                "crossref query failed",
            ));
        }

        response
            .json()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))
    }

    async fn search_title(&self, title: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/works?query.title={}&rows=5&mailto={}",
            self.base_url,
            urlencoding::encode(title),
            urlencoding::encode(&self.mailto)
        );
        let body = self.get_json(&url).await?;

        let items = body
            .pointer("/message/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for item in &items {
            let Some(candidate) = first_title(item) else {
                continue;
            };
            if !is_title_match(title, &candidate) {
                debug!(candidate = %candidate, "crossref hit rejected by title match");
                continue;
            }
            return Ok(self.outcome_from_work(item));
        }

        Ok(ProviderOutcome::NotFound {
            reason: "no matching crossref work".to_string(),
            doi: None,
            metadata: None,
        })
    }

    async fn lookup_doi(&self, doi: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/works/{}?mailto={}",
            self.base_url,
            urlencoding::encode(doi),
            urlencoding::encode(&self.mailto)
        );
        let body = self.get_json(&url).await?;
        if body.is_null() {
            return Ok(ProviderOutcome::NotFound {
                reason: "doi not registered".to_string(),
                doi: None,
                metadata: None,
            });
        }
        let Some(work) = body.pointer("/message") else {
            return Err(Error::Parse {
                context: "crossref work".to_string(),
                message: "missing message envelope".to_string(),
            });
        };
        Ok(self.outcome_from_work(work))
    }

    fn outcome_from_work(&self, work: &Value) -> ProviderOutcome {
        let doi = work
            .get("DOI")
            .and_then(Value::as_str)
            .map(normalize_doi);
        let metadata = metadata_from_work(work, doi.clone());

        // Some OA publishers register a direct full-text link
        let pdf_url = work
            .get("link")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|l| {
                    l.get("content-type").and_then(Value::as_str) == Some("application/pdf")
                })
            })
            .and_then(|l| l.get("URL").and_then(Value::as_str))
            .map(str::to_string);

        match pdf_url {
            Some(pdf_url) => ProviderOutcome::Found { pdf_url, metadata },
            None => ProviderOutcome::NotFound {
                reason: "work has no full-text link".to_string(),
                doi,
                metadata: Some(metadata),
            },
        }
    }
}

fn first_title(work: &Value) -> Option<String> {
    work.get("title")
        .and_then(Value::as_array)
        .and_then(|t| t.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn metadata_from_work(work: &Value, doi: Option<String>) -> PaperMetadata {
    let authors = work
        .get("author")
        .and_then(Value::as_array)
        .map(|authors| {
            authors
                .iter()
                .filter_map(|a| {
                    let given = a.get("given").and_then(Value::as_str);
                    let family = a.get("family").and_then(Value::as_str)?;
                    Some(match given {
                        Some(given) => format!("{given} {family}"),
                        None => family.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let journal = work
        .get("container-title")
        .and_then(Value::as_array)
        .and_then(|t| t.first())
        .and_then(Value::as_str)
        .map(str::to_string);

    let year = work
        .pointer("/issued/date-parts/0/0")
        .and_then(Value::as_u64)
        .map(|y| y as u32);

    PaperMetadata {
        title: first_title(work),
        authors,
        journal,
        year,
        doi,
        abstract_text: work
            .get("abstract")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

#[async_trait]
impl SourceProvider for CrossRefProvider {
    fn name(&self) -> &str {
        "crossref"
    }

    fn priority(&self) -> u8 {
        5
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
        Ok(ProviderOutcome::NotFound {
            reason: "empty query".to_string(),
            doi: None,
            metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn work_body() -> Value {
        json!({
            "message": {
                "items": [{
                    "DOI": "10.5555/ATTENTION",
                    "title": ["Attention Is All You Need"],
                    "container-title": ["NeurIPS"],
                    "issued": {"date-parts": [[2017]]},
                    "author": [
                        {"given": "Ashish", "family": "Vaswani"},
                        {"family": "Shazeer"}
                    ]
                }]
            }
        })
    }

    async fn provider(server: &MockServer) -> CrossRefProvider {
        CrossRefProvider::with_base_url(
            &server.uri(),
            "paper-fetcher-test",
            "test@example.com",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_title_search_recovers_doi_without_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works"))
            .respond_with(ResponseTemplate::new(200).set_body_json(work_body()))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("Attention Is All You Need"))
            .await
            .unwrap();

        match outcome {
            ProviderOutcome::NotFound { doi, metadata, .. } => {
                assert_eq!(doi.as_deref(), Some("10.5555/attention"));
                let metadata = metadata.unwrap();
                assert_eq!(metadata.year, Some(2017));
                assert_eq!(
                    metadata.authors,
                    vec!["Ashish Vaswani".to_string(), "Shazeer".to_string()]
                );
            }
            other => panic!("expected NotFound with doi, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_doi_lookup_surfaces_pdf_link() {
        let server = MockServer::start().await;
        let body = json!({
            "message": {
                "DOI": "10.5555/attention",
                "title": ["Attention Is All You Need"],
                "link": [{
                    "URL": "https://publisher.example/attention.pdf",
                    "content-type": "application/pdf"
                }]
            }
        });
        Mock::given(method("GET"))
            .and(path("/works/10.5555%2Fattention"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_doi("10.5555/attention"))
            .await
            .unwrap();

        match outcome {
            ProviderOutcome::Found { pdf_url, .. } => {
                assert_eq!(pdf_url, "https://publisher.example/attention.pdf");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_doi_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = provider(&server)
            .await
            .invoke(&PaperQuery::by_doi("10.9999/missing"))
            .await
            .unwrap();
        assert!(!outcome.is_found());
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .await
            .invoke(&PaperQuery::by_title("anything"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }
}
