use super::{
    is_title_match, PaperMetadata, PaperQuery, ProviderOutcome, SourceProvider,
};
use crate::error::{classify_reqwest, classify_status};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const ARXIV_NS: &str = "http://arxiv.org/schemas/atom";

/// arXiv Atom API fetcher. Highest-priority source: when arXiv has the
/// paper, its PDF link is canonical and immediately downloadable.
pub struct ArxivProvider {
    client: reqwest::Client,
    base_url: String,
}

impl ArxivProvider {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://export.arxiv.org", user_agent, timeout)
    }

    pub fn with_base_url(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build arxiv client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn search(&self, title: &str) -> Result<ProviderOutcome> {
        let url = format!(
            "{}/api/query?search_query=ti:{}&start=0&max_results=5",
            self.base_url,
            urlencoding::encode(&format!("\"{title}\""))
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;

        let status = response.status();
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
                "arxiv query failed",
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest(&e, self.name()))?;
        self.parse_feed(&body, title)
    }

    fn parse_feed(&self, body: &str, wanted_title: &str) -> Result<ProviderOutcome> {
        let doc = roxmltree::Document::parse(body).map_err(|e| Error::Parse {
            context: "arxiv atom feed".to_string(),
            message: e.to_string(),
        })?;

        for entry in doc
            .root_element()
            .children()
            .filter(|n| n.has_tag_name((ATOM_NS, "entry")))
        {
            let Some(title) = child_text(&entry, "title") else {
                continue;
            };
            if !is_title_match(wanted_title, &title) {
                debug!(candidate = %title, "arxiv hit rejected by title match");
                continue;
            }

            let pdf_url = entry
                .children()
                .filter(|n| n.has_tag_name((ATOM_NS, "link")))
                .find(|n| {
                    n.attribute("title") == Some("pdf")
                        || n.attribute("type") == Some("application/pdf")
                })
                .and_then(|n| n.attribute("href"))
                .map(str::to_string);

            let doi = entry
                .children()
                .find(|n| n.has_tag_name((ARXIV_NS, "doi")))
                .and_then(|n| n.text())
                .map(super::normalize_doi);

            let authors = entry
                .children()
                .filter(|n| n.has_tag_name((ATOM_NS, "author")))
                .filter_map(|a| child_text(&a, "name"))
                .collect();

            let year = child_text(&entry, "published")
                .and_then(|p| p.get(..4).and_then(|y| y.parse().ok()));

            let metadata = PaperMetadata {
                title: Some(title),
                authors,
                journal: Some("arXiv".to_string()),
                year,
                doi: doi.clone(),
                abstract_text: child_text(&entry, "summary").map(|s| s.trim().to_string()),
            };

            return Ok(match pdf_url {
                Some(pdf_url) => ProviderOutcome::Found { pdf_url, metadata },
                None => ProviderOutcome::NotFound {
                    reason: "matched entry has no pdf link".to_string(),
                    doi,
                    metadata: Some(metadata),
                },
            });
        }

        Ok(ProviderOutcome::NotFound {
            reason: "no matching arxiv entry".to_string(),
            doi: None,
            metadata: None,
        })
    }
}

fn child_text(node: &roxmltree::Node, tag: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name((ATOM_NS, tag)))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
}

#[async_trait]
impl SourceProvider for ArxivProvider {
    fn name(&self) -> &str {
        "arxiv"
    }

    fn priority(&self) -> u8 {
        1
    }

    #[instrument(skip(self, query))]
    async fn invoke(&self, query: &PaperQuery) -> Result<ProviderOutcome> {
        match &query.title {
            Some(title) => self.search(title).await,
            None => Ok(ProviderOutcome::NotFound {
                reason: "arxiv fetcher resolves titles only".to_string(),
                doi: None,
                metadata: None,
            }),
        }
    }
}
