use super::dispatcher::{DispatchOutcome, Dispatcher, ProviderTask};
use super::FetchResult;
use crate::providers::{normalize_doi, PaperQuery, ProviderOutcome, SourceProvider};
use std::sync::Arc;
use tracing::{debug, info};

/// Merges dispatched provider outcomes into one ranked answer.
///
/// Selection is deterministic and total: lowest priority value wins, ties
/// broken by original task order, independent of completion timing.
pub struct Aggregator {
    /// Provider used for the secondary lookup when only a DOI was found
    doi_resolver: Option<Arc<dyn SourceProvider>>,
}

impl Aggregator {
    pub fn new(doi_resolver: Option<Arc<dyn SourceProvider>>) -> Self {
        Self { doi_resolver }
    }

    pub async fn aggregate(
        &self,
        outcomes: Vec<DispatchOutcome>,
        dispatcher: &Dispatcher,
    ) -> FetchResult {
        let sources_attempted: Vec<String> =
            outcomes.iter().map(|o| o.provider.clone()).collect();

        let mut best_found: Option<(u8, usize, String, &DispatchOutcome)> = None;
        let mut collected_doi: Option<String> = None;
        let mut collected_metadata = None;
        let mut first_error: Option<String> = None;

        for (index, settled) in outcomes.iter().enumerate() {
            match &settled.outcome {
                ProviderOutcome::Found { pdf_url, .. } => {
                    let candidate = (settled.priority, index, pdf_url.clone(), settled);
                    let better = match &best_found {
                        None => true,
                        Some((priority, seen_index, _, _)) => {
                            (candidate.0, candidate.1) < (*priority, *seen_index)
                        }
                    };
                    if better {
                        best_found = Some(candidate);
                    }
                }
                ProviderOutcome::NotFound { doi, metadata, .. } => {
                    if collected_doi.is_none() {
                        if let Some(doi) = doi {
                            collected_doi = Some(normalize_doi(doi));
                        }
                    }
                    if collected_metadata.is_none() {
                        collected_metadata = metadata.clone();
                    }
                }
                ProviderOutcome::Failed(error) => {
                    if first_error.is_none() {
                        first_error = Some(error.to_string());
                    }
                }
            }
        }

        if let Some((priority, _, pdf_url, settled)) = best_found {
            info!(
                provider = %settled.provider,
                priority,
                "selected direct provider result"
            );
            let metadata = match &settled.outcome {
                ProviderOutcome::Found { metadata, .. } => Some(metadata.clone()),
                _ => None,
            };
            return FetchResult::found(pdf_url, settled.provider.clone(), metadata);
        }

        // No direct PDF: one secondary lookup with the first collected DOI
        if let (Some(doi), Some(resolver)) = (&collected_doi, &self.doi_resolver) {
            // If the resolver itself already reported a miss for this exact
            // DOI, querying it again is a guaranteed duplicate call
            let resolver_already_missed = outcomes.iter().any(|settled| {
                settled.provider == resolver.name()
                    && settled
                        .outcome
                        .discovered_doi()
                        .map(normalize_doi)
                        .as_deref()
                        == Some(doi.as_str())
            });
            if resolver_already_missed {
                debug!(doi = %doi, resolver = %resolver.name(), "skipping secondary lookup, resolver already missed this doi");
            } else {
                debug!(doi = %doi, resolver = %resolver.name(), "attempting secondary DOI lookup");
                let task = ProviderTask::new(resolver.clone(), PaperQuery::by_doi(doi));
                let mut secondary = dispatcher.dispatch(vec![task]).await;
                if let Some(settled) = secondary.pop() {
                    if let ProviderOutcome::Found { pdf_url, metadata } = settled.outcome {
                        info!(provider = %settled.provider, doi = %doi, "secondary DOI lookup succeeded");
                        let mut result =
                            FetchResult::found(pdf_url, settled.provider, Some(metadata));
                        result.doi = Some(doi.clone());
                        return result;
                    }
                }
            }
        }

        let partial = collected_doi.is_some() || collected_metadata.is_some();
        FetchResult::failure(
            first_error.unwrap_or_else(|| "paper not found in any source".to_string()),
            collected_doi,
            collected_metadata,
            sources_attempted,
            partial,
        )
    }
}
