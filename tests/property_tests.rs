//! Property tests for the pure normalization and freshness primitives.

use chrono::{Duration as ChronoDuration, Utc};
use paper_fetcher::cache::CacheEntry;
use paper_fetcher::providers::{normalize_doi, normalize_query_key, title_similarity};
use paper_fetcher::FetchResult;
use proptest::prelude::*;

proptest! {
    #[test]
    fn query_key_normalization_is_idempotent(title in ".{0,120}") {
        let once = normalize_query_key(&title);
        prop_assert_eq!(normalize_query_key(&once), once.clone());
    }

    #[test]
    fn query_key_ignores_case(title in "[a-zA-Z ]{1,80}") {
        prop_assert_eq!(
            normalize_query_key(&title.to_uppercase()),
            normalize_query_key(&title.to_lowercase())
        );
    }

    #[test]
    fn query_key_ignores_whitespace_runs(
        words in proptest::collection::vec("[a-z]{1,10}", 1..8),
        gaps in proptest::collection::vec(1usize..5, 0..8),
    ) {
        let single: String = words.join(" ");
        let mut padded = String::new();
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                let gap = gaps.get(i % gaps.len().max(1)).copied().unwrap_or(1);
                padded.push_str(&" ".repeat(gap));
            }
            padded.push_str(word);
        }
        prop_assert_eq!(normalize_query_key(&padded), normalize_query_key(&single));
    }

    #[test]
    fn doi_normalization_is_idempotent(suffix in "[a-zA-Z0-9./-]{1,40}") {
        let doi = format!("10.1000/{suffix}");
        let once = normalize_doi(&doi);
        prop_assert_eq!(normalize_doi(&once), once.clone());
    }

    #[test]
    fn doi_resolver_prefix_never_survives(suffix in "[a-z0-9.]{1,30}") {
        let doi = format!("https://doi.org/10.1000/{suffix}");
        let normalized = normalize_doi(&doi);
        prop_assert!(!normalized.starts_with("http"));
        prop_assert!(normalized.starts_with("10.1000/"));
    }

    #[test]
    fn similarity_is_symmetric_and_bounded(a in ".{0,60}", b in ".{0,60}") {
        let forward = title_similarity(&a, &b);
        let backward = title_similarity(&b, &a);
        prop_assert!((forward - backward).abs() < f64::EPSILON);
        prop_assert!((0.0..=1.0).contains(&forward));
    }

    #[test]
    fn identical_titles_are_maximally_similar(title in "[a-z]{3,12}( [a-z]{3,12}){0,6}") {
        prop_assert!((title_similarity(&title, &title) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn entry_age_grows_with_entry_history(minutes in 0i64..10_000) {
        let now = Utc::now();
        let entry = CacheEntry {
            payload: FetchResult::default(),
            cached_at: now - ChronoDuration::minutes(minutes),
            negative: false,
        };
        let older = CacheEntry {
            payload: FetchResult::default(),
            cached_at: now - ChronoDuration::minutes(minutes + 1),
            negative: false,
        };
        prop_assert!(older.age(now) > entry.age(now));
    }

    #[test]
    fn entry_from_the_future_has_zero_age(minutes in 1i64..10_000) {
        let now = Utc::now();
        let entry = CacheEntry {
            payload: FetchResult::default(),
            cached_at: now + ChronoDuration::minutes(minutes),
            negative: false,
        };
        prop_assert_eq!(entry.age(now), std::time::Duration::ZERO);
    }
}
