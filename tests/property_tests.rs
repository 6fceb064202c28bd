//! Property-based tests for the pure parsing and slicing helpers.

use proptest::prelude::*;

use uptimed::config::Chunk;
use uptimed::storage::schema::{MonitorSettings, split_keywords};

proptest! {
    /// Keyword splitting never yields empty or untrimmed entries.
    #[test]
    fn keywords_are_trimmed_and_nonempty(raw in ".{0,200}") {
        let keywords = split_keywords(Some(&raw));
        for keyword in &keywords {
            prop_assert!(!keyword.is_empty());
            prop_assert_eq!(keyword.trim(), keyword.as_str());
            prop_assert!(!keyword.contains(','));
        }
    }

    /// Splitting is stable: re-joining and re-splitting is a fixpoint.
    #[test]
    fn keyword_split_is_idempotent(raw in "[a-zA-Z0-9 ,]{0,100}") {
        let once = split_keywords(Some(&raw));
        let rejoined = once.join(",");
        let twice = split_keywords(Some(&rejoined));
        prop_assert_eq!(once, twice);
    }

    /// A chunk window is always within bounds and at most `size` long.
    #[test]
    fn chunk_apply_respects_bounds(
        number in 1u32..20,
        size in 1usize..50,
        total in 0usize..500,
    ) {
        let items: Vec<usize> = (0..total).collect();
        let chunk = Chunk { number, size };
        let window = chunk.apply(&items);

        prop_assert!(window.len() <= size);
        let offset = chunk.offset();
        for (i, value) in window.iter().enumerate() {
            prop_assert_eq!(*value, offset + i);
        }
    }

    /// Chunks of the same size never overlap and cover the list.
    #[test]
    fn chunks_partition_the_list(size in 1usize..20, total in 0usize..200) {
        let items: Vec<usize> = (0..total).collect();
        let mut seen = Vec::new();
        for number in 1..=(total / size + 2) as u32 {
            seen.extend(Chunk { number, size }.apply(&items));
        }
        prop_assert_eq!(seen, items);
    }

    /// The alert-window evaluator never panics on arbitrary settings, and
    /// blank ranges always allow.
    #[test]
    fn alert_window_evaluator_is_total(
        tz in proptest::option::of("[a-zA-Z/_0-9.+-]{0,20}"),
        ranges in proptest::option::of("[0-9:,-]{0,40}"),
    ) {
        let settings = MonitorSettings {
            user_id: 1,
            timezone: tz,
            alert_time_ranges: ranges.clone(),
            global_stop_alert_to: None,
            firebase_token: None,
        };
        let (allowed, reason) = uptimed::policy::allowed_at(&settings, chrono::Utc::now());
        prop_assert!(!reason.is_empty());
        if ranges.as_deref().is_none_or(|r| r.trim().is_empty()) {
            prop_assert!(allowed);
        }
    }
}
