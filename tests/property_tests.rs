//! Property tests for content hashing, merge convergence, and queue
//! durability.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use memsync::merge::{MergeEngine, QuarantineStore, ResolutionPolicy};
use memsync::{
    AuditLog, CanonicalStore, InMemoryStore, LocalQueueStore, MemoryToken, OriginId, OriginKey,
    QueueEntry, TokenContent, TokenId,
};
use proptest::prelude::*;
use std::sync::Arc;

fn text_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,_-]{1,64}"
}

/// One logical write: version plus content, each from a distinct origin so
/// idempotency keys never collide across writes.
fn writes_strategy() -> impl Strategy<Value = Vec<(u64, String)>> {
    prop::collection::vec((1_u64..=5, text_strategy()), 1..8)
}

fn build_tokens(writes: &[(u64, String)]) -> Vec<MemoryToken> {
    writes
        .iter()
        .enumerate()
        .map(|(i, (version, text))| {
            MemoryToken::new(
                "tok-prop",
                TokenContent::new(text.clone()),
                format!("dev-{i}").as_str(),
            )
            .with_version(*version)
        })
        .collect()
}

fn merge_all(tokens: &[MemoryToken]) -> Option<MemoryToken> {
    let store = Arc::new(InMemoryStore::new());
    let audit = Arc::new(AuditLog::new());
    let engine = MergeEngine::new(
        Arc::clone(&store) as Arc<dyn CanonicalStore>,
        Arc::clone(&audit),
        Arc::new(QuarantineStore::new(audit)),
        ResolutionPolicy::HashTiebreak,
    );
    for token in tokens {
        engine
            .stage_and_merge(&token.origin_id, vec![QueueEntry::new(token.clone())])
            .unwrap();
    }
    store.get(&TokenId::from("tok-prop")).unwrap()
}

proptest! {
    /// The canonical hash depends only on content, never on versioning or
    /// provenance.
    #[test]
    fn hash_depends_only_on_content(text in text_strategy(), v1 in 1_u64..100, v2 in 1_u64..100) {
        let a = MemoryToken::new("tok-1", TokenContent::new(text.clone()), "dev-1").with_version(v1);
        let b = MemoryToken::new("tok-2", TokenContent::new(text), "dev-2").with_version(v2);
        prop_assert_eq!(a.content_hash, b.content_hash);
    }

    /// Metadata participates in the hash in key order, so insertion order is
    /// irrelevant.
    #[test]
    fn metadata_order_does_not_change_hash(text in text_strategy()) {
        let forward = TokenContent::new(text.clone())
            .with_metadata("alpha", "1")
            .with_metadata("beta", "2");
        let backward = TokenContent::new(text)
            .with_metadata("beta", "2")
            .with_metadata("alpha", "1");
        prop_assert_eq!(forward.hash(), backward.hash());
    }

    /// Any arrival order of the same writes converges on the same canonical
    /// record: the highest version wins, and among equal-version writes the
    /// larger content hash does.
    #[test]
    fn merge_converges_regardless_of_arrival_order(
        writes in writes_strategy().prop_shuffle(),
    ) {
        let tokens = build_tokens(&writes);
        let mut reversed = tokens.clone();
        reversed.reverse();

        let forward = merge_all(&tokens).unwrap();
        let backward = merge_all(&reversed).unwrap();
        prop_assert_eq!(&forward.content_hash, &backward.content_hash);
        prop_assert_eq!(forward.version, backward.version);

        // Matches the closed-form winner.
        let expected = tokens
            .iter()
            .max_by(|a, b| {
                a.version
                    .cmp(&b.version)
                    .then_with(|| a.content_hash.cmp(&b.content_hash))
            })
            .unwrap();
        prop_assert_eq!(forward.version, expected.version);
        prop_assert_eq!(&forward.content_hash, &expected.content_hash);
    }

    /// Replaying every write a second time leaves canonical state untouched.
    #[test]
    fn replay_of_all_writes_is_idempotent(writes in writes_strategy()) {
        let tokens = build_tokens(&writes);
        let once = merge_all(&tokens).unwrap();

        let mut twice_input = tokens.clone();
        twice_input.extend(tokens);
        let twice = merge_all(&twice_input).unwrap();

        prop_assert_eq!(once.content_hash, twice.content_hash);
        prop_assert_eq!(once.version, twice.version);
    }

    /// Every entry enqueued before a crash is readable after reopen, in
    /// order.
    #[test]
    fn queue_survives_reopen(texts in prop::collection::vec(text_strategy(), 1..10)) {
        let dir = tempfile::tempdir().unwrap();
        let origin = OriginId::from("dev-1");
        let key = OriginKey::generate();

        {
            let queue = LocalQueueStore::open(dir.path(), origin.clone(), &key).unwrap();
            for (i, text) in texts.iter().enumerate() {
                let token = MemoryToken::new(
                    format!("tok-{i}").as_str(),
                    TokenContent::new(text.clone()),
                    "dev-1",
                );
                queue.enqueue(token).unwrap();
            }
        }

        let queue = LocalQueueStore::open(dir.path(), origin, &key).unwrap();
        prop_assert_eq!(queue.pending_len().unwrap(), texts.len());
        let drained = queue.drain(texts.len()).unwrap();
        for (i, entry) in drained.iter().enumerate() {
            prop_assert_eq!(entry.token.id.as_str(), format!("tok-{i}"));
            prop_assert_eq!(&entry.token.content.text, &texts[i]);
        }
    }
}
