//! Identity gallery and embedding matcher.
//!
//! Linear-scan dot-product matching is the reference semantics: O(n) per
//! query, adequate up to a few thousand identities.

use crate::types::Embedding;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Best gallery match for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryMatch {
    pub identity: String,
    /// Dot-product similarity in [-1, 1].
    pub similarity: f32,
}

/// Gallery of registered identity embeddings.
///
/// Read-mostly: many concurrent `best_match` calls, rare writes. Writers
/// build a new snapshot and swap the `Arc` atomically, so a reader never
/// observes a partially updated map.
pub struct Gallery {
    entries: RwLock<Arc<BTreeMap<String, Embedding>>>,
    similarity_threshold: f32,
}

impl Gallery {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            entries: RwLock::new(Arc::new(BTreeMap::new())),
            similarity_threshold,
        }
    }

    /// Register an identity. An existing embedding for the same identity
    /// is overwritten, not averaged.
    pub fn register(&self, identity: &str, embedding: Embedding) {
        let mut guard = self.entries.write().expect("gallery lock poisoned");
        let mut next: BTreeMap<String, Embedding> = (**guard).clone();
        next.insert(identity.to_string(), embedding);
        *guard = Arc::new(next);
        tracing::info!(identity, total = guard.len(), "gallery: registered");
    }

    /// Remove an identity. Returns false if it was not registered.
    pub fn remove(&self, identity: &str) -> bool {
        let mut guard = self.entries.write().expect("gallery lock poisoned");
        if !guard.contains_key(identity) {
            return false;
        }
        let mut next: BTreeMap<String, Embedding> = (**guard).clone();
        next.remove(identity);
        *guard = Arc::new(next);
        tracing::info!(identity, total = guard.len(), "gallery: removed");
        true
    }

    /// Match a probe embedding against every registered identity.
    ///
    /// Linear scan in identity order tracking the running maximum under
    /// strict `>`, so an exact tie resolves to the lexicographically first
    /// identity; returns the best identity only if its similarity reaches
    /// the configured threshold.
    pub fn best_match(&self, probe: &Embedding) -> Option<GalleryMatch> {
        let snapshot = {
            let guard = self.entries.read().expect("gallery lock poisoned");
            Arc::clone(&guard)
        };

        let mut best: Option<(&String, f32)> = None;
        for (identity, stored) in snapshot.iter() {
            let sim = probe.dot(stored);
            match best {
                Some((_, best_sim)) if sim > best_sim => best = Some((identity, sim)),
                None => best = Some((identity, sim)),
                _ => {}
            }
        }

        best.filter(|&(_, sim)| sim >= self.similarity_threshold)
            .map(|(identity, similarity)| GalleryMatch {
                identity: identity.clone(),
                similarity,
            })
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("gallery lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored embedding for one identity, if registered.
    pub fn embedding_of(&self, identity: &str) -> Option<Embedding> {
        self.entries
            .read()
            .expect("gallery lock poisoned")
            .get(identity)
            .cloned()
    }

    /// Registered identity names, sorted.
    pub fn identities(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("gallery lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_match() {
        let gallery = Gallery::new(0.6);
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));
        gallery.register("bob", Embedding::from_raw(vec![0.0, 1.0]));

        // Worked example: query [0.9, 0.1] normalized matches alice at ~0.99
        let probe = Embedding::from_raw(vec![0.9, 0.1]);
        let m = gallery.best_match(&probe).unwrap();
        assert_eq!(m.identity, "alice");
        assert!((m.similarity - 0.9939).abs() < 1e-3, "sim = {}", m.similarity);
    }

    #[test]
    fn test_no_match_below_threshold() {
        let gallery = Gallery::new(0.6);
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));

        let probe = Embedding::from_raw(vec![0.0, 1.0]);
        assert!(gallery.best_match(&probe).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        let gallery = Gallery::new(0.6);
        let probe = Embedding::from_raw(vec![1.0, 0.0]);
        assert!(gallery.best_match(&probe).is_none());
    }

    #[test]
    fn test_register_overwrites() {
        let gallery = Gallery::new(0.6);
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));
        gallery.register("alice", Embedding::from_raw(vec![0.0, 1.0]));
        assert_eq!(gallery.len(), 1);

        // Only the latest embedding matches
        let probe = Embedding::from_raw(vec![0.0, 1.0]);
        assert!(gallery.best_match(&probe).is_some());
        let old_probe = Embedding::from_raw(vec![1.0, 0.0]);
        assert!(gallery.best_match(&old_probe).is_none());
    }

    #[test]
    fn test_remove() {
        let gallery = Gallery::new(0.6);
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));
        assert!(gallery.remove("alice"));
        assert!(!gallery.remove("alice"));
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_exact_threshold_matches() {
        // Similarity exactly at the threshold is returned (≥, not >)
        let gallery = Gallery::new(1.0);
        gallery.register("alice", Embedding::from_raw(vec![1.0, 0.0]));
        let probe = Embedding::from_raw(vec![1.0, 0.0]);
        let m = gallery.best_match(&probe).unwrap();
        assert_eq!(m.identity, "alice");
    }

    #[test]
    fn test_exact_tie_is_deterministic() {
        let gallery = Gallery::new(0.6);
        // Identical embeddings tie exactly; the scan order decides
        gallery.register("zoe", Embedding::from_raw(vec![1.0, 0.0]));
        gallery.register("abe", Embedding::from_raw(vec![1.0, 0.0]));

        let probe = Embedding::from_raw(vec![1.0, 0.0]);
        for _ in 0..10 {
            assert_eq!(gallery.best_match(&probe).unwrap().identity, "abe");
        }
    }

    #[test]
    fn test_best_of_many() {
        let gallery = Gallery::new(0.1);
        gallery.register("far", Embedding::from_raw(vec![0.0, 1.0, 0.0]));
        gallery.register("near", Embedding::from_raw(vec![1.0, 0.0, 0.0]));
        gallery.register("mid", Embedding::from_raw(vec![1.0, 1.0, 0.0]));

        let probe = Embedding::from_raw(vec![1.0, 0.0, 0.0]);
        let m = gallery.best_match(&probe).unwrap();
        assert_eq!(m.identity, "near");
    }
}
