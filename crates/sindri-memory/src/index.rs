// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// One search result from the vector index.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Nearest-neighbour store seam.  Writes are serialized per namespace by
/// the implementation; the kernel never assumes more than that.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Top-k by cosine similarity, best first.
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;

    async fn delete(&self, namespace: &str, id: &str) -> anyhow::Result<()>;
}

/// Reference in-memory index: per-namespace maps behind one RwLock.
#[derive(Default)]
pub struct InMemoryIndex {
    namespaces: RwLock<HashMap<String, HashMap<String, (Vec<f32>, serde_json::Value)>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(
        &self,
        namespace: &str,
        id: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let namespaces = self.namespaces.read().await;
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(vec![]);
        };
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .map(|(id, (v, payload))| SearchHit {
                id: id.clone(),
                score: cosine(vector, v),
                payload: payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, namespace: &str, id: &str) -> anyhow::Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(entries) = namespaces.get_mut(namespace) {
            entries.remove(id);
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_search_delete_round_trip() {
        let idx = InMemoryIndex::new();
        idx.upsert("ns", "a", vec![1.0, 0.0], json!({"path": "a.rs"}))
            .await
            .unwrap();
        idx.upsert("ns", "b", vec![0.0, 1.0], json!({"path": "b.rs"}))
            .await
            .unwrap();

        let hits = idx.search("ns", &[1.0, 0.1], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);

        idx.delete("ns", "a").await.unwrap();
        assert_eq!(idx.len("ns").await, 1);
    }

    #[tokio::test]
    async fn search_respects_k() {
        let idx = InMemoryIndex::new();
        for i in 0..5 {
            idx.upsert("ns", &format!("v{i}"), vec![1.0, i as f32], json!({}))
                .await
                .unwrap();
        }
        let hits = idx.search("ns", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let idx = InMemoryIndex::new();
        idx.upsert("a", "x", vec![1.0], json!({})).await.unwrap();
        assert!(idx.search("b", &[1.0], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_id() {
        let idx = InMemoryIndex::new();
        idx.upsert("ns", "x", vec![1.0, 0.0], json!({"v": 1}))
            .await
            .unwrap();
        idx.upsert("ns", "x", vec![0.0, 1.0], json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(idx.len("ns").await, 1);
        let hits = idx.search("ns", &[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].payload["v"], 2);
    }
}
