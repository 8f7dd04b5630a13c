//! In-memory cosine index over person average embeddings.
//!
//! Rows are L2-normalized so a single matrix-vector product yields every
//! cosine similarity. Row order is gallery insertion order, which is also
//! the tie-break order for equal distances.

use facegallery_core::Embedding;
use ndarray::{Array1, Array2, ArrayView1, Axis};

#[derive(Debug, Clone)]
pub struct CosineIndex {
    ids: Vec<String>,
    rows: Array2<f32>,
}

impl CosineIndex {
    /// Empty index for embeddings of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            ids: Vec::new(),
            rows: Array2::zeros((0, dim)),
        }
    }

    /// Build from `(global_id, avg_embedding)` pairs in insertion order.
    ///
    /// Entries whose dimension differs from the first are skipped.
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>,
    {
        let mut iter = entries.into_iter().peekable();
        let dim = iter.peek().map(|(_, e)| e.dim()).unwrap_or(0);
        let mut index = Self::new(dim);
        for (id, embedding) in iter {
            index.upsert(id, embedding);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    /// Insert or replace the row for `id`. New ids go last.
    ///
    /// Returns `false` if the embedding has the wrong dimension.
    pub fn upsert(&mut self, id: &str, embedding: &Embedding) -> bool {
        if self.is_empty() && self.dim() == 0 {
            self.rows = Array2::zeros((0, embedding.dim()));
        }
        if embedding.dim() != self.dim() {
            tracing::warn!(
                id,
                expected = self.dim(),
                actual = embedding.dim(),
                "embedding dimension mismatch; not indexed"
            );
            return false;
        }

        let row = normalized(embedding);
        match self.position(id) {
            Some(i) => self.rows.row_mut(i).assign(&row),
            None => {
                if self.rows.push_row(row.view()).is_err() {
                    return false;
                }
                self.ids.push(id.to_string());
            }
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(i) => {
                self.rows.remove_index(Axis(0), i);
                self.ids.remove(i);
                true
            }
            None => false,
        }
    }

    /// Up to `k` nearest ids by cosine distance, nearest first. Equal
    /// distances keep insertion order.
    pub fn search(&self, query: &Embedding, k: usize) -> Vec<(&str, f32)> {
        if self.is_empty() || query.dim() != self.dim() || k == 0 {
            return Vec::new();
        }
        let q = normalized(query);
        let similarities = self.rows.dot(&q);

        let mut hits: Vec<(usize, f32)> = similarities
            .iter()
            .enumerate()
            .map(|(i, &s)| (i, 1.0 - s))
            .collect();
        // Stable sort keeps insertion order among ties.
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits.into_iter().map(|(i, d)| (self.ids[i].as_str(), d)).collect()
    }

    /// Nearest id and its cosine distance.
    pub fn nearest(&self, query: &Embedding) -> Option<(&str, f32)> {
        self.search(query, 1).into_iter().next()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|x| x == id)
    }
}

/// Unit-length copy of an embedding; zero vectors stay zero.
fn normalized(embedding: &Embedding) -> Array1<f32> {
    let v: ArrayView1<f32> = ArrayView1::from(embedding.values.as_slice());
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v.mapv(|x| x / norm)
    } else {
        v.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_nearest() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[0.0, 1.0, 0.0]);
        let index = CosineIndex::build([("a", &a), ("b", &b)]);
        let (id, d) = index.nearest(&emb(&[0.1, 2.0, 0.0])).unwrap();
        assert_eq!(id, "b");
        assert!(d < 0.01);
    }

    #[test]
    fn test_matches_linear_distance() {
        let a = emb(&[0.3, -1.2, 0.5]);
        let q = emb(&[1.0, 0.2, -0.4]);
        let index = CosineIndex::build([("a", &a)]);
        let (_, d) = index.nearest(&q).unwrap();
        assert!((d - a.cosine_distance(&q)).abs() < 1e-5);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[2.0, 0.0]);
        let index = CosineIndex::build([("first", &a), ("second", &b)]);
        let hits = index.search(&emb(&[1.0, 0.0]), 2);
        assert_eq!(hits[0].0, "first");
        assert_eq!(hits[1].0, "second");
    }

    #[test]
    fn test_upsert_replaces_and_remove() {
        let mut index = CosineIndex::new(2);
        assert!(index.upsert("a", &emb(&[1.0, 0.0])));
        assert!(index.upsert("b", &emb(&[0.0, 1.0])));
        assert!(index.upsert("a", &emb(&[0.0, 1.0])));
        assert_eq!(index.len(), 2);
        assert!(index.remove("b"));
        assert!(!index.remove("b"));
        let (id, d) = index.nearest(&emb(&[0.0, 1.0])).unwrap();
        assert_eq!(id, "a");
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let mut index = CosineIndex::new(2);
        assert!(!index.upsert("a", &emb(&[1.0, 0.0, 0.0])));
        assert!(index.is_empty());
        assert!(index.search(&emb(&[1.0]), 1).is_empty());
    }

    #[test]
    fn test_empty_index_adopts_first_dimension() {
        let mut index = CosineIndex::build(std::iter::empty());
        assert!(index.upsert("a", &emb(&[1.0, 0.0, 0.0])));
        assert_eq!(index.dim(), 3);
    }
}
