//! Face similarity search over a resolved folder scope.
//!
//! Candidate embeddings are loaded for the scope and compared in-process with
//! cosine similarity. The search performs no authorization of its own; the
//! caller passes a scope built from the access resolver.

use rusqlite::types::Value;
use rusqlite::params_from_iter;
use std::cmp::Ordering;

use super::faces::{face_from_row, Face, FACE_COLUMNS};
use super::photos::{photo_columns, photo_from_row, Photo};
use super::{Database, Scope};
use crate::error::{Error, Result};

/// Number of columns in [`FACE_COLUMNS`].
const FACE_COLUMN_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub scope: Scope,
    pub embedding: Vec<f32>,
    pub limit: i64,
    /// Minimum similarity in [0, 1]; weaker matches are dropped, not ranked.
    pub threshold: f32,
    /// Leave this face out, used when searching with an existing face.
    pub exclude_face_id: Option<i64>,
}

/// A face close to the query, with its photo
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub face: Face,
    pub photo: Photo,
    pub similarity: f32,
}

impl Database {
    /// Rank faces in scope by similarity to the query embedding.
    ///
    /// Results have `similarity >= threshold`, are ordered by similarity
    /// descending with ties broken by photo creation time (newest first),
    /// and hold at most `limit` entries. Invalid thresholds, non-positive
    /// limits and embeddings of the wrong length are rejected before any read.
    pub fn search_similar_faces(&self, query: &SimilarityQuery) -> Result<Vec<FaceMatch>> {
        if !(0.0..=1.0).contains(&query.threshold) {
            return Err(Error::invalid(
                "threshold",
                format!("{} is outside [0, 1]", query.threshold),
            ));
        }
        if query.limit <= 0 {
            return Err(Error::invalid("limit", "must be positive"));
        }
        self.validate_embedding(&query.embedding)?;

        let Some((filter, mut args)) = query.scope.photo_filter("p") else {
            return Ok(Vec::new());
        };
        let mut sql = format!(
            r#"
            SELECT {FACE_COLUMNS}, {}
            FROM faces f
            JOIN photos p ON p.id = f.photo_id
            WHERE p.is_trashed = 0 AND {filter}
            "#,
            photo_columns(Some("p"))
        );
        if let Some(exclude) = query.exclude_face_id {
            sql.push_str(" AND f.id != ?");
            args.push(Value::Integer(exclude));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;
        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let face = face_from_row(row, 0)?;
            let similarity = normalized_similarity(&query.embedding, &face.embedding);
            if similarity < query.threshold {
                continue;
            }
            let photo = photo_from_row(row, FACE_COLUMN_COUNT)?;
            matches.push(FaceMatch {
                face,
                photo,
                similarity,
            });
        }

        matches.sort_by(rank);
        matches.truncate(query.limit as usize);
        Ok(matches)
    }
}

fn rank(a: &FaceMatch, b: &FaceMatch) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.photo.created_at.cmp(&a.photo.created_at))
        .then_with(|| b.face.id.cmp(&a.face.id))
}

/// Cosine similarity clamped to [0, 1]; opposite directions count as unrelated.
pub fn normalized_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).clamp(0.0, 1.0)
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
