//! Collections and their vector-index configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Distance metric of a collection's vector index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
    Dot,
}

impl Metric {
    /// Raw score between two vectors of equal length.
    ///
    /// Cosine and dot are similarities (higher is better); euclidean is a
    /// distance (lower is better). A zero vector has cosine similarity 0.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Dot => dot(a, b),
            Metric::Cosine => {
                let na = dot(a, a).sqrt();
                let nb = dot(b, b).sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot(a, b) / (na * nb)
                }
            }
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    pub fn higher_is_better(self) -> bool {
        !matches!(self, Metric::Euclidean)
    }

    /// Ordering of two scores, best first.
    pub fn rank(self, a: f32, b: f32) -> std::cmp::Ordering {
        let ord = a.total_cmp(&b);
        if self.higher_is_better() { ord.reverse() } else { ord }
    }

    /// Whether `score` satisfies a threshold: a floor for similarities, a
    /// ceiling for distances.
    pub fn passes(self, score: f32, threshold: f32) -> bool {
        if self.higher_is_better() { score >= threshold } else { score <= threshold }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A named namespace of nodes and edges with one vector-index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, dimension: usize, metric: Metric) -> Result<Self> {
        let cfg = Self { name: name.into(), dimension, metric, created_at: Utc::now() };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        validate_collection_name(&self.name)?;
        if self.dimension == 0 {
            return Err(Error::InvalidArgument("collection dimension must be > 0".into()));
        }
        Ok(())
    }

    /// Reject embeddings whose shape doesn't match the collection.
    pub fn check_vector(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "embedding has dimension {}, collection '{}' expects {}",
                v.len(), self.name, self.dimension
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidArgument("embedding contains non-finite values".into()));
        }
        Ok(())
    }
}

/// Collection names are namespace names: `[A-Za-z0-9_-]+`, not starting with `_`
/// (reserved for internal namespaces such as the catalog).
pub fn validate_collection_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid collection name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        assert_eq!(Metric::Cosine.score(&[0.0; 4], &[1.0, 0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_direction() {
        use std::cmp::Ordering;
        assert_eq!(Metric::Cosine.rank(0.9, 0.1), Ordering::Less);
        assert_eq!(Metric::Euclidean.rank(0.9, 0.1), Ordering::Greater);
        assert!(Metric::Euclidean.passes(0.5, 1.0));
        assert!(!Metric::Dot.passes(0.5, 1.0));
    }

    #[test]
    fn test_dimension_checks() {
        assert!(CollectionConfig::new("docs", 0, Metric::Cosine).is_err());
        let cfg = CollectionConfig::new("docs", 3, Metric::Cosine).unwrap();
        assert!(cfg.check_vector(&[1.0, 2.0]).is_err());
        assert!(cfg.check_vector(&[1.0, 2.0, f32::NAN]).is_err());
        assert!(cfg.check_vector(&[1.0, 2.0, 3.0]).is_ok());
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection_name("agent-memory_1").is_ok());
        assert!(validate_collection_name("_catalog").is_err());
        assert!(validate_collection_name("a b").is_err());
    }
}
