//! Query-group data pipeline.
//!
//! Reads JSONL files of query groups: one query plus its candidate list
//! (positive first), each as precomputed token features, optionally with
//! teacher scores per candidate. Does NOT tokenize or run the transformer
//! body; those produce the features upstream.
//!
//! ```json
//! {"query": [[0.1, 0.2], ...], "candidates": [[[...], ...], ...], "scores": [9.1, 3.2, ...]}
//! ```

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::model::bridge::{sequences_to_input, values_to_tensor};
use crate::training::objective::{DualEncoderBatch, RerankerBatch};

/// One query with its candidates. Candidate 0 is the positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryGroup {
    /// Token features of the query, `(seq, d_model)`.
    pub query: Vec<Vec<f32>>,
    /// Token features of each candidate, `(n_candidates, seq, d_model)`.
    pub candidates: Vec<Vec<Vec<f32>>>,
    /// Teacher relevance score per candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<f32>>,
}

impl QueryGroup {
    /// Check shapes and keep exactly `n_negatives + 1` candidates (and scores).
    fn normalize(&mut self, n_negatives: usize, dim: usize) -> std::result::Result<(), String> {
        let group = n_negatives + 1;
        if self.candidates.len() < group {
            return Err(format!(
                "group has {} candidates, need at least {group}",
                self.candidates.len()
            ));
        }
        self.candidates.truncate(group);

        if let Some(scores) = &mut self.scores {
            if scores.len() < group {
                return Err(format!(
                    "group has {} teacher scores, need at least {group}",
                    scores.len()
                ));
            }
            scores.truncate(group);
        }

        let sequences = std::iter::once(&self.query).chain(self.candidates.iter());
        for (i, seq) in sequences.enumerate() {
            if seq.is_empty() {
                return Err(format!("sequence {i} has no tokens"));
            }
            if let Some(token) = seq.iter().find(|t| t.len() != dim) {
                return Err(format!(
                    "sequence {i} has token width {}, expected {dim}",
                    token.len()
                ));
            }
        }
        Ok(())
    }

    fn token_width(&self) -> Option<usize> {
        self.query.first().map(Vec::len)
    }
}

/// Validated query groups with a fixed candidate count and feature width.
#[derive(Debug, Clone)]
pub struct GroupDataset {
    groups: Vec<QueryGroup>,
    n_negatives: usize,
    dim: usize,
}

impl GroupDataset {
    /// Validate in-memory groups.
    pub fn new(groups: Vec<QueryGroup>, n_negatives: usize) -> Result<Self> {
        let mut dataset = Self {
            groups: Vec::with_capacity(groups.len()),
            n_negatives,
            dim: 0,
        };
        for (i, group) in groups.into_iter().enumerate() {
            dataset
                .push(group)
                .map_err(|message| TrainError::InvalidBatch(format!("group {i}: {message}")))?;
        }
        Ok(dataset)
    }

    /// Load groups from a JSONL file. Blank lines are skipped.
    pub fn load(path: &Path, n_negatives: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut dataset = Self {
            groups: Vec::new(),
            n_negatives,
            dim: 0,
        };

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let data_error = |message: String| TrainError::Data {
                path: path.to_path_buf(),
                line: idx + 1,
                message,
            };
            let group: QueryGroup =
                serde_json::from_str(&line).map_err(|e| data_error(e.to_string()))?;
            dataset.push(group).map_err(data_error)?;
        }

        let with_scores = dataset.groups.iter().filter(|g| g.scores.is_some()).count();
        tracing::info!(
            path = %path.display(),
            groups = dataset.groups.len(),
            with_scores,
            n_negatives,
            dim = dataset.dim,
            "Loaded query groups"
        );
        Ok(dataset)
    }

    fn push(&mut self, mut group: QueryGroup) -> std::result::Result<(), String> {
        let dim = match (self.dim, group.token_width()) {
            (_, None) => return Err("query has no tokens".into()),
            (0, Some(w)) => w,
            (d, Some(_)) => d,
        };
        if dim == 0 {
            return Err("token feature width must be > 0".into());
        }
        group.normalize(self.n_negatives, dim)?;
        self.dim = dim;
        self.groups.push(group);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Token feature width (`d_model`).
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_negatives(&self) -> usize {
        self.n_negatives
    }

    pub fn groups(&self) -> &[QueryGroup] {
        &self.groups
    }

    /// Whether every group carries teacher scores.
    pub fn has_teacher_scores(&self) -> bool {
        !self.groups.is_empty() && self.groups.iter().all(|g| g.scores.is_some())
    }

    /// Shuffled group indices split into batches; the last batch may be short.
    pub fn epoch_batches(&self, batch_size: usize, rng: &mut impl Rng) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.groups.len().div_ceil(batch_size.max(1))
    }

    pub fn select(&self, indices: &[usize]) -> Vec<&QueryGroup> {
        indices.iter().filter_map(|&i| self.groups.get(i)).collect()
    }
}

/// Write groups as JSONL.
pub fn write_groups(path: &Path, groups: &[QueryGroup]) -> Result<()> {
    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for group in groups {
        serde_json::to_writer(&mut writer, group)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Build a device batch from query groups.
pub trait Collate<B: Backend>: Sized {
    fn collate(groups: &[&QueryGroup], device: &B::Device) -> Result<Self>;
}

/// Teacher scores flattened across the batch, or `None` unless every group has them.
fn collate_scores<B: Backend>(groups: &[&QueryGroup], device: &B::Device) -> Option<Tensor<B, 1>> {
    let mut flat = Vec::new();
    for group in groups {
        flat.extend_from_slice(group.scores.as_deref()?);
    }
    Some(values_to_tensor(&flat, device))
}

impl<B: Backend> Collate<B> for DualEncoderBatch<B> {
    fn collate(groups: &[&QueryGroup], device: &B::Device) -> Result<Self> {
        let queries: Vec<&[Vec<f32>]> = groups.iter().map(|g| g.query.as_slice()).collect();
        let docs: Vec<&[Vec<f32>]> = groups
            .iter()
            .flat_map(|g| g.candidates.iter().map(Vec::as_slice))
            .collect();

        Ok(DualEncoderBatch {
            queries: sequences_to_input(&queries, device)?,
            docs: sequences_to_input(&docs, device)?,
            scores: collate_scores(groups, device),
        })
    }
}

impl<B: Backend> Collate<B> for RerankerBatch<B> {
    /// Each pair is the query tokens followed by the candidate tokens.
    fn collate(groups: &[&QueryGroup], device: &B::Device) -> Result<Self> {
        let pairs: Vec<Vec<Vec<f32>>> = groups
            .iter()
            .flat_map(|g| {
                g.candidates
                    .iter()
                    .map(|c| g.query.iter().chain(c.iter()).cloned().collect())
            })
            .collect();
        let refs: Vec<&[Vec<f32>]> = pairs.iter().map(Vec::as_slice).collect();

        Ok(RerankerBatch {
            pairs: sequences_to_input(&refs, device)?,
            scores: collate_scores(groups, device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::SeedableRng;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn group(q_len: usize, n_candidates: usize, dim: usize, scores: bool) -> QueryGroup {
        QueryGroup {
            query: vec![vec![1.0; dim]; q_len],
            candidates: (0..n_candidates)
                .map(|c| vec![vec![c as f32; dim]; c + 1])
                .collect(),
            scores: scores.then(|| (0..n_candidates).map(|c| 10.0 - c as f32).collect()),
        }
    }

    #[test]
    fn test_candidates_truncated_to_group_size() {
        let dataset = GroupDataset::new(vec![group(2, 5, 3, true)], 2).unwrap();
        let g = &dataset.groups()[0];
        assert_eq!(g.candidates.len(), 3);
        assert_eq!(g.scores.as_ref().unwrap(), &vec![10.0, 9.0, 8.0]);
        assert_eq!(dataset.dim(), 3);
    }

    #[test]
    fn test_too_few_candidates_rejected() {
        let err = GroupDataset::new(vec![group(2, 2, 3, false)], 2).unwrap_err();
        assert!(err.to_string().contains("group 0"), "{err}");
    }

    #[test]
    fn test_inconsistent_width_rejected() {
        let err = GroupDataset::new(vec![group(1, 2, 3, false), group(1, 2, 4, false)], 1).unwrap_err();
        assert!(err.to_string().contains("group 1"), "{err}");
    }

    #[test]
    fn test_load_jsonl_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("groups.jsonl");
        write_groups(&path, &[group(1, 3, 2, true), group(2, 3, 2, false)]).unwrap();

        let dataset = GroupDataset::load(&path, 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(!dataset.has_teacher_scores());

        let bad = dir.path().join("bad.jsonl");
        std::fs::write(&bad, "\n{\"query\": [[1.0]], \"candidates\": [[[1.0]]]}\nnot json\n").unwrap();
        let err = GroupDataset::load(&bad, 0).unwrap_err();
        match err {
            TrainError::Data { line, .. } => assert_eq!(line, 3),
            other => panic!("expected data error, got {other}"),
        }
    }

    #[test]
    fn test_epoch_batches_cover_every_group() {
        let groups = (0..7).map(|_| group(1, 2, 2, false)).collect();
        let dataset = GroupDataset::new(groups, 1).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let batches = dataset.epoch_batches(3, &mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(dataset.num_batches(3), 3);
        assert_eq!(batches[2].len(), 1);

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_collate_dual_encoder_batch() {
        let device = Default::default();
        let dataset = GroupDataset::new(vec![group(2, 3, 4, true), group(1, 3, 4, true)], 2).unwrap();
        let groups = dataset.select(&[0, 1]);

        let batch = DualEncoderBatch::<TestBackend>::collate(&groups, &device).unwrap();
        assert_eq!(batch.queries.features.dims(), [2, 2, 4]);
        assert_eq!(batch.docs.features.dims(), [6, 3, 4]);
        assert_eq!(batch.scores.unwrap().dims(), [6]);
    }

    #[test]
    fn test_collate_reranker_pairs_and_missing_scores() {
        let device = Default::default();
        let dataset = GroupDataset::new(vec![group(2, 2, 3, true), group(2, 2, 3, false)], 1).unwrap();
        let groups = dataset.select(&[0, 1]);

        let batch = RerankerBatch::<TestBackend>::collate(&groups, &device).unwrap();
        // query (2 tokens) + longest candidate (2 tokens)
        assert_eq!(batch.pairs.features.dims(), [4, 4, 3]);
        assert!(batch.scores.is_none(), "scores dropped when any group lacks them");
    }
}
