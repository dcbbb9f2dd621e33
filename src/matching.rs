use std::{fs, path::Path};

use fixedbitset::FixedBitSet;
use itertools::Itertools;
use ndarray::{Array, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    errors::{PipelineError, Result},
    structures::Alignment,
};

/// Amino-acid columns in a position weight matrix.
pub const ALPHABET_SIZE: usize = 20;

/// Position-by-residue weights of one motif.
#[derive(Debug, Clone, PartialEq)]
pub struct MotifMatrix(Array2<f64>);

impl MotifMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let width = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != width) {
            return Err(PipelineError::parse_format("motif matrix", "ragged rows"));
        }
        let n = rows.len();
        let flat = rows.into_iter().flatten().collect_vec();
        Array::from_shape_vec((n, width), flat)
            .map(MotifMatrix)
            .map_err(|e| PipelineError::parse_format("motif matrix", e.to_string()))
    }

    /// Reads a `matrices/*.mat` file: two header lines, then one row per
    /// position with the residue weights in fields 2..22.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let what = path.display().to_string();
        let rows = text
            .lines()
            .skip(2)
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                let fields = l.split_whitespace().collect_vec();
                if fields.len() < 2 + ALPHABET_SIZE {
                    return Err(PipelineError::parse_format(
                        &what,
                        format!("expected {} fields, found {}", 2 + ALPHABET_SIZE, fields.len()),
                    ));
                }
                fields[2..2 + ALPHABET_SIZE]
                    .iter()
                    .map(|t| {
                        t.parse::<f64>()
                            .map_err(|_| PipelineError::parse_format(&what, format!("bad weight `{}`", t)))
                    })
                    .collect::<Result<Vec<f64>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Err(PipelineError::parse_format(what, "no matrix rows"));
        }
        Self::from_rows(rows)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.dim()
    }
}

/// Cosine of the angle between the two matrices read as flat vectors; 0 when
/// the shapes differ or either one is all zeros.
pub fn cosine_similarity(a: &MotifMatrix, b: &MotifMatrix) -> f64 {
    if a.shape() != b.shape() {
        return 0.0;
    }
    let dot: f64 = a.0.iter().zip(b.0.iter()).map(|(x, y)| x * y).sum();
    let na = a.0.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.0.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

struct Search<'a> {
    sim: &'a Array2<f64>,
    used: FixedBitSet,
    current: Vec<Option<usize>>,
    best: Vec<Option<usize>>,
    best_score: f64,
}

impl<'a> Search<'a> {
    fn visit(&mut self, slot: usize, blanks_left: usize, score: f64) {
        let (n_ref, n_target) = self.sim.dim();
        if slot == n_ref {
            if score > self.best_score {
                self.best_score = score;
                self.best = self.current.clone();
            }
            return;
        }
        for j in 0..n_target {
            if self.used.contains(j) {
                continue;
            }
            self.used.insert(j);
            self.current.push(Some(j));
            self.visit(slot + 1, blanks_left, score + self.sim[[slot, j]]);
            self.current.pop();
            self.used.set(j, false);
        }
        if blanks_left > 0 {
            self.current.push(None);
            self.visit(slot + 1, blanks_left - 1, score);
            self.current.pop();
        }
    }
}

/// Assigns each reference slot a distinct target group or a blank so that the
/// summed similarity is maximal. Every assignment is tried, in lexicographic
/// order with real groups before the blank; ties keep the first one found.
pub fn align_pair(reference: &[MotifMatrix], target: &[MotifMatrix]) -> Vec<Option<usize>> {
    let (n_ref, n_target) = (reference.len(), target.len());
    let mut sim = Array2::<f64>::zeros((n_ref, n_target));
    for (i, r) in reference.iter().enumerate() {
        for (j, t) in target.iter().enumerate() {
            sim[[i, j]] = cosine_similarity(r, t);
        }
    }
    let mut search = Search {
        sim: &sim,
        used: FixedBitSet::with_capacity(n_target),
        current: Vec::with_capacity(n_ref),
        best: vec![None; n_ref],
        best_score: f64::NEG_INFINITY,
    };
    search.visit(0, n_ref - n_ref.min(n_target), 0.0);
    debug!(n_ref, n_target, score = search.best_score, "aligned motifs");
    search.best
}

/// Left-to-right order of motif logos across samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MotifOrdering {
    /// no sample has any motif to show
    TooFewPeptides,
    Aligned {
        reference: String,
        max_logos: usize,
        /// one per non-reference sample
        alignments: Vec<Alignment>,
    },
}

/// Picks the sample with the most motifs as reference (first one on ties)
/// and aligns every other sample against it independently.
pub fn align_samples(samples: &[(String, Vec<MotifMatrix>)]) -> MotifOrdering {
    let mut reference: Option<&(String, Vec<MotifMatrix>)> = None;
    for s in samples {
        if reference.map_or(true, |r| s.1.len() > r.1.len()) {
            reference = Some(s);
        }
    }
    let (ref_name, ref_matrices) = match reference {
        Some(r) if !r.1.is_empty() => r,
        _ => return MotifOrdering::TooFewPeptides,
    };
    let alignments = samples
        .iter()
        .filter(|(name, _)| name != ref_name)
        .map(|(name, matrices)| Alignment {
            sample: name.clone(),
            slots: align_pair(ref_matrices, matrices),
        })
        .collect();
    MotifOrdering::Aligned {
        reference: ref_name.clone(),
        max_logos: ref_matrices.len(),
        alignments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(hot: &[usize]) -> MotifMatrix {
        let rows = hot
            .iter()
            .map(|&h| (0..ALPHABET_SIZE).map(|i| if i == h { 1.0 } else { 0.05 }).collect())
            .collect();
        MotifMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        let a = one_hot(&[0, 1, 2]);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-12);
        let x = MotifMatrix::from_rows(vec![vec![1.0, 0.0]]).unwrap();
        let y = MotifMatrix::from_rows(vec![vec![0.0, 1.0]]).unwrap();
        assert_eq!(cosine_similarity(&x, &y), 0.0);
        let zero = MotifMatrix::from_rows(vec![vec![0.0, 0.0]]).unwrap();
        assert_eq!(cosine_similarity(&x, &zero), 0.0);
        assert_eq!(cosine_similarity(&a, &x), 0.0);
    }

    #[test]
    fn swapped_groups_are_unshuffled() {
        let a = one_hot(&[0, 3, 5, 7]);
        let b = one_hot(&[9, 11, 13, 19]);
        let slots = align_pair(&[a.clone(), b.clone()], &[b, a]);
        assert_eq!(slots, vec![Some(1), Some(0)]);
    }

    #[test]
    fn shorter_target_leaves_blanks() {
        let r = [one_hot(&[0, 1]), one_hot(&[2, 3]), one_hot(&[4, 5])];
        let t = [one_hot(&[2, 3])];
        let slots = align_pair(&r, &t);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots.iter().flatten().collect_vec(), vec![&0]);
        assert_eq!(slots[1], Some(0));
        assert_eq!(slots.iter().filter(|s| s.is_none()).count(), 2);
    }

    #[test]
    fn equal_scores_keep_the_first_assignment() {
        let m = one_hot(&[0, 1]);
        let slots = align_pair(&[m.clone(), m.clone()], &[m.clone(), m]);
        assert_eq!(slots, vec![Some(0), Some(1)]);
    }

    #[test]
    fn reference_is_the_richest_sample() {
        let a = one_hot(&[0, 1]);
        let b = one_hot(&[5, 6]);
        let samples = vec![
            ("s1".to_string(), vec![b.clone()]),
            ("s2".to_string(), vec![a.clone(), b.clone()]),
            ("s3".to_string(), vec![b.clone(), a.clone()]),
        ];
        let MotifOrdering::Aligned { reference, max_logos, alignments } = align_samples(&samples) else {
            panic!("expected an alignment");
        };
        assert_eq!(reference, "s2");
        assert_eq!(max_logos, 2);
        assert_eq!(alignments.len(), 2);
        assert_eq!(alignments[0].slots, vec![None, Some(0)]);
        assert_eq!(alignments[1].slots, vec![Some(1), Some(0)]);
    }

    #[test]
    fn no_motifs_anywhere() {
        let samples = vec![("s1".to_string(), vec![]), ("s2".to_string(), vec![])];
        assert_eq!(align_samples(&samples), MotifOrdering::TooFewPeptides);
        assert_eq!(align_samples(&[]), MotifOrdering::TooFewPeptides);
    }

    #[test]
    fn reads_matrix_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gibbs.1of1.mat");
        let weights = (0..ALPHABET_SIZE).map(|i| format!("{:.2}", i as f64 / 10.0)).join(" ");
        let body = format!(
            "header one\n     A R N D C Q E G H I L K M F P S T W Y V\n1 S {w}\n2 I {w}\n",
            w = weights
        );
        fs::write(&path, body).unwrap();
        let m = MotifMatrix::from_path(&path).unwrap();
        assert_eq!(m.shape(), (2, ALPHABET_SIZE));
        fs::write(&path, "a\nb\n1 S 0.1 0.2\n").unwrap();
        assert!(matches!(
            MotifMatrix::from_path(&path),
            Err(PipelineError::ParseFormat { .. })
        ));
    }
}
