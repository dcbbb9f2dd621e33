use std::{
    fs::{create_dir_all, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use ahash::AHashSet;
use itertools::Itertools;
use rand::{seq::SliceRandom, Rng};

use crate::errors::{PipelineError, Result};

/// Inputs at or below this size go out as a single chunk.
pub const PARALLEL_THRESHOLD: usize = 100;

/// Deduplicates, shuffles and splits `peptides` into at most `worker_count`
/// chunks of at most `ceil(n / worker_count)` each. Shuffling spreads long,
/// slow-to-predict peptides across chunks.
pub fn partition<S>(peptides: &[S], worker_count: usize) -> Vec<Vec<String>>
where
    S: AsRef<str>,
{
    partition_with_rng(peptides, worker_count, &mut rand::thread_rng())
}

pub fn partition_with_rng<S, R>(peptides: &[S], worker_count: usize, rng: &mut R) -> Vec<Vec<String>>
where
    S: AsRef<str>,
    R: Rng + ?Sized,
{
    let mut seen = AHashSet::new();
    let mut unique = peptides
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| seen.insert(*p))
        .map(|p| p.to_string())
        .collect_vec();
    if unique.is_empty() {
        return vec![];
    }
    unique.shuffle(rng);
    let n = unique.len();
    if n <= PARALLEL_THRESHOLD {
        return vec![unique];
    }
    let w = worker_count.max(1);
    let chunk_size = (n + w - 1) / w;
    unique
        .chunks(chunk_size)
        .map(|c| c.to_vec())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Writes each chunk to `<dir>/peplist_<i>.txt` (1-based), one peptide per line.
pub fn write_chunks(chunks: &[Vec<String>], dir: &Path) -> Result<Vec<PathBuf>> {
    create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let path = dir.join(format!("peplist_{}.txt", i + 1));
            write_peptide_list(&path, chunk)?;
            Ok(path)
        })
        .collect()
}

pub fn write_peptide_list<S>(path: &Path, peptides: &[S]) -> Result<()>
where
    S: AsRef<str>,
{
    let io_err = |e| PipelineError::io(path, e);
    let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
    for p in peptides {
        writeln!(w, "{}", p.as_ref()).map_err(io_err)?;
    }
    w.flush().map_err(io_err)?;
    Ok(())
}
