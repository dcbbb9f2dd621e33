use std::{
    fs,
    path::{Path, PathBuf},
};

use ahash::AHashSet;
use itertools::Itertools;
use lazy_static::lazy_static;
use ordered_float::NotNan;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    clustering::{BucketRun, BucketState, PlannedRun, RejectReason},
    errors::{PipelineError, Result},
    structures::{Bucket, ClusteringCandidate, ClusteringSelection},
};

lazy_static! {
    static ref OUTLIERS: Regex = Regex::new(r"# Trash cluster: removed ([0-9]*) outliers").unwrap();
    static ref GROUP_TAG: Regex = Regex::new(r"(\d+)of(\d+)").unwrap();
}

const KLD_SUFFIX: &str = ".KLDvsClusters.tab";

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut paths = vec![];
    for e in entries {
        paths.push(e.map_err(|e| PipelineError::io(dir, e))?.path());
    }
    paths.sort();
    Ok(paths)
}

fn file_name(p: &Path) -> &str {
    p.file_name().and_then(|f| f.to_str()).unwrap_or_default()
}

fn find_by_suffix(dir: &Path, suffix: &str) -> Result<PathBuf> {
    sorted_entries(dir)?
        .into_iter()
        .find(|p| p.is_file() && file_name(p).ends_with(suffix))
        .ok_or_else(|| {
            PipelineError::parse_format(
                "clustering output",
                format!("no `*{}` file in {}", suffix, dir.display()),
            )
        })
}

/// The tool writes either straight into its working directory or into a
/// single `<run-name>_<id>/` subdirectory of it; returns whichever holds
/// `images/`.
pub fn resolve_output_root(run_dir: &Path) -> Result<PathBuf> {
    if run_dir.join("images").is_dir() {
        return Ok(run_dir.to_path_buf());
    }
    sorted_entries(run_dir)?
        .into_iter()
        .find(|p| p.join("images").is_dir())
        .ok_or_else(|| {
            PipelineError::parse_format(
                "clustering output",
                format!("no results directory under {}", run_dir.display()),
            )
        })
}

/// Per-group divergences from `images/*.KLDvsClusters.tab`: the second line,
/// minus its leading group-count token.
pub fn read_kl_divergence(root: &Path, group_count: usize) -> Result<Vec<f64>> {
    let path = find_by_suffix(&root.join("images"), KLD_SUFFIX)?;
    let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
    let what = path.display().to_string();
    let line = text
        .lines()
        .nth(1)
        .ok_or_else(|| PipelineError::parse_format(&what, "missing divergence line"))?;
    let values = line
        .split_whitespace()
        .skip(1)
        .map(|t| {
            t.parse::<f64>()
                .ok()
                .and_then(|v| NotNan::new(v).ok())
                .map(NotNan::into_inner)
                .ok_or_else(|| PipelineError::parse_format(&what, format!("bad divergence `{}`", t)))
        })
        .collect::<Result<Vec<f64>>>()?;
    if values.len() != group_count {
        return Err(PipelineError::parse_format(
            what,
            format!("expected {} divergences, found {}", group_count, values.len()),
        ));
    }
    Ok(values)
}

/// Outliers moved to the trash cluster, from `res/*.<k>g.out`; 0 when the
/// run reports none.
pub fn read_outlier_count(root: &Path, group_count: usize) -> Result<usize> {
    let path = find_by_suffix(&root.join("res"), &format!(".{}g.out", group_count))?;
    let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
    Ok(OUTLIERS
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0))
}

pub fn read_candidate(bucket: &Bucket, run: &PlannedRun) -> Result<ClusteringCandidate> {
    let root = resolve_output_root(&run.directory)?;
    Ok(ClusteringCandidate {
        bucket: bucket.clone(),
        group_count: run.group_count,
        kl_divergence: read_kl_divergence(&root, run.group_count)?,
        outlier_count: read_outlier_count(&root, run.group_count)?,
        output_directory: root,
    })
}

/// Greedy max over `score()`: strictly higher wins, ties keep the earlier one.
pub fn select_best(candidates: &[ClusteringCandidate]) -> Option<&ClusteringCandidate> {
    let mut best: Option<&ClusteringCandidate> = None;
    for c in candidates {
        if best.map_or(true, |b| c.score() > b.score()) {
            best = Some(c);
        }
    }
    best
}

fn group_tag(p: &Path) -> Option<(usize, usize)> {
    let caps = GROUP_TAG.captures(file_name(p))?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Zero-based group a `cores/` or `matrices/` file belongs to, from the
/// `<i>of<k>` tag in its name.
pub fn group_index(p: &Path) -> Option<usize> {
    group_tag(p).and_then(|(i, _)| i.checked_sub(1))
}

/// Files of a finished run whose name carries `<i>of<k>`, ordered by `i`.
fn group_files(dir: &Path, group_count: usize) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter_map(|p| match group_tag(&p) {
            Some((i, k)) if k == group_count => Some((i, p)),
            _ => None,
        })
        .sorted_by_key(|(i, _)| *i)
        .map(|(_, p)| p)
        .collect())
}

pub fn build_selection(candidate: ClusteringCandidate) -> Result<ClusteringSelection> {
    let root = candidate.output_directory.clone();
    let k = candidate.group_count;
    let peptide_groups_file = find_by_suffix(&root.join("res"), &format!(".{}g.ds.out", k))
        .unwrap_or_else(|_| root.join("res").join(format!("gibbs.{}g.ds.out", k)));
    Ok(ClusteringSelection {
        motif_count: candidate.motif_count(),
        cores: group_files(&root.join("cores"), k)?,
        matrices: group_files(&root.join("matrices"), k)?,
        peptide_groups_file,
        candidate,
    })
}

/// `(group, peptide)` pairs from a `res/*.<k>g.ds.out` assignment file.
pub fn read_peptide_groups(path: &Path) -> Result<Vec<(usize, String)>> {
    let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let what = path.display().to_string();
    text.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let fields = l.split_whitespace().collect_vec();
            match (fields.get(1).and_then(|g| g.parse().ok()), fields.get(3)) {
                (Some(g), Some(p)) => Ok((g, p.to_string())),
                _ => Err(PipelineError::parse_format(&what, format!("bad assignment row: {}", l))),
            }
        })
        .collect()
}

/// Moves an `Attempted` bucket to `Selected` or `Rejected`. Runs whose
/// directory is in `failed_dirs` are skipped, as are runs with unreadable
/// output; if nothing usable is left the bucket is rejected as an execution
/// failure.
pub fn resolve_bucket(run: &mut BucketRun, failed_dirs: &AHashSet<PathBuf>) -> Result<()> {
    let BucketState::Attempted { runs } = &run.state else {
        return Ok(());
    };
    let mut candidates = vec![];
    for planned in runs {
        if failed_dirs.contains(&planned.directory) {
            warn!(bucket = %run.bucket, groups = planned.group_count, "clustering run failed, skipping");
            continue;
        }
        match read_candidate(&run.bucket, planned) {
            Ok(c) => {
                debug!(bucket = %run.bucket, groups = c.group_count, score = c.score(), "read candidate");
                candidates.push(c);
            }
            Err(e) => warn!(bucket = %run.bucket, groups = planned.group_count, "unreadable clustering run: {}", e),
        }
    }
    let attempted = runs.len();
    run.state = match select_best(&candidates) {
        Some(best) => {
            info!(
                bucket = %run.bucket,
                groups = best.group_count,
                motifs = best.motif_count(),
                "selected clustering"
            );
            BucketState::Selected(Box::new(build_selection(best.clone())?))
        }
        None => {
            warn!(bucket = %run.bucket, "no clustering run produced usable output");
            BucketState::Rejected(RejectReason::ExecutionFailure { attempted })
        }
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::BucketKind;

    /// Lays out what one clustering run leaves behind, nested one level deep
    /// the way the tool does it.
    fn fake_run(run_dir: &Path, k: usize, klds: &[f64], outliers: usize) -> PathBuf {
        let root = run_dir.join(format!("{}groups_1234", k));
        for d in ["images", "res", "cores", "matrices"] {
            fs::create_dir_all(root.join(d)).unwrap();
        }
        let kld_line = std::iter::once(k.to_string())
            .chain(klds.iter().map(|v| v.to_string()))
            .join(" ");
        fs::write(
            root.join("images").join("gibbs.KLDvsClusters.tab"),
            format!("# KLD per cluster\n{}\n", kld_line),
        )
        .unwrap();
        fs::write(
            root.join("res").join(format!("gibbs.{}g.out", k)),
            format!("# some log\n# Trash cluster: removed {} outliers\n", outliers),
        )
        .unwrap();
        fs::write(
            root.join("res").join(format!("gibbs.{}g.ds.out", k)),
            "G Gn Num Sequence\n1 0 1 SIINFEKLA\n1 1 2 GILGFVFTL\n",
        )
        .unwrap();
        for i in (1..=k).rev() {
            fs::write(root.join("cores").join(format!("gibbs.{}of{}.core", i, k)), "SIINFEKL\n").unwrap();
            fs::write(root.join("matrices").join(format!("gibbs.{}of{}.mat", i, k)), "").unwrap();
        }
        root
    }

    fn planned(dir: &Path, k: usize) -> PlannedRun {
        PlannedRun {
            group_count: k,
            directory: dir.join(format!("{}groups", k)),
        }
    }

    #[test]
    fn picks_the_highest_divergence_sum() {
        let dir = tempfile::tempdir().unwrap();
        let sums = [0.1, 0.9, 0.7, 0.5, 0.3, 0.2];
        let mut runs = vec![];
        for (i, s) in sums.iter().enumerate() {
            let k = i + 1;
            let p = planned(dir.path(), k);
            let mut klds = vec![0.0; k];
            klds[0] = *s;
            fake_run(&p.directory, k, &klds, 3);
            runs.push(p);
        }
        let mut run = BucketRun {
            bucket: Bucket::new("s1", BucketKind::Unsupervised),
            state: BucketState::Attempted { runs },
        };
        resolve_bucket(&mut run, &AHashSet::new()).unwrap();
        let sel = run.state.selection().expect("selected");
        assert_eq!(sel.group_count(), 2);
        assert_eq!(sel.motif_count, 1);
        assert_eq!(sel.outlier_count(), 3);
        assert_eq!(sel.cores.len(), 2);
        assert!(file_name(&sel.cores[0]).starts_with("gibbs.1of2"));
        assert!(file_name(&sel.matrices[1]).starts_with("gibbs.2of2"));
        let groups = read_peptide_groups(&sel.peptide_groups_file).unwrap();
        assert_eq!(groups, vec![(0, "SIINFEKLA".to_string()), (1, "GILGFVFTL".to_string())]);
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let cand = |k: usize, v: f64| ClusteringCandidate {
            bucket: Bucket::new("s", BucketKind::Unsupervised),
            group_count: k,
            output_directory: PathBuf::new(),
            kl_divergence: vec![v],
            outlier_count: 0,
        };
        let cands = vec![cand(1, 0.4), cand(2, 0.4), cand(3, 0.1)];
        assert_eq!(select_best(&cands).unwrap().group_count, 1);
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn zero_divergence_counts_for_score_but_not_motifs() {
        let c = ClusteringCandidate {
            bucket: Bucket::new("s", BucketKind::Unsupervised),
            group_count: 3,
            output_directory: PathBuf::new(),
            kl_divergence: vec![0.5, 0.0, 0.25],
            outlier_count: 0,
        };
        assert_eq!(c.score(), 0.75);
        assert_eq!(c.motif_count(), 2);
    }

    #[test]
    fn all_runs_failing_is_an_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runs = vec![planned(dir.path(), 1), planned(dir.path(), 2)];
        for r in &runs {
            fs::create_dir_all(&r.directory).unwrap();
        }
        let mut failed = AHashSet::new();
        failed.insert(runs[0].directory.clone());
        let mut run = BucketRun {
            bucket: Bucket::new("s1", BucketKind::Unannotated),
            state: BucketState::Attempted { runs },
        };
        resolve_bucket(&mut run, &failed).unwrap();
        assert_eq!(
            run.state,
            BucketState::Rejected(RejectReason::ExecutionFailure { attempted: 2 })
        );
    }

    #[test]
    fn divergence_count_must_match_group_count() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_run(dir.path(), 3, &[0.1, 0.2], 0);
        assert!(matches!(
            read_kl_divergence(&root, 3),
            Err(PipelineError::ParseFormat { .. })
        ));
        assert_eq!(resolve_output_root(dir.path()).unwrap(), root);
    }

    #[test]
    fn missing_trash_line_means_no_outliers() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_run(dir.path(), 1, &[0.3], 0);
        fs::write(root.join("res").join("gibbs.1g.out"), "# nothing here\n").unwrap();
        assert_eq!(read_outlier_count(&root, 1).unwrap(), 0);
    }
}
