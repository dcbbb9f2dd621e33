use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    balancer::write_peptide_list,
    config::ExternalContext,
    errors::{PipelineError, Result},
    external::{fixed_motif_length, gibbscluster_command},
    job::Job,
    predictions::PredictionTable,
    structures::{Bucket, BucketKind, ClusteringSelection, MhcClass},
};

/// Buckets with fewer peptides than this are never clustered.
pub const MIN_CLUSTER_PEPTIDES: usize = 20;

/// Group counts tried for the unannotated bucket.
const UNANNOTATED_GROUPS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// too few peptides to attempt clustering; no jobs were built
    InsufficientPeptides { count: usize },
    /// every attempted run crashed or left unreadable output
    ExecutionFailure { attempted: usize },
}

/// One clustering run planned for a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRun {
    pub group_count: usize,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BucketState {
    NotAttempted,
    Attempted { runs: Vec<PlannedRun> },
    Selected(Box<ClusteringSelection>),
    Rejected(RejectReason),
}

impl BucketState {
    pub fn selection(&self) -> Option<&ClusteringSelection> {
        match self {
            BucketState::Selected(s) => Some(s.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRun {
    pub bucket: Bucket,
    pub state: BucketState,
}

impl BucketRun {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            state: BucketState::NotAttempted,
        }
    }
}

/// Turns per-bucket peptide sets into clustering jobs, one per group count,
/// each in its own `<root>/<sample>/<bucket>/<k>groups/` directory.
pub struct ClusteringJobBuilder<'a> {
    root: PathBuf,
    ctxt: &'a ExternalContext,
}

impl<'a> ClusteringJobBuilder<'a> {
    pub fn new(root: impl Into<PathBuf>, ctxt: &'a ExternalContext) -> Self {
        Self {
            root: root.into(),
            ctxt,
        }
    }

    pub fn bucket_dir(&self, bucket: &Bucket) -> PathBuf {
        self.root
            .join(crate::peptides::sanitize_sample_name(&bucket.sample))
            .join(bucket.kind.dir_name())
    }

    pub fn group_counts(&self, kind: &BucketKind) -> std::ops::RangeInclusive<usize> {
        match kind {
            BucketKind::Unsupervised => 1..=self.ctxt.max_groups,
            BucketKind::Unannotated => 1..=UNANNOTATED_GROUPS,
            BucketKind::Allele(_) => 1..=1,
        }
    }

    fn fixed_length(&self, kind: &BucketKind) -> Option<usize> {
        match (self.ctxt.mhc_class, kind) {
            (MhcClass::I, BucketKind::Allele(a)) => Some(fixed_motif_length(a)),
            _ => None,
        }
    }

    /// Moves `run` out of `NotAttempted`: rejects it when fewer than
    /// `MIN_CLUSTER_PEPTIDES` length-filtered peptides remain, otherwise writes
    /// the peptide file and returns one job per group count, largest first.
    pub fn plan<S>(&self, run: &mut BucketRun, peptides: &[S]) -> Result<Vec<Job>>
    where
        S: AsRef<str>,
    {
        debug_assert_eq!(run.state, BucketState::NotAttempted);
        let kept = peptides
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| self.ctxt.accepts_length(p))
            .unique()
            .sorted()
            .collect_vec();
        if kept.len() < MIN_CLUSTER_PEPTIDES {
            info!(bucket = %run.bucket, peptides = kept.len(), "not enough peptides to cluster");
            run.state = BucketState::Rejected(RejectReason::InsufficientPeptides { count: kept.len() });
            return Ok(vec![]);
        }
        let dir = self.bucket_dir(&run.bucket);
        create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        let input = peptide_file(&dir);
        write_peptide_list(&input, &kept)?;
        let mut runs = vec![];
        let mut jobs = vec![];
        for k in self.group_counts(&run.bucket.kind).rev() {
            let run_dir = dir.join(run_dir_name(k));
            create_dir_all(&run_dir).map_err(|e| PipelineError::io(&run_dir, e))?;
            let command = gibbscluster_command(
                &self.ctxt.tools.gibbscluster,
                self.ctxt.mhc_class,
                &input,
                k,
                self.fixed_length(&run.bucket.kind),
            );
            let mut job = Job::new(format!("gibbscluster_{}_{}groups", run.bucket, k), command, run_dir.clone())
                .with_sample(run.bucket.sample.clone());
            if let BucketKind::Allele(a) = &run.bucket.kind {
                job = job.with_allele(a.clone());
            }
            jobs.push(job);
            runs.push(PlannedRun {
                group_count: k,
                directory: run_dir,
            });
        }
        // selection walks runs in ascending group count
        runs.reverse();
        debug!(bucket = %run.bucket, jobs = jobs.len(), "planned clustering runs");
        run.state = BucketState::Attempted { runs };
        Ok(jobs)
    }
}

/// Peptide sets per bucket of one sample: everything (unsupervised), the
/// binders of each allele, and the peptides binding none of them
/// (unannotated).
pub fn sample_buckets(
    table: &PredictionTable,
    sample: &str,
    alleles: &[String],
    peptides: &[String],
) -> Vec<(Bucket, Vec<String>)> {
    let mut out = vec![(
        Bucket::new(sample, BucketKind::Unsupervised),
        peptides.to_vec(),
    )];
    let mut unannotated = table.sample_peptides(sample);
    for allele in alleles {
        let binders = table.binders(sample, allele);
        unannotated.retain(|p| !binders.contains(p));
        out.push((
            Bucket::new(sample, BucketKind::Allele(allele.clone())),
            binders.into_iter().map(|p| p.to_string()).sorted().collect(),
        ));
    }
    out.push((
        Bucket::new(sample, BucketKind::Unannotated),
        unannotated.into_iter().map(|p| p.to_string()).sorted().collect(),
    ));
    out
}

pub fn run_dir_name(group_count: usize) -> String {
    format!("{}groups", group_count)
}

pub fn peptide_file(bucket_dir: &Path) -> PathBuf {
    bucket_dir.join("peptides_forgibbs.txt")
}
