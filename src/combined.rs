use std::{
    collections::BTreeMap,
    fs::{create_dir_all, File},
    io::BufWriter,
    path::{Path, PathBuf},
    time::Instant,
};

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    balancer::{partition, write_chunks},
    clustering::{sample_buckets, BucketRun, BucketState, ClusteringJobBuilder, RejectReason},
    config::ExternalContext,
    errors::{PipelineError, Result},
    external::predictor_command,
    job::Job,
    matching::{align_samples, MotifMatrix, MotifOrdering},
    peptides::{clean_peptides, sanitize_sample_name},
    pool::{CancellationToken, WorkerPool},
    predictions::{PredictionParser, PredictionTable},
    selector::{group_index, resolve_bucket},
    structures::{Bucket, BucketKind, ClusteringSelection, MhcClass},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub peptides: Vec<String>,
    pub alleles: Vec<String>,
}

impl Sample {
    pub fn new(name: impl Into<String>, peptides: Vec<String>, alleles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            peptides,
            alleles,
        }
    }
}

/// Everything the reporting layer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub mhc_class: MhcClass,
    pub samples: Vec<Sample>,
    pub predictions: PredictionTable,
    pub buckets: Vec<BucketRun>,
    pub not_enough_peptides: Vec<Bucket>,
    pub motif_ordering: MotifOrdering,
}

impl AnalysisResults {
    pub fn selection(&self, bucket: &Bucket) -> Option<&ClusteringSelection> {
        self.buckets
            .iter()
            .find(|r| &r.bucket == bucket)
            .and_then(|r| r.state.selection())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path).map_err(|e| PipelineError::io(path, e))?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| PipelineError::Config(format!("cannot serialize results: {}", e)))
    }
}

/// Fails when two names would share a working directory once sanitized.
fn ensure_distinct_dirs<'a, I>(names: I, what: &str) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: AHashMap<String, &str> = AHashMap::new();
    for name in names {
        if let Some(prev) = seen.insert(sanitize_sample_name(name), name) {
            return Err(PipelineError::Config(format!(
                "{} names `{}` and `{}` map to the same directory",
                what, prev, name
            )));
        }
    }
    Ok(())
}

/// Cleans peptides, keeps the configured lengths, drops duplicates and
/// normalizes allele names the way the predictor prints them. Sample and
/// allele names must stay distinct after sanitizing, since they name the
/// directories the tools write into.
pub fn prepare_samples(samples: Vec<Sample>, ctxt: &ExternalContext) -> Result<Vec<Sample>> {
    ensure_distinct_dirs(samples.iter().map(|s| s.name.as_str()), "sample")?;
    let prepared = samples
        .into_iter()
        .map(|s| {
            let before = s.peptides.len();
            let peptides = clean_peptides(&s.peptides)
                .into_iter()
                .filter(|p| ctxt.accepts_length(p))
                .unique()
                .collect_vec();
            debug!(sample = %s.name, before, after = peptides.len(), "cleaned peptides");
            Sample {
                peptides,
                alleles: s.alleles.iter().map(|a| a.replace('*', "")).unique().collect(),
                name: s.name,
            }
        })
        .collect_vec();
    ensure_distinct_dirs(
        prepared
            .iter()
            .flat_map(|s| s.alleles.iter().map(|a| a.as_str()))
            .unique(),
        "allele",
    )?;
    Ok(prepared)
}

/// `<sample>_netMHCpan_predictions.tsv`, or `netMHCIIpan` for class II.
pub fn predictions_tsv_name(class: MhcClass, sample: &str) -> String {
    let tool = match class {
        MhcClass::I => "netMHCpan",
        MhcClass::II => "netMHCIIpan",
    };
    format!("{}_{}_predictions.tsv", sanitize_sample_name(sample), tool)
}

/// Predicts every allele once over the union of the peptides of the samples
/// carrying it, then attributes the rows back to samples. Any failed job or
/// unparsable output aborts the run.
pub fn predict(
    samples: &[Sample],
    ctxt: &ExternalContext,
    pool: &WorkerPool,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PredictionTable> {
    let parser = PredictionParser::new(ctxt.mhc_class, ctxt.predictor_version())?;
    let mut per_allele: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for s in samples {
        for a in &s.alleles {
            per_allele
                .entry(a.as_str())
                .or_default()
                .extend(s.peptides.iter().map(|p| p.as_str()));
        }
    }
    let root = tmp_dir.join("predictions");
    let mut jobs = vec![];
    for (allele, peptides) in &per_allele {
        let chunks = partition(peptides, pool.max_concurrency());
        let dir = root.join(sanitize_sample_name(allele));
        for (i, chunk_file) in write_chunks(&chunks, &dir)?.into_iter().enumerate() {
            let command = predictor_command(ctxt.predictor_path(), ctxt.mhc_class, &chunk_file, &[allele]);
            jobs.push(Job::new(format!("predict_{}_{}", allele, i + 1), command, dir.clone()).with_allele(*allele));
        }
    }
    let jobs = pool.run_all(jobs, "binding prediction", cancel)?;
    let mut rows = vec![];
    for job in &jobs {
        job.ensure_success(&ctxt.error_marker)?;
        rows.extend(parser.parse_rows(job.stdout())?);
    }
    let table = PredictionTable::from_rows(
        &rows,
        samples
            .iter()
            .map(|s| (s.name.as_str(), s.alleles.as_slice(), s.peptides.as_slice())),
    )?;
    for s in samples.iter().filter(|s| !s.alleles.is_empty()) {
        let path = root.join(predictions_tsv_name(ctxt.mhc_class, &s.name));
        table.write_tsv(&s.name, &path)?;
    }
    info!("{} predictions for {} alleles", table.len(), per_allele.len());
    Ok(table)
}

/// Builds every bucket's clustering jobs, runs them as one batch and selects
/// a result per bucket. Failed runs only affect their own bucket.
pub fn cluster(
    samples: &[Sample],
    table: &PredictionTable,
    ctxt: &ExternalContext,
    pool: &WorkerPool,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<BucketRun>> {
    let builder = ClusteringJobBuilder::new(tmp_dir.join("gibbs"), ctxt);
    let mut runs = vec![];
    let mut jobs = vec![];
    for s in samples {
        for (bucket, peptides) in sample_buckets(table, &s.name, &s.alleles, &s.peptides) {
            let mut run = BucketRun::new(bucket);
            jobs.extend(builder.plan(&mut run, &peptides)?);
            runs.push(run);
        }
    }
    let jobs = pool.run_all(jobs, "motif clustering", cancel)?;
    let failed: AHashSet<PathBuf> = jobs
        .iter()
        .filter_map(|j| match j.ensure_success(&ctxt.error_marker) {
            Ok(()) => None,
            Err(e) => {
                warn!(job = %j.id, "{}", e);
                Some(j.working_directory.clone())
            }
        })
        .collect();
    for run in &mut runs {
        resolve_bucket(run, &failed)?;
    }
    Ok(runs)
}

/// Matrices of the motifs that survived in a selection, in group order. A
/// matrix is paired with its divergence through the group tag in its file
/// name, so a group the tool wrote no matrix for shifts nothing.
fn selected_matrices(selection: &ClusteringSelection) -> Result<Vec<MotifMatrix>> {
    let kld = &selection.candidate.kl_divergence;
    selection
        .matrices
        .iter()
        .filter(|p| {
            group_index(p)
                .and_then(|i| kld.get(i))
                .map_or(false, |d| *d != 0.0)
        })
        .map(MotifMatrix::from_path)
        .collect()
}

/// Aligns the unsupervised motifs of every sample against the sample with
/// the most motifs.
pub fn order_motifs(samples: &[Sample], runs: &[BucketRun]) -> MotifOrdering {
    let per_sample = samples
        .iter()
        .map(|s| {
            let bucket = Bucket::new(s.name.as_str(), BucketKind::Unsupervised);
            let matrices = runs
                .iter()
                .find(|r| r.bucket == bucket)
                .and_then(|r| r.state.selection())
                .map_or(Ok(vec![]), selected_matrices)
                .unwrap_or_else(|e| {
                    warn!(sample = %s.name, "cannot read motif matrices: {}", e);
                    vec![]
                });
            (s.name.clone(), matrices)
        })
        .collect_vec();
    align_samples(&per_sample)
}

/// Runs every stage in order; each stage starts only once the previous one
/// has fully finished.
pub fn combined_analysis(
    samples: Vec<Sample>,
    ctxt: &ExternalContext,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<AnalysisResults> {
    ctxt.validate()?;
    create_dir_all(tmp_dir).map_err(|e| PipelineError::io(tmp_dir, e))?;
    let pool = WorkerPool::from_ctxt(ctxt);
    let samples = prepare_samples(samples, ctxt)?;

    let t = Instant::now();
    let predictions = predict(&samples, ctxt, &pool, tmp_dir, cancel)?;
    info!("binding prediction took {:?}", t.elapsed());

    let t = Instant::now();
    let buckets = cluster(&samples, &predictions, ctxt, &pool, tmp_dir, cancel)?;
    info!("clustering and selection took {:?}", t.elapsed());

    let not_enough_peptides = buckets
        .iter()
        .filter(|r| matches!(r.state, BucketState::Rejected(RejectReason::InsufficientPeptides { .. })))
        .map(|r| r.bucket.clone())
        .collect_vec();
    let motif_ordering = order_motifs(&samples, &buckets);
    Ok(AnalysisResults {
        mhc_class: ctxt.mhc_class,
        samples,
        predictions,
        buckets,
        not_enough_peptides,
        motif_ordering,
    })
}
