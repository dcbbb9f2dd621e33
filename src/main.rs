use std::{path::PathBuf, time::Duration, time::Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mhcflow::{
    combined::{combined_analysis, Sample},
    config::ExternalContext,
    peptides::{load_peptide_file, Delimiter},
    pool::CancellationToken,
    structures::{MhcClass, PredictorVersion},
};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Predict binders, cluster motifs and order them across samples
    Run {
        /// Peptide files, one per sample
        #[clap(short, long, required = true, multiple_values = true)]
        files: Vec<PathBuf>,
        /// Sample names, in the same order as the files (defaults to file stems)
        #[clap(short, long, multiple_values = true)]
        names: Vec<String>,
        /// Alleles shared by every sample, space or comma separated
        #[clap(short, long, required = true, multiple_values = true)]
        alleles: Vec<String>,
        /// MHC class, I or II (overrides the config file)
        #[clap(short = 'c', long)]
        class: Option<MhcClass>,
        /// Predictor release whose output layout to expect, 4.0 or 4.1
        #[clap(short = 'v', long)]
        predictor_version: Option<PredictorVersion>,
        /// Scratch directory for chunk files and tool output
        #[clap(long)]
        tmp_dir: PathBuf,
        /// Output path of the JSON results
        #[clap(short, long)]
        output: PathBuf,
        /// JSON file with tool paths and run parameters
        #[clap(long)]
        config: Option<PathBuf>,
        /// Maximum number of concurrent tool processes; defaults to number of logical cores
        #[clap(long)]
        threads: Option<usize>,
        #[clap(long)]
        min_length: Option<usize>,
        #[clap(long)]
        max_length: Option<usize>,
        /// Delimiter of tabular peptide files: comma or tab
        #[clap(long, requires = "column_header")]
        delimiter: Option<Delimiter>,
        /// Header of the peptide column in tabular files
        #[clap(long, requires = "delimiter")]
        column_header: Option<String>,
        /// Cancel the whole run after this many seconds
        #[clap(long)]
        timeout_secs: Option<u64>,
        /// Log job progress every few seconds
        #[clap(long)]
        show_progress: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let now = Instant::now();
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    match args.cmd {
        SubCommand::Run {
            files,
            names,
            alleles,
            class,
            predictor_version,
            tmp_dir,
            output,
            config,
            threads,
            min_length,
            max_length,
            delimiter,
            column_header,
            timeout_secs,
            show_progress,
        } => {
            let mut ctxt = match config {
                Some(p) => ExternalContext::from_path(&p)?,
                None => ExternalContext::default(),
            };
            if let Some(c) = class {
                ctxt.mhc_class = c;
                if c == MhcClass::II && min_length.is_none() && ctxt.min_length < 9 {
                    ctxt.min_length = 9;
                }
            }
            if let Some(v) = predictor_version {
                ctxt.set_predictor_version(v);
            }
            if let Some(t) = threads {
                ctxt.max_threads = t;
            }
            if let Some(l) = min_length {
                ctxt.min_length = l;
            }
            if let Some(l) = max_length {
                ctxt.max_length = l;
            }
            ctxt.show_progress |= show_progress;
            ctxt.validate()?;

            if !names.is_empty() && names.len() != files.len() {
                bail!("got {} sample names for {} files", names.len(), files.len());
            }
            let alleles = alleles
                .iter()
                .flat_map(|a| a.split(','))
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect::<Vec<_>>();
            let column = delimiter.zip(column_header.as_deref());
            let mut samples = vec![];
            for (i, f) in files.iter().enumerate() {
                let name = match names.get(i) {
                    Some(n) => n.clone(),
                    None => f
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .with_context(|| format!("cannot name a sample after {}", f.display()))?,
                };
                let peptides = load_peptide_file(f, column)?;
                info!(sample = %name, peptides = peptides.len(), "loaded peptides");
                samples.push(Sample::new(name, peptides, alleles.clone()));
            }

            let cancel = CancellationToken::new();
            if let Some(t) = timeout_secs {
                cancel.cancel_after(Duration::from_secs(t));
            }
            let results = combined_analysis(samples, &ctxt, &tmp_dir, &cancel)?;
            info!(
                "{} buckets without enough peptides to cluster",
                results.not_enough_peptides.len()
            );
            results.write_json(&output)?;
        }
    }
    info!("total elapsed time: {:?}", now.elapsed());
    Ok(())
}
