//! # mhcflow
//!
//! `mhcflow` drives the external MHC binding predictors and the motif
//! clustering tool over a set of immunopeptidomics samples: it balances
//! peptides over parallel predictor runs, classifies binders, clusters every
//! sample/allele bucket over a range of group counts, picks the best
//! clustering per bucket and orders the resulting motifs consistently across
//! samples.
pub mod balancer;
pub mod clustering;
pub mod combined;
pub mod config;
pub mod errors;
pub mod external;
pub mod job;
pub mod matching;
pub mod peptides;
pub mod pool;
pub mod predictions;
pub mod progress_reporter;
pub mod selector;
pub mod structures;
