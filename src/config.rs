use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{PipelineError, Result},
    structures::{MhcClass, PredictorVersion},
};

/// Hard cap on the unsupervised group-count search; the motif aligner's
/// permutation search is only affordable up to this many groups.
pub const MAX_GROUPS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub netmhcpan: PathBuf,
    pub netmhciipan: PathBuf,
    pub gibbscluster: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            netmhcpan: PathBuf::from("netMHCpan"),
            netmhciipan: PathBuf::from("netMHCIIpan"),
            gibbscluster: PathBuf::from("gibbscluster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
/// For the lack of a better name, everything the engine needs to know about
/// the external tools and how hard to drive them
pub struct ExternalContext {
    pub tools: ToolPaths,
    pub mhc_class: MhcClass,
    pub min_length: usize,
    pub max_length: usize,
    /// 0 means "all logical cores"
    pub max_threads: usize,
    pub max_groups: usize,
    pub netmhcpan_version: PredictorVersion,
    pub netmhciipan_version: PredictorVersion,
    /// time between SIGTERM and SIGKILL when cancelling in-flight jobs
    pub kill_grace_ms: u64,
    pub show_progress: bool,
    /// case-insensitive marker the tools print on failure
    pub error_marker: String,
}

impl Default for ExternalContext {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            mhc_class: MhcClass::I,
            min_length: 8,
            max_length: 12,
            max_threads: 0,
            max_groups: MAX_GROUPS,
            netmhcpan_version: PredictorVersion::V4_1,
            netmhciipan_version: PredictorVersion::V4_0,
            kill_grace_ms: 2000,
            show_progress: false,
            error_marker: "error".to_string(),
        }
    }
}

impl ExternalContext {
    pub fn from_path<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).map_err(|e| PipelineError::io(path, e))?);
        let ctxt: ExternalContext = serde_json::from_reader(reader)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(ctxt)
    }

    pub fn validate(&self) -> Result<()> {
        let floor = self.mhc_class.min_supported_length();
        if self.min_length < floor {
            return Err(PipelineError::Config(format!(
                "class {} peptides must be at least {}-mers, got min_length {}",
                self.mhc_class, floor, self.min_length
            )));
        }
        if self.min_length > self.max_length {
            return Err(PipelineError::Config(format!(
                "min_length {} exceeds max_length {}",
                self.min_length, self.max_length
            )));
        }
        if self.max_groups == 0 || self.max_groups > MAX_GROUPS {
            return Err(PipelineError::Config(format!(
                "max_groups must be within 1..={}, got {}",
                MAX_GROUPS, self.max_groups
            )));
        }
        Ok(())
    }

    /// Number of processes allowed to run at once, clamped to `[1, cpus]`.
    pub fn effective_threads(&self) -> usize {
        clamp_concurrency(self.max_threads)
    }

    pub fn predictor_path(&self) -> &Path {
        match self.mhc_class {
            MhcClass::I => &self.tools.netmhcpan,
            MhcClass::II => &self.tools.netmhciipan,
        }
    }

    pub fn predictor_version(&self) -> PredictorVersion {
        match self.mhc_class {
            MhcClass::I => self.netmhcpan_version,
            MhcClass::II => self.netmhciipan_version,
        }
    }

    /// Overrides the version of whichever predictor the current class uses.
    pub fn set_predictor_version(&mut self, version: PredictorVersion) {
        match self.mhc_class {
            MhcClass::I => self.netmhcpan_version = version,
            MhcClass::II => self.netmhciipan_version = version,
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn accepts_length(&self, peptide: &str) -> bool {
        (self.min_length..=self.max_length).contains(&peptide.len())
    }
}

pub fn clamp_concurrency(requested: usize) -> usize {
    let cpus = num_cpus::get().max(1);
    if requested == 0 {
        cpus
    } else {
        requested.clamp(1, cpus)
    }
}
