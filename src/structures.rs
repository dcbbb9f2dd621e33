use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MhcClass {
    #[serde(rename = "I")]
    I,
    #[serde(rename = "II")]
    II,
}

/// Rank cut-offs (inclusive) separating strong, weak and non-binders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinderThresholds {
    pub strong: f64,
    pub weak: f64,
}

impl MhcClass {
    pub fn thresholds(self) -> BinderThresholds {
        match self {
            MhcClass::I => BinderThresholds {
                strong: 0.5,
                weak: 2.0,
            },
            MhcClass::II => BinderThresholds {
                strong: 2.0,
                weak: 10.0,
            },
        }
    }

    /// Shortest peptide the predictor for this class accepts.
    pub fn min_supported_length(self) -> usize {
        match self {
            MhcClass::I => 8,
            MhcClass::II => 9,
        }
    }

    pub fn classify(self, rank: f64) -> BinderClass {
        let t = self.thresholds();
        if rank <= t.strong {
            BinderClass::Strong
        } else if rank <= t.weak {
            BinderClass::Weak
        } else {
            BinderClass::NonBinder
        }
    }
}

impl fmt::Display for MhcClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MhcClass::I => write!(f, "I"),
            MhcClass::II => write!(f, "II"),
        }
    }
}

impl FromStr for MhcClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "I" | "1" => Ok(MhcClass::I),
            "II" | "2" => Ok(MhcClass::II),
            other => Err(format!("unknown MHC class `{}` (expected I or II)", other)),
        }
    }
}

/// Release of the binding predictor; selects the stdout column layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictorVersion {
    #[serde(rename = "4.0")]
    V4_0,
    #[serde(rename = "4.1")]
    V4_1,
}

impl fmt::Display for PredictorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictorVersion::V4_0 => write!(f, "4.0"),
            PredictorVersion::V4_1 => write!(f, "4.1"),
        }
    }
}

impl FromStr for PredictorVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "4.0" => Ok(PredictorVersion::V4_0),
            "4.1" => Ok(PredictorVersion::V4_1),
            other => Err(format!("unsupported predictor version `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinderClass {
    Strong,
    Weak,
    #[serde(rename = "Non-binder")]
    NonBinder,
}

impl BinderClass {
    pub fn is_binder(self) -> bool {
        matches!(self, BinderClass::Strong | BinderClass::Weak)
    }
}

impl fmt::Display for BinderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinderClass::Strong => write!(f, "Strong"),
            BinderClass::Weak => write!(f, "Weak"),
            BinderClass::NonBinder => write!(f, "Non-binder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub sample: String,
    pub peptide: String,
    pub allele: String,
    /// eluted-ligand percentile rank, the value binder classes are derived from
    pub rank: f64,
    pub score: f64,
    pub affinity_score: Option<f64>,
    pub affinity_rank: Option<f64>,
    pub affinity_nm: Option<f64>,
    pub binder: BinderClass,
}

/// What a clustering bucket groups peptides by, inside one sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BucketKind {
    Unsupervised,
    Unannotated,
    Allele(String),
}

impl BucketKind {
    /// Directory component used under `<root>/<sample>/`.
    pub fn dir_name(&self) -> String {
        match self {
            BucketKind::Unsupervised => "unsupervised".to_string(),
            BucketKind::Unannotated => "unannotated".to_string(),
            BucketKind::Allele(a) => crate::peptides::sanitize_sample_name(a),
        }
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKind::Unsupervised => write!(f, "unsupervised"),
            BucketKind::Unannotated => write!(f, "unannotated"),
            BucketKind::Allele(a) => write!(f, "{}", a),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bucket {
    pub sample: String,
    pub kind: BucketKind,
}

impl Bucket {
    pub fn new(sample: impl Into<String>, kind: BucketKind) -> Self {
        Self {
            sample: sample.into(),
            kind,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.sample)
    }
}

/// One finished clustering run (one group count) for a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringCandidate {
    pub bucket: Bucket,
    pub group_count: usize,
    pub output_directory: PathBuf,
    /// one value per group, zero when the group collapsed
    pub kl_divergence: Vec<f64>,
    pub outlier_count: usize,
}

impl ClusteringCandidate {
    pub fn score(&self) -> f64 {
        self.kl_divergence.iter().sum()
    }

    pub fn motif_count(&self) -> usize {
        self.kl_divergence.iter().filter(|&&d| d != 0.0).count()
    }
}

/// The winning candidate of a bucket plus the files the report needs from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringSelection {
    pub candidate: ClusteringCandidate,
    pub motif_count: usize,
    pub cores: Vec<PathBuf>,
    pub matrices: Vec<PathBuf>,
    pub peptide_groups_file: PathBuf,
}

impl ClusteringSelection {
    pub fn group_count(&self) -> usize {
        self.candidate.group_count
    }

    pub fn output_directory(&self) -> &PathBuf {
        &self.candidate.output_directory
    }

    pub fn outlier_count(&self) -> usize {
        self.candidate.outlier_count
    }
}

/// Mapping from each reference slot to a group index of the target sample,
/// `None` where the slot stays blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    pub sample: String,
    pub slots: Vec<Option<usize>>,
}

impl Alignment {
    pub fn identity(sample: impl Into<String>, n: usize) -> Self {
        Self {
            sample: sample.into(),
            slots: (0..n).map(Some).collect(),
        }
    }

    pub fn matched(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
