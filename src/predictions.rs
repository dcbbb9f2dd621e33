use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    errors::{PipelineError, Result},
    structures::{BinderClass, MhcClass, PredictionRecord, PredictorVersion},
};

/// Where the interesting fields sit in a whitespace-split predictor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub allele: usize,
    pub peptide: usize,
    pub score: usize,
    pub rank: usize,
    pub affinity_score: Option<usize>,
    pub affinity_rank: Option<usize>,
    pub affinity_nm: Option<usize>,
}

impl ColumnLayout {
    fn min_columns(&self) -> usize {
        [
            Some(self.allele),
            Some(self.peptide),
            Some(self.score),
            Some(self.rank),
            self.affinity_score,
            self.affinity_rank,
            self.affinity_nm,
        ]
        .iter()
        .flatten()
        .max()
        .map_or(0, |m| m + 1)
    }
}

lazy_static! {
    static ref LAYOUTS: AHashMap<(MhcClass, PredictorVersion), ColumnLayout> = {
        let mut m = AHashMap::new();
        // Pos MHC Peptide Core Of Gp Gl Ip Il Icore Identity Score Aff(nM) %Rank BindLevel
        m.insert(
            (MhcClass::I, PredictorVersion::V4_0),
            ColumnLayout {
                allele: 1,
                peptide: 2,
                score: 11,
                rank: 13,
                affinity_score: None,
                affinity_rank: None,
                affinity_nm: Some(12),
            },
        );
        // ... Identity Score_EL %Rank_EL Score_BA %Rank_BA Aff(nM) BindLevel
        m.insert(
            (MhcClass::I, PredictorVersion::V4_1),
            ColumnLayout {
                allele: 1,
                peptide: 2,
                score: 11,
                rank: 12,
                affinity_score: Some(13),
                affinity_rank: Some(14),
                affinity_nm: Some(15),
            },
        );
        // Pos MHC Peptide Of Core Core_Rel Identity Score_EL %Rank_EL Exp_Bind Score_BA Affinity(nM) %Rank_BA
        m.insert(
            (MhcClass::II, PredictorVersion::V4_0),
            ColumnLayout {
                allele: 1,
                peptide: 2,
                score: 7,
                rank: 8,
                affinity_score: Some(10),
                affinity_rank: Some(12),
                affinity_nm: Some(11),
            },
        );
        m
    };
}

pub fn column_layout(class: MhcClass, version: PredictorVersion) -> Result<ColumnLayout> {
    LAYOUTS
        .get(&(class, version))
        .copied()
        .ok_or(PipelineError::UnsupportedLayout { class, version })
}

/// One parsed predictor row, before it is attributed to a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub allele: String,
    pub peptide: String,
    pub rank: f64,
    pub score: f64,
    pub affinity_score: Option<f64>,
    pub affinity_rank: Option<f64>,
    pub affinity_nm: Option<f64>,
    pub binder: BinderClass,
}

impl PredictionRow {
    pub fn into_record(self, sample: &str) -> PredictionRecord {
        PredictionRecord {
            sample: sample.to_string(),
            peptide: self.peptide,
            allele: self.allele,
            rank: self.rank,
            score: self.score,
            affinity_score: self.affinity_score,
            affinity_rank: self.affinity_rank,
            affinity_nm: self.affinity_nm,
            binder: self.binder,
        }
    }
}

fn is_row_marker(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

pub struct PredictionParser {
    class: MhcClass,
    layout: ColumnLayout,
}

impl PredictionParser {
    pub fn new(class: MhcClass, version: PredictorVersion) -> Result<Self> {
        Ok(Self {
            class,
            layout: column_layout(class, version)?,
        })
    }

    fn field<'a>(&self, fields: &[&'a str], idx: usize, line: &str) -> Result<&'a str> {
        fields.get(idx).copied().ok_or_else(|| {
            PipelineError::parse_format(
                "predictor output",
                format!(
                    "expected at least {} columns, got {}: {}",
                    self.layout.min_columns(),
                    fields.len(),
                    line
                ),
            )
        })
    }

    fn number(&self, fields: &[&str], idx: usize, line: &str) -> Result<f64> {
        let raw = self.field(fields, idx, line)?;
        raw.parse::<f64>().map_err(|_| {
            PipelineError::parse_format(
                "predictor output",
                format!("column {} is not numeric (`{}`): {}", idx, raw, line),
            )
        })
    }

    fn optional(&self, fields: &[&str], idx: Option<usize>, line: &str) -> Result<Option<f64>> {
        idx.map(|i| self.number(fields, i, line)).transpose()
    }

    /// Parses every data row of the predictor's stdout. Rows are the lines
    /// whose first token is all digits. Non-empty output without a single
    /// such row means the layout does not match the tool.
    pub fn parse_rows(&self, stdout: &str) -> Result<Vec<PredictionRow>> {
        let mut rows = vec![];
        for line in stdout.lines() {
            let fields = line.split_whitespace().collect_vec();
            if !fields.first().map_or(false, |t| is_row_marker(t)) {
                continue;
            }
            let l = &self.layout;
            let rank = self.number(&fields, l.rank, line)?;
            rows.push(PredictionRow {
                allele: self.field(&fields, l.allele, line)?.replace('*', ""),
                peptide: self.field(&fields, l.peptide, line)?.to_string(),
                rank,
                score: self.number(&fields, l.score, line)?,
                affinity_score: self.optional(&fields, l.affinity_score, line)?,
                affinity_rank: self.optional(&fields, l.affinity_rank, line)?,
                affinity_nm: self.optional(&fields, l.affinity_nm, line)?,
                binder: self.class.classify(rank),
            });
        }
        if rows.is_empty() && !stdout.trim().is_empty() {
            return Err(PipelineError::parse_format(
                "predictor output",
                format!(
                    "no prediction rows found in {} lines of output (class {} layout)",
                    stdout.lines().count(),
                    self.class
                ),
            ));
        }
        debug!("parsed {} prediction rows", rows.len());
        Ok(rows)
    }

    pub fn parse(&self, stdout: &str, sample: &str) -> Result<Vec<PredictionRecord>> {
        Ok(self
            .parse_rows(stdout)?
            .into_iter()
            .map(|r| r.into_record(sample))
            .collect())
    }
}

/// Every prediction of a run, immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionTable {
    records: Vec<PredictionRecord>,
}

impl PredictionTable {
    pub fn new(records: Vec<PredictionRecord>) -> Self {
        Self { records }
    }

    /// Attributes allele-level rows to samples. `samples` lists each sample's
    /// alleles and peptides; every (allele, peptide) pair a sample needs must
    /// be present in `rows`.
    pub fn from_rows<'a, I>(rows: &[PredictionRow], samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a [String], &'a [String])>,
    {
        let index: AHashMap<(&str, &str), &PredictionRow> = rows
            .iter()
            .map(|r| ((r.allele.as_str(), r.peptide.as_str()), r))
            .collect();
        let mut records = vec![];
        for (sample, alleles, peptides) in samples {
            for allele in alleles {
                let allele_key = allele.replace('*', "");
                for peptide in peptides {
                    let row = index
                        .get(&(allele_key.as_str(), peptide.as_str()))
                        .ok_or_else(|| {
                            PipelineError::parse_format(
                                "predictor output",
                                format!(
                                    "no prediction for peptide {} and allele {} (sample {})",
                                    peptide, allele, sample
                                ),
                            )
                        })?;
                    records.push((*row).clone().into_record(sample));
                }
            }
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn query<'a>(
        &'a self,
        sample: Option<&'a str>,
        allele: Option<&'a str>,
        binder: Option<BinderClass>,
    ) -> impl Iterator<Item = &'a PredictionRecord> + 'a {
        self.records.iter().filter(move |r| {
            sample.map_or(true, |s| r.sample == s)
                && allele.map_or(true, |a| r.allele == a)
                && binder.map_or(true, |b| r.binder == b)
        })
    }

    /// Distinct peptides called strong or weak for `allele` in `sample`.
    pub fn binders<'a>(&'a self, sample: &'a str, allele: &'a str) -> AHashSet<&'a str> {
        self.query(Some(sample), Some(allele), None)
            .filter(|r| r.binder.is_binder())
            .map(|r| r.peptide.as_str())
            .collect()
    }

    pub fn sample_peptides<'a>(&'a self, sample: &'a str) -> AHashSet<&'a str> {
        self.query(Some(sample), None, None)
            .map(|r| r.peptide.as_str())
            .collect()
    }

    pub fn write_tsv(&self, sample: &str, path: &Path) -> Result<()> {
        let io_err = |e| PipelineError::io(path, e);
        let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
        writeln!(
            w,
            "Allele\tPeptide\tEL_score\tEL_Rank\tAff_Score\tAff_Rank\tAff_nM\tBinder"
        )
        .map_err(io_err)?;
        let fmt = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), |x| x.to_string());
        for r in self.query(Some(sample), None, None) {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.allele,
                r.peptide,
                r.score,
                r.rank,
                fmt(r.affinity_score),
                fmt(r.affinity_rank),
                fmt(r.affinity_nm),
                r.binder
            )
            .map_err(io_err)?;
        }
        w.flush().map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS_I_41: &str = "\
# NetMHCpan version 4.1
HLA-A02:01 : Distance to training data  0.000 (using nearest neighbor HLA-A02:01)
---------------------------------------------------------------------------------------------------------------------------
 Pos         MHC        Peptide      Core Of Gp Gl Ip Il        Icore        Identity  Score_EL %Rank_EL Score_BA %Rank_BA  Aff(nM) BindLevel
---------------------------------------------------------------------------------------------------------------------------
   1 HLA-A*02:01      GILGFVFTL GILGFVFTL  0  0  0  0  0    GILGFVFTL         PEPLIST 0.9164490    0.030 0.849710    0.026     4.75 <= SB
   1 HLA-A*02:01      SIINFEKLA SIINFEKLA  0  0  0  0  0    SIINFEKLA         PEPLIST 0.1000000    1.200 0.300000    2.400  1500.00 <= WB
   1 HLA-A*02:01      KKKKKKKKK KKKKKKKKK  0  0  0  0  0    KKKKKKKKK         PEPLIST 0.0001000   80.000 0.010000   90.000 45000.00
---------------------------------------------------------------------------------------------------------------------------
";

    #[test]
    fn class_one_rank_boundaries() {
        let c = MhcClass::I;
        assert_eq!(c.classify(0.5), BinderClass::Strong);
        assert_eq!(c.classify(0.51), BinderClass::Weak);
        assert_eq!(c.classify(2.0), BinderClass::Weak);
        assert_eq!(c.classify(2.01), BinderClass::NonBinder);
    }

    #[test]
    fn class_two_rank_boundaries() {
        let c = MhcClass::II;
        assert_eq!(c.classify(2.0), BinderClass::Strong);
        assert_eq!(c.classify(2.01), BinderClass::Weak);
        assert_eq!(c.classify(10.0), BinderClass::Weak);
        assert_eq!(c.classify(10.01), BinderClass::NonBinder);
    }

    #[test]
    fn parses_class_one_table() {
        let parser = PredictionParser::new(MhcClass::I, PredictorVersion::V4_1).unwrap();
        let recs = parser.parse(CLASS_I_41, "s1").unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].allele, "HLA-A02:01");
        assert_eq!(recs[0].peptide, "GILGFVFTL");
        assert_eq!(recs[0].rank, 0.030);
        assert_eq!(recs[0].affinity_nm, Some(4.75));
        assert_eq!(recs[0].binder, BinderClass::Strong);
        assert_eq!(recs[1].binder, BinderClass::Weak);
        assert_eq!(recs[2].binder, BinderClass::NonBinder);
        assert!(recs.iter().all(|r| r.sample == "s1"));
    }

    #[test]
    fn parses_class_two_table() {
        let out = "\
# NetMHCIIpan version 4.0
 Pos           MHC              Peptide   Of        Core  Core_Rel Identity  Score_EL %Rank_EL Exp_Bind  Score_BA  Affinity(nM) %Rank_BA  BindLevel
   1     DRB1_0101      PKYVKQNTLKLAT    2   YVKQNTLKL     0.767  Sequence  0.957000     1.50       NA  0.794000         11.03     1.12 <=SB
   1     DRB1_0101      AAAAAAAAAAAAA    2   AAAAAAAAA     0.100  Sequence  0.010000    50.00       NA  0.100000       9000.00    60.00
";
        let parser = PredictionParser::new(MhcClass::II, PredictorVersion::V4_0).unwrap();
        let rows = parser.parse_rows(out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rank, 1.5);
        assert_eq!(rows[0].affinity_nm, Some(11.03));
        assert_eq!(rows[0].affinity_rank, Some(1.12));
        assert_eq!(rows[0].binder, BinderClass::Strong);
        assert_eq!(rows[1].binder, BinderClass::NonBinder);
    }

    #[test]
    fn layout_mismatch_is_an_error_not_an_empty_table() {
        let parser = PredictionParser::new(MhcClass::I, PredictorVersion::V4_1).unwrap();
        let garbage = "# header\nsomething went sideways\n";
        assert!(matches!(
            parser.parse_rows(garbage),
            Err(PipelineError::ParseFormat { .. })
        ));
        assert!(parser.parse_rows("").unwrap().is_empty());
        // a row marker with too few columns
        assert!(parser.parse_rows("1 HLA-A*02:01 PEPTIDE 0.1\n").is_err());
    }

    #[test]
    fn unknown_layout_is_reported() {
        assert!(matches!(
            PredictionParser::new(MhcClass::II, PredictorVersion::V4_1),
            Err(PipelineError::UnsupportedLayout { .. })
        ));
    }

    #[test]
    fn table_fans_rows_out_to_samples() {
        let parser = PredictionParser::new(MhcClass::I, PredictorVersion::V4_1).unwrap();
        let rows = parser.parse_rows(CLASS_I_41).unwrap();
        let alleles = vec!["HLA-A02:01".to_string()];
        let s1 = vec!["GILGFVFTL".to_string(), "SIINFEKLA".to_string()];
        let s2 = vec!["KKKKKKKKK".to_string()];
        let table = PredictionTable::from_rows(
            &rows,
            vec![
                ("s1", alleles.as_slice(), s1.as_slice()),
                ("s2", alleles.as_slice(), s2.as_slice()),
            ],
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        let b = table.binders("s1", "HLA-A02:01");
        assert_eq!(b.len(), 2);
        assert!(table.binders("s2", "HLA-A02:01").is_empty());
        assert_eq!(
            table
                .query(None, None, Some(BinderClass::Strong))
                .count(),
            1
        );

        let missing = vec!["NOTPRESENT".to_string()];
        assert!(PredictionTable::from_rows(&rows, vec![("s3", alleles.as_slice(), missing.as_slice())]).is_err());

        let dir = tempfile::tempdir().unwrap();
        let tsv = dir.path().join("s1.tsv");
        table.write_tsv("s1", &tsv).unwrap();
        let text = std::fs::read_to_string(&tsv).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("GILGFVFTL"));
    }
}
