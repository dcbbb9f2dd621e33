use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::{PipelineError, Result};

pub const COMMON_AMINO_ACIDS: &str = "ARNDCQEGHILKMFPSTWYV";

lazy_static! {
    static ref LETTERS: Regex = Regex::new("[a-zA-Z]+").unwrap();
}

/// Drops flanking residues written as `K.PEPTIDE.R`.
fn strip_flanks(peptide: &str) -> &str {
    let mut p = peptide;
    if p.len() > 2 && p.as_bytes()[1] == b'.' {
        p = &p[2..];
    }
    if p.len() > 2 && p.as_bytes()[p.len() - 2] == b'.' {
        p = &p[..p.len() - 2];
    }
    p
}

/// Normalizes one peptide to a plain upper-case sequence of the 20 common
/// amino acids; `None` if anything else remains after stripping.
pub fn clean_peptide(peptide: &str) -> Option<String> {
    let stripped = strip_flanks(peptide.trim());
    let seq: String = LETTERS
        .find_iter(stripped)
        .map(|m| m.as_str())
        .collect::<String>()
        .to_uppercase();
    if seq.is_empty() || !seq.chars().all(|c| COMMON_AMINO_ACIDS.contains(c)) {
        return None;
    }
    Some(seq)
}

pub fn clean_peptides<I, S>(peptides: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    peptides
        .into_iter()
        .filter_map(|p| clean_peptide(p.as_ref()))
        .collect()
}

pub fn sanitize_sample_name(name: &str) -> String {
    const BAD: &[char] = &[
        ' ', ':', ';', '/', '\\', '$', '@', '*', '!', '^', '(', ')', '{', '}', '[', ']',
    ];
    name.chars()
        .map(|c| if BAD.contains(&c) { '_' } else { c })
        .collect::<String>()
        .replace('&', "AND")
        .replace('%', "percent")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Tab,
}

impl Delimiter {
    fn as_char(self) -> char {
        match self {
            Delimiter::Comma => ',',
            Delimiter::Tab => '\t',
        }
    }
}

impl std::str::FromStr for Delimiter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "comma" => Ok(Delimiter::Comma),
            "tab" => Ok(Delimiter::Tab),
            other => Err(format!("unknown delimiter `{}` (expected comma or tab)", other)),
        }
    }
}

/// Reads raw peptides, one per line, or from the named column of a delimited
/// file with a header row.
pub fn load_peptide_file<P>(path: P, column: Option<(Delimiter, &str)>) -> Result<Vec<String>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path).map_err(|e| PipelineError::io(path, e))?);
    let mut lines = reader.lines();
    let mut peptides = vec![];
    match column {
        None => {
            for line in lines {
                let line = line.map_err(|e| PipelineError::io(path, e))?;
                let line = line.trim();
                if !line.is_empty() {
                    peptides.push(line.to_string());
                }
            }
        }
        Some((delimiter, header)) => {
            let sep = delimiter.as_char();
            let first = lines
                .next()
                .transpose()
                .map_err(|e| PipelineError::io(path, e))?
                .unwrap_or_default();
            let idx = first
                .trim_end()
                .split(sep)
                .position(|h| h.trim() == header)
                .ok_or_else(|| {
                    PipelineError::parse_format(
                        path.display().to_string(),
                        format!("no column named `{}` in header", header),
                    )
                })?;
            for line in lines {
                let line = line.map_err(|e| PipelineError::io(path, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match line.trim_end().split(sep).nth(idx) {
                    Some(p) => peptides.push(p.trim().to_string()),
                    None => {
                        return Err(PipelineError::parse_format(
                            path.display().to_string(),
                            format!("row has no column {}: {}", idx, line),
                        ))
                    }
                }
            }
        }
    }
    Ok(peptides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning() {
        assert_eq!(clean_peptide("K.SIINFEKL.R").as_deref(), Some("SIINFEKL"));
        assert_eq!(clean_peptide("siin(+15.99)fekl").as_deref(), Some("SIINFEKL"));
        assert_eq!(clean_peptide("SIINFEKLB"), None);
        assert_eq!(clean_peptide("  "), None);
        assert_eq!(
            clean_peptides(["AAAKL", "X.QQQ"]),
            vec!["AAAKL".to_string(), "QQQ".to_string()]
        );
    }

    #[test]
    fn sample_names_become_path_safe() {
        assert_eq!(sanitize_sample_name("run 1/a:b"), "run_1_a_b");
        assert_eq!(sanitize_sample_name("A&B 5%"), "AANDB_5percent");
    }

    #[test]
    fn loads_plain_and_delimited_files() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.txt");
        std::fs::write(&plain, "SIINFEKL\n\nGILGFVFTL\n").unwrap();
        assert_eq!(
            load_peptide_file(&plain, None).unwrap(),
            vec!["SIINFEKL", "GILGFVFTL"]
        );

        let csv = dir.path().join("table.csv");
        std::fs::write(&csv, "Protein,Sequence,Score\nP1,SIINFEKL,3\nP2,GILGFVFTL,4\n").unwrap();
        assert_eq!(
            load_peptide_file(&csv, Some((Delimiter::Comma, "Sequence"))).unwrap(),
            vec!["SIINFEKL", "GILGFVFTL"]
        );
        assert!(matches!(
            load_peptide_file(&csv, Some((Delimiter::Comma, "Peptide"))),
            Err(PipelineError::ParseFormat { .. })
        ));
    }
}
