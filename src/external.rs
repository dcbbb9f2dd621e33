use std::path::Path;

use itertools::Itertools;

use crate::structures::MhcClass;

/// How many trailing output lines are searched for the tool's error marker.
const ERROR_TAIL_LINES: usize = 5;

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// `netMHCpan -p -f <file> -a <alleles> -BA` (class I) or
/// `netMHCIIpan -inptype 1 -f <file> -a <alleles> -BA` (class II).
pub fn predictor_command<S>(tool: &Path, class: MhcClass, peptide_file: &Path, alleles: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let mut cmd = vec![path_arg(tool)];
    match class {
        MhcClass::I => cmd.push("-p".into()),
        MhcClass::II => cmd.extend(["-inptype".into(), "1".into()]),
    }
    cmd.extend([
        "-f".into(),
        path_arg(peptide_file),
        "-a".into(),
        alleles.iter().map(|a| a.as_ref()).join(","),
        "-BA".into(),
    ]);
    cmd
}

/// Motif length forced on allele-specific class I runs.
pub fn fixed_motif_length(allele: &str) -> usize {
    if allele.to_lowercase().contains("kb") {
        8
    } else {
        9
    }
}

pub fn gibbscluster_command(
    tool: &Path,
    class: MhcClass,
    peptide_file: &Path,
    groups: usize,
    fixed_length: Option<usize>,
) -> Vec<String> {
    let mut cmd = vec![
        path_arg(tool),
        "-f".into(),
        path_arg(peptide_file),
        "-P".into(),
        format!("{}groups", groups),
    ];
    if let Some(l) = fixed_length {
        cmd.extend(["-l".into(), l.to_string()]);
    }
    cmd.extend(
        ["-g", groups.to_string().as_str(), "-k", "1", "-T", "-j", "2"]
            .iter()
            .map(|s| s.to_string()),
    );
    if class == MhcClass::I {
        cmd.extend(["-C", "-D", "4", "-I", "1"].iter().map(|s| s.to_string()));
    }
    cmd.push("-G".into());
    cmd
}

/// True when the last few lines of combined output mention `marker`
/// (case-insensitive).
pub fn reports_error(stdout: &str, stderr: &str, marker: &str) -> bool {
    if marker.is_empty() {
        return false;
    }
    let marker = marker.to_lowercase();
    let lines = stdout.lines().chain(stderr.lines()).collect_vec();
    lines
        .iter()
        .rev()
        .take(ERROR_TAIL_LINES)
        .any(|l| l.to_lowercase().contains(&marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn class_one_prediction_command() {
        let cmd = predictor_command(
            &PathBuf::from("/opt/netMHCpan"),
            MhcClass::I,
            &PathBuf::from("/tmp/peplist_1.txt"),
            &["HLA-A02:01", "HLA-B07:02"],
        );
        assert_eq!(
            cmd,
            vec![
                "/opt/netMHCpan",
                "-p",
                "-f",
                "/tmp/peplist_1.txt",
                "-a",
                "HLA-A02:01,HLA-B07:02",
                "-BA"
            ]
        );
    }

    #[test]
    fn class_two_uses_inptype() {
        let cmd = predictor_command(
            &PathBuf::from("netMHCIIpan"),
            MhcClass::II,
            &PathBuf::from("p.txt"),
            &["DRB1_0101"],
        );
        assert_eq!(&cmd[1..3], &["-inptype", "1"]);
    }

    #[test]
    fn allele_specific_gibbs_run_fixes_length() {
        let cmd = gibbscluster_command(
            &PathBuf::from("gibbscluster"),
            MhcClass::I,
            &PathBuf::from("peps.txt"),
            1,
            Some(fixed_motif_length("H-2-Kb")),
        );
        assert_eq!(
            cmd.join(" "),
            "gibbscluster -f peps.txt -P 1groups -l 8 -g 1 -k 1 -T -j 2 -C -D 4 -I 1 -G"
        );
        assert_eq!(fixed_motif_length("HLA-A02:01"), 9);
    }

    #[test]
    fn class_two_gibbs_run_has_no_trash_flags() {
        let cmd = gibbscluster_command(
            &PathBuf::from("gibbscluster"),
            MhcClass::II,
            &PathBuf::from("peps.txt"),
            3,
            None,
        );
        assert_eq!(cmd.join(" "), "gibbscluster -f peps.txt -P 3groups -g 3 -k 1 -T -j 2 -G");
    }

    #[test]
    fn error_marker_only_checked_in_tail() {
        let early = format!("Error early\n{}", "ok\n".repeat(10));
        assert!(!reports_error(&early, "", "error"));
        assert!(reports_error("fine\n", "ERROR: unknown allele\n", "error"));
        assert!(!reports_error("fine\n", "ERROR\n", ""));
    }
}
