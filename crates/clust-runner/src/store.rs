use crate::error::RunnerError;
use crate::locks::LockRegistry;
use crate::params::{ParameterSet, QualitySet, QualityValue};
use crate::ensure_dir;
use anyhow::{anyhow, Result};
use chrono::Local;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RunLayout {
    pub run_id: String,
    pub root: PathBuf,
}

impl RunLayout {
    pub fn new(result_root: &Path, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            root: result_root.join(run_id),
        }
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn inputs(&self) -> PathBuf {
        self.root.join("inputs")
    }

    pub fn goldstandards(&self) -> PathBuf {
        self.root.join("goldstandards")
    }

    pub fn clusters(&self) -> PathBuf {
        self.root.join("clusters")
    }

    pub fn qualities(&self) -> PathBuf {
        self.root.join("qualities")
    }

    pub fn analyses(&self) -> PathBuf {
        self.root.join("analyses")
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            self.configs(),
            self.logs(),
            self.inputs(),
            self.goldstandards(),
            self.clusters(),
            self.qualities(),
            self.analyses(),
        ] {
            ensure_dir(&dir)?;
        }
        Ok(())
    }

    pub fn run_log(&self) -> PathBuf {
        self.logs().join(format!("{}.log", self.run_id))
    }

    pub fn complete_file(&self, pair_label: &str) -> PathBuf {
        self.qualities()
            .join(format!("{}.results.qual.complete", pair_label))
    }

    pub fn iteration_output(&self, pair_label: &str, iteration: u64) -> PathBuf {
        self.clusters()
            .join(format!("{}.{}.results", pair_label, iteration))
    }

    pub fn iteration_qualities(&self, pair_label: &str, iteration: u64) -> PathBuf {
        self.qualities()
            .join(format!("{}.{}.results.qual", pair_label, iteration))
    }

    pub fn iteration_log(&self, pair_label: &str, iteration: u64) -> PathBuf {
        self.logs().join(format!("{}.{}.log", pair_label, iteration))
    }

    pub fn analysis_output(&self, data: &str, statistic: &str) -> PathBuf {
        self.analyses().join(format!("{}_{}.txt", data, statistic))
    }
}

#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        let _guard = self.write.lock();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        for line in message.lines() {
            writeln!(file, "{}\t{}", stamp, line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IterationRecord {
    Completed {
        iteration: u64,
        parameters: ParameterSet,
        qualities: QualitySet,
    },
    Duplicate { iteration: u64, previous: u64 },
}

impl IterationRecord {
    pub fn iteration(&self) -> u64 {
        match self {
            IterationRecord::Completed { iteration, .. }
            | IterationRecord::Duplicate { iteration, .. } => *iteration,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultFile {
    pub parameter_names: Vec<String>,
    pub measure_names: Vec<String>,
    pub records: Vec<IterationRecord>,
}

impl ResultFile {
    pub fn parse(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read result file {}: {}", path.display(), e))?;
        Self::parse_str(path, &text)
    }

    pub fn parse_str(path: &Path, text: &str) -> Result<Self> {
        let parse_err = |line: usize, message: String| RunnerError::ResultParse {
            path: path.to_path_buf(),
            line,
            message,
        };
        let mut lines = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| parse_err(1, "missing header".to_string()))?;
        let cols: Vec<&str> = header.split('\t').collect();
        if cols.len() < 2 || cols[0] != "iteration" {
            return Err(parse_err(1, format!("malformed header {:?}", header)).into());
        }
        let parameter_names = split_names(cols[1]);
        let measure_names: Vec<String> = cols[2..].iter().map(|s| s.to_string()).collect();

        let mut records = Vec::new();
        for (idx, line) in lines {
            let line_no = idx + 1;
            let fields: Vec<&str> = line.split('\t').collect();
            let first = fields[0].trim();
            if let Some(dup) = first.strip_suffix('*') {
                let iteration = parse_iteration(dup).map_err(|m| parse_err(line_no, m))?;
                let previous = fields
                    .get(1)
                    .ok_or_else(|| parse_err(line_no, "duplicate row without reference".into()))
                    .and_then(|f| parse_iteration(f).map_err(|m| parse_err(line_no, m)))?;
                records.push(IterationRecord::Duplicate {
                    iteration,
                    previous,
                });
                continue;
            }
            let iteration = parse_iteration(first).map_err(|m| parse_err(line_no, m))?;
            let raw_values = fields.get(1).copied().unwrap_or("");
            let values: Vec<&str> = if parameter_names.is_empty() {
                if !raw_values.is_empty() {
                    return Err(parse_err(line_no, "unexpected parameter values".into()).into());
                }
                Vec::new()
            } else {
                raw_values.split(',').collect()
            };
            if values.len() != parameter_names.len() {
                return Err(parse_err(
                    line_no,
                    format!(
                        "expected {} parameter values, found {}",
                        parameter_names.len(),
                        values.len()
                    ),
                )
                .into());
            }
            let quality_fields = fields.get(2..).unwrap_or(&[]);
            if quality_fields.len() != measure_names.len() {
                return Err(parse_err(
                    line_no,
                    format!(
                        "expected {} quality values, found {}",
                        measure_names.len(),
                        quality_fields.len()
                    ),
                )
                .into());
            }
            let parameters: ParameterSet = parameter_names
                .iter()
                .cloned()
                .zip(values.iter().map(|v| v.to_string()))
                .collect();
            let mut qualities = QualitySet::new();
            for (name, raw) in measure_names.iter().zip(quality_fields) {
                let value = QualityValue::parse(raw)
                    .map_err(|e| parse_err(line_no, e.to_string()))?;
                qualities.insert(name.clone(), value);
            }
            records.push(IterationRecord::Completed {
                iteration,
                parameters,
                qualities,
            });
        }
        Ok(Self {
            parameter_names,
            measure_names,
            records,
        })
    }

    pub fn completed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, IterationRecord::Completed { .. }))
            .count()
    }

    pub fn resolve(&self, iteration: u64) -> Option<(&ParameterSet, &QualitySet)> {
        let by_iter: HashMap<u64, &IterationRecord> =
            self.records.iter().map(|r| (r.iteration(), r)).collect();
        let mut current = iteration;
        for _ in 0..=self.records.len() {
            match by_iter.get(&current)? {
                IterationRecord::Completed {
                    parameters,
                    qualities,
                    ..
                } => return Some((parameters, qualities)),
                IterationRecord::Duplicate { previous, .. } => current = *previous,
            }
        }
        None
    }
}

const RESERVED: [char; 4] = [',', '\t', '\r', '\n'];

/// Names and values are written unescaped, so a separator inside one would
/// shift every later column.
pub(crate) fn reserved_char(value: &str) -> Option<char> {
    value.chars().find(|c| RESERVED.contains(c))
}

fn split_names(field: &str) -> Vec<String> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(',').map(|s| s.to_string()).collect()
    }
}

fn parse_iteration(raw: &str) -> std::result::Result<u64, String> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid iteration number {:?}", raw))
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
    parameter_names: Vec<String>,
    measure_names: Vec<String>,
    locks: Arc<LockRegistry>,
}

impl ResultStore {
    pub fn new(
        path: PathBuf,
        parameter_names: Vec<String>,
        measure_names: Vec<String>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            path,
            parameter_names,
            measure_names,
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn measure_names(&self) -> &[String] {
        &self.measure_names
    }

    pub fn header_line(&self) -> String {
        format!(
            "iteration\t{}\t{}",
            self.parameter_names.join(","),
            self.measure_names.join("\t")
        )
    }

    /// Fresh runs truncate; resumed runs keep the file and check its header.
    pub fn prepare(&self, resume: bool) -> Result<()> {
        let _guard = self.locks.lock(&self.path);
        if resume && self.path.exists() {
            let existing = ResultFile::parse(&self.path)?;
            if existing.parameter_names != self.parameter_names
                || existing.measure_names != self.measure_names
            {
                return Err(anyhow!(
                    "result_header_mismatch: {} was written for different parameters or measures",
                    self.path.display()
                ));
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&self.path, format!("{}\n", self.header_line()))?;
        Ok(())
    }

    pub fn append_completed(
        &self,
        iteration: u64,
        parameters: &ParameterSet,
        qualities: &QualitySet,
    ) -> Result<()> {
        let values = parameters.values_for(&self.parameter_names);
        for (name, value) in self.parameter_names.iter().zip(&values) {
            if let Some(c) = reserved_char(value) {
                return Err(anyhow!(
                    "invalid_parameter_value: iteration {} of {}: {}={:?} contains {:?}",
                    iteration,
                    self.path.display(),
                    name,
                    value,
                    c
                ));
            }
        }
        let line = format!(
            "{}\t{}\t{}",
            iteration,
            values.join(","),
            qualities.values_for(&self.measure_names).join("\t")
        );
        self.append_line(&line)
    }

    pub fn append_duplicate(&self, iteration: u64, previous: u64) -> Result<()> {
        self.append_line(&format!("{}*\t{}", iteration, previous))
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let _guard = self.locks.lock(&self.path);
        let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    pub fn read(&self) -> Result<ResultFile> {
        let _guard = self.locks.lock(&self.path);
        ResultFile::parse(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, params: &[&str], measures: &[&str]) -> ResultStore {
        ResultStore::new(
            dir.join("kmeans_iris.results.qual.complete"),
            params.iter().map(|s| s.to_string()).collect(),
            measures.iter().map(|s| s.to_string()).collect(),
            Arc::new(LockRegistry::new()),
        )
    }

    #[test]
    fn completed_row_round_trips() {
        let dir = crate::scratch_dir("clust_store_roundtrip");
        let store = store(&dir, &["k"], &["F1"]);
        store.prepare(false).expect("header");
        let params: ParameterSet = [("k", "3")].into_iter().collect();
        let qualities: QualitySet = [("F1", QualityValue::Value(0.82))].into_iter().collect();
        store
            .append_completed(5, &params, &qualities)
            .expect("append");

        let text = fs::read_to_string(store.path()).expect("read");
        assert_eq!(text, "iteration\tk\tF1\n5\t3\t0.82\n");

        let parsed = store.read().expect("parse");
        match &parsed.records[0] {
            IterationRecord::Completed {
                iteration,
                parameters,
                qualities: q,
            } => {
                assert_eq!(*iteration, 5);
                assert_eq!(parameters, &params);
                assert_eq!(q.get("F1"), Some(QualityValue::Value(0.82)));
                assert_eq!(q, &qualities);
            }
            other => panic!("expected completed record, got {:?}", other),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicates_resolve_to_their_origin() {
        let text = "iteration\tk,seed\tF1\tRand\n\
                    1\t2,7\t0.5\tNT\n\
                    2\t3,7\t0.8\t0.6\n\
                    3*\t1\n";
        let parsed = ResultFile::parse_str(Path::new("mem"), text).expect("parse");
        assert_eq!(parsed.parameter_names, vec!["k", "seed"]);
        assert_eq!(parsed.measure_names, vec!["F1", "Rand"]);
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.completed_count(), 2);
        assert_eq!(
            parsed.records[2],
            IterationRecord::Duplicate {
                iteration: 3,
                previous: 1
            }
        );
        let (params, qualities) = parsed.resolve(3).expect("resolve duplicate");
        assert_eq!(params.get("k"), Some("2"));
        assert_eq!(qualities.get("Rand"), Some(QualityValue::NotTerminated));
        assert!(parsed.resolve(9).is_none());
    }

    #[test]
    fn parameterless_header_parses() {
        let text = "iteration\t\tF1\n1\t\t0.25\n";
        let parsed = ResultFile::parse_str(Path::new("mem"), text).expect("parse");
        assert!(parsed.parameter_names.is_empty());
        assert_eq!(parsed.completed_count(), 1);
    }

    #[test]
    fn malformed_rows_report_line_numbers() {
        let text = "iteration\tk\tF1\n1\t2\t0.5\n2\t3\n";
        let err = ResultFile::parse_str(Path::new("x.qual"), text).expect_err("short row");
        let msg = err.to_string();
        assert!(msg.contains("result_parse"), "{}", msg);
        assert!(msg.contains(":3:"), "{}", msg);
    }

    #[test]
    fn resume_keeps_rows_and_checks_header() {
        let dir = crate::scratch_dir("clust_store_resume");
        let first = store(&dir, &["k"], &["F1"]);
        first.prepare(false).expect("header");
        first.append_duplicate(2, 1).expect("dup");
        first.prepare(true).expect("resume keeps file");
        assert_eq!(first.read().expect("parse").records.len(), 1);

        let other = store(&dir, &["k"], &["Rand"]);
        let err = other.prepare(true).expect_err("header mismatch");
        assert!(err.to_string().contains("result_header_mismatch"));

        first.prepare(false).expect("fresh truncates");
        assert!(first.read().expect("parse").records.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn separator_in_value_is_refused_before_writing() {
        let dir = crate::scratch_dir("clust_store_reserved");
        let store = store(&dir, &["mode"], &["F1"]);
        store.prepare(false).expect("header");
        let qualities: QualitySet = [("F1", QualityValue::Value(0.5))].into_iter().collect();
        let bad: ParameterSet = [("mode", "a,b")].into_iter().collect();
        let err = store
            .append_completed(1, &bad, &qualities)
            .expect_err("comma would split the value");
        assert!(err.to_string().starts_with("invalid_parameter_value:"), "{}", err);
        let good: ParameterSet = [("mode", "c")].into_iter().collect();
        store.append_completed(2, &good, &qualities).expect("append");

        let parsed = store.read().expect("file still parses");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].iteration(), 2);
        assert_eq!(reserved_char("x\ty"), Some('\t'));
        assert_eq!(reserved_char("0.5"), None);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn layout_names_per_iteration_artifacts() {
        let layout = RunLayout::new(Path::new("/r"), "01_02_2026-10_00_00_sweep");
        assert_eq!(
            layout.complete_file("km_iris"),
            PathBuf::from("/r/01_02_2026-10_00_00_sweep/qualities/km_iris.results.qual.complete")
        );
        assert_eq!(
            layout.iteration_output("km_iris", 4),
            PathBuf::from("/r/01_02_2026-10_00_00_sweep/clusters/km_iris.4.results")
        );
        assert_eq!(
            layout.run_log(),
            PathBuf::from("/r/01_02_2026-10_00_00_sweep/logs/01_02_2026-10_00_00_sweep.log")
        );
    }
}
