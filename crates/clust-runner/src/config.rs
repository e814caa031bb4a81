use crate::error::RunnerError;
use crate::params::ParameterSet;
use crate::store::reserved_char;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub result_root: PathBuf,
    pub run_threads: usize,
    pub iteration_threads: usize,
    pub pause_poll_ms: u64,
    pub process_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_root: PathBuf::from("results"),
            run_threads: 5,
            iteration_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pause_poll_ms: 100,
            process_poll_ms: 50,
        }
    }
}

pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read engine config {}: {}", path.display(), e))?;
    let config: EngineConfig = serde_yaml::from_str(&raw)?;
    if config.run_threads == 0 || config.iteration_threads == 0 {
        return Err(anyhow!("engine config: thread pool sizes must be positive"));
    }
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Clustering,
    ParameterOptimization,
    DataAnalysis,
    RunAnalysis,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Clustering => "clustering",
            RunMode::ParameterOptimization => "parameter_optimization",
            RunMode::DataAnalysis => "data_analysis",
            RunMode::RunAnalysis => "run_analysis",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Integer,
    Float,
    #[default]
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramParameter {
    pub name: String,
    #[serde(default)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub optimizable: bool,
}

fn default_binding() -> String {
    "process".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default = "default_binding")]
    pub binding: String,
    #[serde(default)]
    pub executable: Option<String>,
    pub invocation: String,
    #[serde(default)]
    pub invocation_without_goldstandard: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatible_formats: Vec<String>,
    #[serde(default)]
    pub max_execution_secs: Option<u64>,
    #[serde(default)]
    pub parameters: Vec<ProgramParameter>,
}

impl ProgramConfig {
    pub fn optimizable_parameters(&self) -> Vec<&ProgramParameter> {
        self.parameters.iter().filter(|p| p.optimizable).collect()
    }

    pub fn optimizable_parameter_names(&self) -> Vec<String> {
        self.optimizable_parameters()
            .into_iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&ProgramParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn accepts_format(&self, format: &str) -> bool {
        self.compatible_formats.is_empty() || self.compatible_formats.iter().any(|f| f == format)
    }
}

fn default_format() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub name: String,
    pub dataset: PathBuf,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub goldstandard: Option<PathBuf>,
}

fn default_measure_kind() -> String {
    "reported".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureDefinition {
    pub id: String,
    #[serde(default = "default_measure_kind")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub higher_is_better: bool,
}

fn default_method() -> String {
    "grid".to_string()
}

fn default_iterations() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSettings {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub criterion: Option<String>,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<ParameterSet>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            method: default_method(),
            criterion: None,
            iterations: default_iterations(),
            seed: 0,
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDefinition {
    pub name: String,
    pub mode: RunMode,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
    #[serde(default)]
    pub data: Vec<DataConfig>,
    #[serde(default)]
    pub measures: Vec<MeasureDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_values: BTreeMap<String, ParameterSet>,
    #[serde(default)]
    pub optimization: Option<OptimizationSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statistics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<String>,
}

impl RunDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let def: RunDefinition = serde_yaml::from_str(raw)?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(RunnerError::Setup(format!("invalid run name {:?}", self.name)).into());
        }
        if self.data.is_empty() && self.mode != RunMode::RunAnalysis {
            return Err(RunnerError::Setup("run defines no data configurations".into()).into());
        }
        unique_names("program", self.programs.iter().map(|p| p.name.as_str()))?;
        unique_names("data", self.data.iter().map(|d| d.name.as_str()))?;
        unique_names("measure", self.measures.iter().map(|m| m.id.as_str()))?;
        match self.mode {
            RunMode::Clustering | RunMode::ParameterOptimization => {
                if self.programs.is_empty() {
                    return Err(RunnerError::Setup("run defines no programs".into()).into());
                }
                if self.measures.is_empty() {
                    return Err(
                        RunnerError::Setup("run defines no quality measures".into()).into(),
                    );
                }
                self.check_labels()?;
            }
            RunMode::DataAnalysis | RunMode::RunAnalysis => {
                if self.statistics.is_empty() {
                    return Err(
                        RunnerError::Setup("analysis run defines no statistics".into()).into(),
                    );
                }
            }
        }
        if self.mode == RunMode::RunAnalysis {
            if self.runs.is_empty() {
                return Err(RunnerError::Setup("run analysis names no runs".into()).into());
            }
            unique_names("run", self.runs.iter().map(String::as_str))?;
            if let Some(id) = self
                .runs
                .iter()
                .find(|id| id.trim().is_empty() || id.contains(['/', '\\']))
            {
                return Err(RunnerError::Setup(format!("invalid run id {:?}", id)).into());
            }
        }
        self.check_result_fields()?;
        if let Some(criterion) = self.optimization.as_ref().and_then(|o| o.criterion.as_ref()) {
            if !self.measures.iter().any(|m| &m.id == criterion) {
                return Err(RunnerError::Setup(format!(
                    "optimization criterion {:?} is not a configured measure",
                    criterion
                ))
                .into());
            }
        }
        for program in self.parameter_values.keys() {
            if !self.programs.iter().any(|p| &p.name == program) {
                return Err(RunnerError::Setup(format!(
                    "parameter_values references unknown program {:?}",
                    program
                ))
                .into());
            }
        }
        Ok(())
    }

    // Two pairs with one label would share a result file.
    fn check_labels(&self) -> Result<()> {
        let mut seen: BTreeMap<String, (&str, &str)> = BTreeMap::new();
        for program in &self.programs {
            for data in &self.data {
                let label = format!("{}_{}", program.name, data.name);
                if let Some((p, d)) = seen.insert(label.clone(), (&program.name, &data.name)) {
                    return Err(RunnerError::Setup(format!(
                        "pairs {}/{} and {}/{} both map to result label {:?}",
                        p, d, program.name, data.name, label
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn check_result_fields(&self) -> Result<()> {
        for program in &self.programs {
            for p in &program.parameters {
                plain_field("parameter name", &p.name)?;
                if let Some(default) = &p.default {
                    plain_field(&format!("default of {}", p.name), default)?;
                }
                for option in &p.options {
                    plain_field(&format!("option of {}", p.name), option)?;
                }
            }
        }
        for (program, values) in &self.parameter_values {
            for (name, value) in values.iter() {
                plain_field(&format!("value of {}.{}", program, name), value)?;
            }
        }
        if let Some(optimization) = &self.optimization {
            for candidate in &optimization.candidates {
                for (name, value) in candidate.iter() {
                    plain_field(&format!("candidate value of {}", name), value)?;
                }
            }
        }
        for measure in &self.measures {
            plain_field("measure id", &measure.id)?;
        }
        Ok(())
    }

    pub fn criterion(&self) -> Option<&str> {
        self.optimization
            .as_ref()
            .and_then(|o| o.criterion.as_deref())
            .or_else(|| self.measures.first().map(|m| m.id.as_str()))
    }

    pub fn pairs(&self) -> Vec<RunPair> {
        let data: Vec<Arc<DataConfig>> = self.data.iter().cloned().map(Arc::new).collect();
        let mut out = Vec::new();
        for program in &self.programs {
            let program = Arc::new(program.clone());
            for d in &data {
                out.push(RunPair {
                    program: Arc::clone(&program),
                    data: Arc::clone(d),
                });
            }
        }
        out
    }

    pub fn fixed_values(&self, program: &str) -> ParameterSet {
        self.parameter_values
            .get(program)
            .cloned()
            .unwrap_or_default()
    }

    pub fn optimization_settings(&self) -> OptimizationSettings {
        self.optimization.clone().unwrap_or_default()
    }

    pub fn config_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .programs
            .iter()
            .map(|p| format!("program:{}", p.name))
            .collect();
        ids.extend(self.data.iter().map(|d| format!("data:{}", d.name)));
        ids
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for d in &mut self.data {
            d.dataset = resolve_against(base, &d.dataset);
            if let Some(gs) = d.goldstandard.take() {
                d.goldstandard = Some(resolve_against(base, &gs));
            }
        }
        for p in &mut self.programs {
            if let Some(exe) = p.executable.as_mut() {
                if exe.contains('/') && Path::new(exe.as_str()).is_relative() {
                    *exe = base.join(exe.as_str()).to_string_lossy().to_string();
                }
            }
        }
    }
}

fn unique_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(RunnerError::Setup(format!("duplicate {} name {:?}", kind, name)).into());
        }
    }
    Ok(())
}

fn plain_field(what: &str, value: &str) -> Result<()> {
    match reserved_char(value) {
        Some(c) => Err(RunnerError::Setup(format!(
            "{} {:?} contains the result file separator {:?}",
            what, value, c
        ))
        .into()),
        None => Ok(()),
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn load_run_definition(path: &Path) -> Result<RunDefinition> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read run definition {}: {}", path.display(), e))?;
    let mut def = RunDefinition::from_yaml(&raw)?;
    let base = path
        .parent()
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."));
    def.resolve_paths(&base);
    Ok(def)
}

#[derive(Debug, Clone)]
pub struct RunPair {
    pub program: Arc<ProgramConfig>,
    pub data: Arc<DataConfig>,
}

impl RunPair {
    pub fn label(&self) -> String {
        format!("{}_{}", self.program.name, self.data.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF: &str = r#"
name: kmeans_sweep
mode: parameter_optimization
programs:
  - name: kmeans
    executable: bin/kmeans.sh
    invocation: "%e% %i% %o% %k%"
    parameters:
      - name: k
        kind: integer
        min: 2
        max: 6
        optimizable: true
      - name: iterations
        default: "100"
data:
  - name: iris
    dataset: data/iris.tsv
    goldstandard: data/iris_gs.tsv
  - name: wine
    dataset: /abs/wine.tsv
measures:
  - id: F1
optimization:
  method: grid
  iterations: 5
"#;

    #[test]
    fn definition_parses_with_defaults() {
        let def = RunDefinition::from_yaml(DEF).expect("parse definition");
        assert_eq!(def.mode, RunMode::ParameterOptimization);
        assert_eq!(def.programs[0].binding, "process");
        assert_eq!(def.programs[0].optimizable_parameter_names(), vec!["k"]);
        assert_eq!(def.data[0].format, "default");
        assert!(def.measures[0].higher_is_better);
        assert_eq!(def.measures[0].kind, "reported");
        assert_eq!(def.optimization_settings().iterations, 5);
        assert_eq!(def.pairs().len(), 2);
        assert_eq!(def.pairs()[1].label(), "kmeans_wine");
    }

    #[test]
    fn relative_paths_resolve_against_definition_dir() {
        let mut def = RunDefinition::from_yaml(DEF).expect("parse definition");
        def.resolve_paths(Path::new("/defs"));
        assert_eq!(def.data[0].dataset, PathBuf::from("/defs/data/iris.tsv"));
        assert_eq!(
            def.data[0].goldstandard,
            Some(PathBuf::from("/defs/data/iris_gs.tsv"))
        );
        assert_eq!(def.data[1].dataset, PathBuf::from("/abs/wine.tsv"));
        assert_eq!(
            def.programs[0].executable.as_deref(),
            Some("/defs/bin/kmeans.sh")
        );
    }

    #[test]
    fn validation_rejects_unknown_criterion_and_duplicates() {
        let bad = DEF.replace("  method: grid", "  method: grid\n  criterion: Rand");
        let err = RunDefinition::from_yaml(&bad).expect_err("criterion must exist");
        assert!(err.to_string().contains("setup_error"), "{}", err);

        let dup = DEF.replace("name: wine", "name: iris");
        assert!(RunDefinition::from_yaml(&dup).is_err());
    }

    #[test]
    fn separator_characters_cannot_reach_result_rows() {
        let option = DEF.replace(
            "      - name: iterations\n",
            "      - name: mode\n        options: [\"a,b\", \"c\"]\n        optimizable: true\n      - name: iterations\n",
        );
        let err = RunDefinition::from_yaml(&option).expect_err("comma in option");
        assert!(err.to_string().starts_with("setup_error:"), "{}", err);
        assert!(err.to_string().contains("option of mode"), "{}", err);

        let default = DEF.replace("default: \"100\"", "default: \"1\\t2\"");
        assert!(RunDefinition::from_yaml(&default).is_err());

        let fixed = format!("{}parameter_values:\n  kmeans:\n    iterations: \"5,6\"\n", DEF);
        let err = RunDefinition::from_yaml(&fixed).expect_err("comma in fixed value");
        assert!(err.to_string().contains("kmeans.iterations"), "{}", err);

        let candidate = DEF.replace(
            "  iterations: 5\n",
            "  iterations: 5\n  candidates:\n    - {k: \"2,3\"}\n",
        );
        assert!(RunDefinition::from_yaml(&candidate).is_err());
    }

    #[test]
    fn colliding_pair_labels_are_rejected() {
        let yaml = r#"
name: collide
mode: clustering
programs:
  - name: a_b
    invocation: "%e%"
  - name: a
    invocation: "%e%"
data:
  - name: c
    dataset: c.tsv
  - name: b_c
    dataset: bc.tsv
measures:
  - id: F1
"#;
        let err = RunDefinition::from_yaml(yaml).expect_err("a_b_c twice");
        assert!(err.to_string().contains("a_b_c"), "{}", err);
    }

    #[test]
    fn run_analysis_needs_runs_but_no_data() {
        let yaml = "name: meta\nmode: run_analysis\nstatistics: [pair_count]\nruns: [old_run]\n";
        let def = RunDefinition::from_yaml(yaml).expect("run analysis");
        assert_eq!(def.runs, vec!["old_run"]);
        assert_eq!(def.mode.as_str(), "run_analysis");
        let no_runs = "name: meta\nmode: run_analysis\nstatistics: [pair_count]\n";
        assert!(RunDefinition::from_yaml(no_runs).is_err());
        let nested = yaml.replace("old_run", "../old_run");
        assert!(RunDefinition::from_yaml(&nested).is_err());
    }

    #[test]
    fn criterion_defaults_to_first_measure() {
        let def = RunDefinition::from_yaml(DEF).expect("parse definition");
        assert_eq!(def.criterion(), Some("F1"));
        let two = DEF.replace(
            "  - id: F1\n",
            "  - id: F1\n  - id: Dunn\n    higher_is_better: false\n",
        );
        let named = two.replace("  method: grid", "  method: grid\n  criterion: Dunn");
        let def = RunDefinition::from_yaml(&named).expect("criterion");
        assert_eq!(def.criterion(), Some("Dunn"));
    }

    #[test]
    fn engine_config_fills_missing_fields() {
        let config: EngineConfig = serde_yaml::from_str("run_threads: 2\n").expect("engine yaml");
        assert_eq!(config.run_threads, 2);
        assert_eq!(config.result_root, PathBuf::from("results"));
        assert!(config.iteration_threads >= 1);
    }
}
