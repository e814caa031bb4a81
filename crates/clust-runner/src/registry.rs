use crate::config::{
    DataConfig, MeasureDefinition, OptimizationSettings, ProgramConfig, ProgramParameter,
};
use crate::error::RunnerError;
use crate::optimization::{ExplicitSearch, GridSearch, RandomSearch, SearchPolicy};
use crate::run::RunResult;
use crate::task::{ProcessBinding, ProgramBinding};
use crate::ensure_dir;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct QualityInput<'a> {
    pub output: &'a Path,
    pub goldstandard: Option<&'a Path>,
    pub dataset: &'a Path,
}

pub trait QualityMeasure: Send + Sync {
    fn id(&self) -> &str;

    /// Strict order: true only when `candidate` beats `current`.
    fn is_better(&self, candidate: f64, current: f64) -> bool;

    fn compute(&self, input: &QualityInput<'_>) -> Result<f64>;
}

pub trait StatisticCalculator: Send + Sync {
    fn id(&self) -> &str;

    fn compute(&self, data: &DataConfig, dataset: &Path) -> Result<String>;
}

pub trait RunStatistic: Send + Sync {
    fn id(&self) -> &str;

    fn compute(&self, results: &[RunResult]) -> Result<String>;
}

pub trait DatasetConverter: Send + Sync {
    fn convert(&self, source: &Path, target_format: &str, dest_dir: &Path) -> Result<PathBuf>;
}

pub type MeasureFactory =
    Arc<dyn Fn(&MeasureDefinition) -> Result<Arc<dyn QualityMeasure>> + Send + Sync>;
pub type PolicyFactory = Arc<
    dyn Fn(&[ProgramParameter], &OptimizationSettings) -> Result<Box<dyn SearchPolicy>>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct Registry {
    bindings: HashMap<String, Arc<dyn ProgramBinding>>,
    measures: HashMap<String, MeasureFactory>,
    policies: HashMap<String, PolicyFactory>,
    converters: HashMap<(String, String), Arc<dyn DatasetConverter>>,
    statistics: HashMap<String, Arc<dyn StatisticCalculator>>,
    run_statistics: HashMap<String, Arc<dyn RunStatistic>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins(process_poll: Duration) -> Self {
        let mut registry = Self::empty();
        registry.register_binding("process", Arc::new(ProcessBinding::new(process_poll)));
        registry.register_measure_kind(
            "reported",
            Arc::new(|def: &MeasureDefinition| {
                Ok(Arc::new(ReportedMeasure::new(&def.id, def.higher_is_better))
                    as Arc<dyn QualityMeasure>)
            }),
        );
        let grid: PolicyFactory =
            Arc::new(|params: &[ProgramParameter], settings: &OptimizationSettings| {
                Ok(Box::new(GridSearch::new(params, settings.iterations)?) as Box<dyn SearchPolicy>)
            });
        registry.register_search_policy("grid", Arc::clone(&grid));
        registry.register_search_policy("divisive", grid);
        registry.register_search_policy(
            "random",
            Arc::new(|params: &[ProgramParameter], settings: &OptimizationSettings| {
                Ok(Box::new(RandomSearch::new(params, settings.iterations, settings.seed)?)
                    as Box<dyn SearchPolicy>)
            }),
        );
        registry.register_search_policy(
            "explicit",
            Arc::new(|_: &[ProgramParameter], settings: &OptimizationSettings| {
                Ok(Box::new(ExplicitSearch::new(settings.candidates.clone()))
                    as Box<dyn SearchPolicy>)
            }),
        );
        registry.register_statistic(Arc::new(NumSamples));
        registry.register_statistic(Arc::new(FileSize));
        registry.register_run_statistic(Arc::new(PairCount));
        registry.register_run_statistic(Arc::new(CompletedIterations));
        registry
    }

    pub fn register_binding(&mut self, name: &str, binding: Arc<dyn ProgramBinding>) {
        self.bindings.insert(name.to_string(), binding);
    }

    pub fn register_measure_kind(&mut self, kind: &str, factory: MeasureFactory) {
        self.measures.insert(kind.to_string(), factory);
    }

    pub fn register_search_policy(&mut self, name: &str, factory: PolicyFactory) {
        self.policies.insert(name.to_string(), factory);
    }

    pub fn register_converter(
        &mut self,
        from_format: &str,
        to_format: &str,
        converter: Arc<dyn DatasetConverter>,
    ) {
        self.converters
            .insert((from_format.to_string(), to_format.to_string()), converter);
    }

    pub fn register_statistic(&mut self, statistic: Arc<dyn StatisticCalculator>) {
        self.statistics.insert(statistic.id().to_string(), statistic);
    }

    pub fn register_run_statistic(&mut self, statistic: Arc<dyn RunStatistic>) {
        self.run_statistics
            .insert(statistic.id().to_string(), statistic);
    }

    pub fn binding(&self, name: &str) -> Result<Arc<dyn ProgramBinding>> {
        self.bindings.get(name).cloned().ok_or_else(|| {
            RunnerError::UnknownPlugin {
                kind: "binding",
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn measure(&self, def: &MeasureDefinition) -> Result<Arc<dyn QualityMeasure>> {
        let factory = self
            .measures
            .get(&def.kind)
            .ok_or_else(|| RunnerError::UnknownPlugin {
                kind: "measure kind",
                name: def.kind.clone(),
            })?;
        factory(def)
    }

    pub fn has_search_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn search_policy(
        &self,
        name: &str,
        params: &[ProgramParameter],
        settings: &OptimizationSettings,
    ) -> Result<Box<dyn SearchPolicy>> {
        let factory = self.policies.get(name).ok_or_else(|| RunnerError::UnknownPlugin {
            kind: "optimization method",
            name: name.to_string(),
        })?;
        factory(params, settings)
    }

    pub fn statistic(&self, id: &str) -> Result<Arc<dyn StatisticCalculator>> {
        self.statistics.get(id).cloned().ok_or_else(|| {
            RunnerError::UnknownPlugin {
                kind: "statistic",
                name: id.to_string(),
            }
            .into()
        })
    }

    pub fn run_statistic(&self, id: &str) -> Result<Arc<dyn RunStatistic>> {
        self.run_statistics.get(id).cloned().ok_or_else(|| {
            RunnerError::UnknownPlugin {
                kind: "run statistic",
                name: id.to_string(),
            }
            .into()
        })
    }

    pub fn check_format(&self, program: &ProgramConfig, data: &DataConfig) -> Result<()> {
        self.converter_for(program, data).map(|_| ())
    }

    fn converter_for(
        &self,
        program: &ProgramConfig,
        data: &DataConfig,
    ) -> Result<(String, Arc<dyn DatasetConverter>)> {
        if program.accepts_format(&data.format) {
            return Ok((data.format.clone(), Arc::new(IdentityConverter)));
        }
        for target in &program.compatible_formats {
            if let Some(conv) = self.converters.get(&(data.format.clone(), target.clone())) {
                return Ok((target.clone(), Arc::clone(conv)));
            }
        }
        Err(RunnerError::IncompatibleDataSetFormat {
            program: program.name.clone(),
            format: data.format.clone(),
        }
        .into())
    }

    pub fn prepare_input(
        &self,
        program: &ProgramConfig,
        data: &DataConfig,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let (target, converter) = self.converter_for(program, data)?;
        ensure_dir(dest_dir)?;
        converter.convert(&data.dataset, &target, dest_dir)
    }
}

pub struct ReportedMeasure {
    id: String,
    higher_is_better: bool,
}

impl ReportedMeasure {
    pub fn new(id: &str, higher_is_better: bool) -> Self {
        Self {
            id: id.to_string(),
            higher_is_better,
        }
    }
}

impl QualityMeasure for ReportedMeasure {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_better(&self, candidate: f64, current: f64) -> bool {
        if self.higher_is_better {
            candidate > current
        } else {
            candidate < current
        }
    }

    fn compute(&self, input: &QualityInput<'_>) -> Result<f64> {
        let text = fs::read_to_string(input.output)?;
        for line in text.lines() {
            let mut cols = line.splitn(2, '\t');
            if cols.next().map(str::trim) == Some(self.id.as_str()) {
                let raw = cols.next().unwrap_or("").trim();
                return raw
                    .parse::<f64>()
                    .map_err(|_| anyhow!("measure_not_numeric: {} reported {:?}", self.id, raw));
            }
        }
        Err(anyhow!(
            "measure_not_reported: {} missing from {}",
            self.id,
            input.output.display()
        ))
    }
}

pub struct IdentityConverter;

impl DatasetConverter for IdentityConverter {
    fn convert(&self, source: &Path, _target_format: &str, dest_dir: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("dataset path has no file name: {}", source.display()))?;
        let target = dest_dir.join(name);
        if !target.exists() {
            fs::copy(source, &target).map_err(|e| {
                anyhow!("failed to copy dataset {}: {}", source.display(), e)
            })?;
        }
        Ok(target)
    }
}

pub struct NumSamples;

impl StatisticCalculator for NumSamples {
    fn id(&self) -> &str {
        "num_samples"
    }

    fn compute(&self, _data: &DataConfig, dataset: &Path) -> Result<String> {
        let text = fs::read_to_string(dataset)?;
        let n = text
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .count();
        Ok(n.to_string())
    }
}

pub struct FileSize;

impl StatisticCalculator for FileSize {
    fn id(&self) -> &str {
        "file_size"
    }

    fn compute(&self, _data: &DataConfig, dataset: &Path) -> Result<String> {
        Ok(fs::metadata(dataset)?.len().to_string())
    }
}

pub struct PairCount;

impl RunStatistic for PairCount {
    fn id(&self) -> &str {
        "pair_count"
    }

    fn compute(&self, results: &[RunResult]) -> Result<String> {
        let n = results
            .iter()
            .filter(|r| matches!(r, RunResult::Pair(_)))
            .count();
        Ok(n.to_string())
    }
}

pub struct CompletedIterations;

impl RunStatistic for CompletedIterations {
    fn id(&self) -> &str {
        "completed_iterations"
    }

    fn compute(&self, results: &[RunResult]) -> Result<String> {
        let n: usize = results
            .iter()
            .map(|r| match r {
                RunResult::Pair(pair) => pair.file.completed_count(),
                RunResult::Analysis(_) => 0,
            })
            .sum();
        Ok(n.to_string())
    }
}
