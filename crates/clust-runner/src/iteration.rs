use crate::atomic_write_bytes;
use crate::config::{DataConfig, RunPair};
use crate::ensure_dir;
use crate::error::RunnerError;
use crate::locks::LockRegistry;
use crate::optimization::OptimizationMethod;
use crate::params::{ParameterSet, QualitySet, QualityValue};
use crate::registry::{QualityInput, QualityMeasure, Registry, RunStatistic, StatisticCalculator};
use crate::run::{read_run_results, RunResult};
use crate::scheduler::{ActiveIterations, Schedulable};
use crate::store::{ResultStore, RunLayout, RunLog};
use crate::task::{Canceller, Invocation, ProgramBinding, TaskOutcome};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IterationWrapper {
    pub iteration: u64,
    pub parameters: ParameterSet,
    pub effective: ParameterSet,
    pub internal: BTreeMap<String, String>,
    pub output: PathBuf,
    pub quality_output: PathBuf,
    pub log_file: PathBuf,
}

pub struct ExecutionContext {
    pub run_name: String,
    pub pair: RunPair,
    pub label: String,
    pub layout: RunLayout,
    pub run_log: Arc<RunLog>,
    pub registry: Arc<Registry>,
    pub locks: Arc<LockRegistry>,
    pub binding: Arc<dyn ProgramBinding>,
    pub measures: Vec<Arc<dyn QualityMeasure>>,
    pub store: ResultStore,
    pub fixed: ParameterSet,
    pub method: Option<Arc<Mutex<OptimizationMethod>>>,
    pub max_execution: Option<Duration>,
    pub progress: Arc<AtomicU32>,
    input: Mutex<Option<PathBuf>>,
    goldstandard: Mutex<Option<PathBuf>>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_name: &str,
        pair: RunPair,
        layout: RunLayout,
        run_log: Arc<RunLog>,
        registry: Arc<Registry>,
        locks: Arc<LockRegistry>,
        binding: Arc<dyn ProgramBinding>,
        measures: Vec<Arc<dyn QualityMeasure>>,
        fixed: ParameterSet,
        method: Option<Arc<Mutex<OptimizationMethod>>>,
    ) -> Self {
        let label = pair.label();
        let store = ResultStore::new(
            layout.complete_file(&label),
            pair.program.optimizable_parameter_names(),
            measures.iter().map(|m| m.id().to_string()).collect(),
            Arc::clone(&locks),
        );
        let max_execution = pair.program.max_execution_secs.map(Duration::from_secs);
        Self {
            run_name: run_name.to_string(),
            pair,
            label,
            layout,
            run_log,
            registry,
            locks,
            binding,
            measures,
            store,
            fixed,
            method,
            max_execution,
            progress: Arc::new(AtomicU32::new(0)),
            input: Mutex::new(None),
            goldstandard: Mutex::new(None),
        }
    }

    fn note(&self, message: &str) {
        if let Err(err) = self.run_log.append(message) {
            warn!(run = %self.run_name, error = %err, "failed to write run log");
        }
    }

    pub fn measure_ids(&self) -> Vec<String> {
        self.measures.iter().map(|m| m.id().to_string()).collect()
    }

    pub fn prepare_inputs(&self) -> Result<()> {
        let data = &self.pair.data;
        let input = {
            let _guard = self.locks.lock(&data.dataset);
            self.registry.prepare_input(
                &self.pair.program,
                data,
                &self.layout.inputs().join(&self.label),
            )?
        };
        *self.input.lock() = Some(input);
        if let Some(gs) = &data.goldstandard {
            let _guard = self.locks.lock(gs);
            let dest_dir = self.layout.goldstandards().join(&data.name);
            ensure_dir(&dest_dir)?;
            let name = gs
                .file_name()
                .ok_or_else(|| anyhow!("goldstandard path has no file name: {}", gs.display()))?;
            let dest = dest_dir.join(name);
            if !dest.exists() {
                fs::copy(gs, &dest)
                    .map_err(|e| anyhow!("failed to copy goldstandard {}: {}", gs.display(), e))?;
            }
            *self.goldstandard.lock() = Some(dest);
        }
        Ok(())
    }

    pub fn wrapper(&self, iteration: u64, candidate: &ParameterSet) -> Result<IterationWrapper> {
        let program = &self.pair.program;
        let mut effective = ParameterSet::new();
        for (name, value) in self.fixed.iter() {
            effective.insert(name, value);
        }
        for p in &program.parameters {
            let value = candidate
                .get(&p.name)
                .or_else(|| self.fixed.get(&p.name))
                .map(str::to_string)
                .or_else(|| p.default.clone());
            if let Some(value) = value {
                effective.insert(p.name.clone(), value);
            }
        }
        for (name, value) in candidate.iter() {
            effective.insert(name, value);
        }
        let parameters: ParameterSet = program
            .optimizable_parameter_names()
            .into_iter()
            .filter_map(|name| effective.get(&name).map(|v| (name.clone(), v.to_string())))
            .collect();

        let input = self
            .input
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("input for {} was not prepared", self.label))?;
        let output = self.layout.iteration_output(&self.label, iteration);
        let mut internal = BTreeMap::new();
        if let Some(exe) = &program.executable {
            internal.insert("e".to_string(), exe.clone());
        }
        internal.insert("i".to_string(), input.to_string_lossy().to_string());
        if let Some(gs) = self.goldstandard.lock().as_ref() {
            internal.insert("gs".to_string(), gs.to_string_lossy().to_string());
        }
        internal.insert("o".to_string(), output.to_string_lossy().to_string());

        Ok(IterationWrapper {
            iteration,
            parameters,
            effective,
            internal,
            quality_output: self.layout.iteration_qualities(&self.label, iteration),
            log_file: self.layout.iteration_log(&self.label, iteration),
            output,
        })
    }

    pub fn invocation(&self, w: &IterationWrapper) -> Result<Invocation> {
        let program = &self.pair.program;
        let template = match (&program.invocation_without_goldstandard, w.internal.get("gs")) {
            (Some(without), None) => without,
            _ => &program.invocation,
        };
        let text = substitute(template, &w.internal, &w.effective)?;
        Ok(Invocation {
            program: program.name.clone(),
            tokens: text.split_whitespace().map(str::to_string).collect(),
            parameters: w.effective.clone(),
            input: PathBuf::from(w.internal.get("i").cloned().unwrap_or_default()),
            goldstandard: w.internal.get("gs").map(PathBuf::from),
            output: w.output.clone(),
            log_file: w.log_file.clone(),
        })
    }

    pub fn assess(&self, w: &IterationWrapper) -> Result<QualitySet> {
        if !w.output.exists() {
            return Err(anyhow!(
                "result_missing: {} produced no output at {}",
                self.label,
                w.output.display()
            ));
        }
        let input = PathBuf::from(w.internal.get("i").cloned().unwrap_or_default());
        let gs = w.internal.get("gs").map(PathBuf::from);
        let quality_input = QualityInput {
            output: &w.output,
            goldstandard: gs.as_deref(),
            dataset: &input,
        };
        let mut qualities = QualitySet::new();
        for measure in &self.measures {
            match measure.compute(&quality_input) {
                Ok(value) => qualities.insert(measure.id(), QualityValue::Value(value)),
                Err(err) => {
                    warn!(
                        pair = %self.label,
                        iteration = w.iteration,
                        measure = measure.id(),
                        error = %err,
                        "quality measure failed"
                    );
                    qualities.insert(measure.id(), QualityValue::NotTerminated);
                }
            }
        }
        Ok(qualities)
    }

    pub fn record_qualities(&self, w: &IterationWrapper, qualities: QualitySet) -> Result<()> {
        self.write_iteration_qualities(w, &qualities)?;
        if let Some(method) = &self.method {
            let mut method = method.lock();
            method.give_quality_feedback(&w.parameters, qualities.clone())?;
            self.progress.store(method.progress(), Ordering::SeqCst);
        }
        self.store
            .append_completed(w.iteration, &w.parameters, &qualities)
    }

    pub fn record_not_terminated(&self, w: &IterationWrapper) -> Result<()> {
        let qualities = QualitySet::not_terminated(self.measure_ids().as_slice());
        self.write_iteration_qualities(w, &qualities)?;
        if let Some(method) = &self.method {
            let mut method = method.lock();
            method.give_feedback_not_terminated(&w.parameters, qualities.clone())?;
            self.progress.store(method.progress(), Ordering::SeqCst);
        }
        self.store
            .append_completed(w.iteration, &w.parameters, &qualities)
    }

    fn write_iteration_qualities(&self, w: &IterationWrapper, qualities: &QualitySet) -> Result<()> {
        let mut body = String::new();
        for (measure, value) in qualities.iter() {
            body.push_str(&format!("{}\t{}\n", measure, value));
        }
        atomic_write_bytes(&w.quality_output, body.as_bytes())
    }
}

pub fn substitute(
    template: &str,
    internal: &BTreeMap<String, String>,
    params: &ParameterSet,
) -> Result<String> {
    let mut text = template.to_string();
    for (name, value) in internal {
        text = text.replace(&format!("%{}%", name), value);
    }
    for (name, value) in params.iter() {
        text = text.replace(&format!("%{}%", name), value);
    }
    if let Some(missing) = first_placeholder(&text) {
        return Err(RunnerError::MissingParameterValue(missing).into());
    }
    Ok(text)
}

fn first_placeholder(text: &str) -> Option<String> {
    let mut rest = text;
    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        let end = after.find('%')?;
        let name = &after[..end];
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Some(name.to_string());
        }
        rest = after;
    }
    None
}

pub enum AnalysisTarget {
    Data(Arc<DataConfig>),
    Run { run_id: String, dir: PathBuf },
}

impl AnalysisTarget {
    pub fn name(&self) -> &str {
        match self {
            AnalysisTarget::Data(data) => &data.name,
            AnalysisTarget::Run { run_id, .. } => run_id,
        }
    }
}

#[derive(Clone)]
pub enum AnalysisStatistic {
    Data(Arc<dyn StatisticCalculator>),
    Run(Arc<dyn RunStatistic>),
}

impl AnalysisStatistic {
    pub fn id(&self) -> &str {
        match self {
            AnalysisStatistic::Data(s) => s.id(),
            AnalysisStatistic::Run(s) => s.id(),
        }
    }
}

pub struct AnalysisContext {
    pub run_name: String,
    pub target: AnalysisTarget,
    pub layout: RunLayout,
    pub run_log: Arc<RunLog>,
    pub locks: Arc<LockRegistry>,
    pub registry: Arc<Registry>,
    pub resume: bool,
    pub total: usize,
    pub progress: Arc<AtomicU32>,
    completed: AtomicU32,
    input: Mutex<Option<PathBuf>>,
    source_results: Mutex<Option<Arc<Vec<RunResult>>>>,
}

impl AnalysisContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_name: &str,
        target: AnalysisTarget,
        layout: RunLayout,
        run_log: Arc<RunLog>,
        locks: Arc<LockRegistry>,
        registry: Arc<Registry>,
        resume: bool,
        total: usize,
    ) -> Self {
        Self {
            run_name: run_name.to_string(),
            target,
            layout,
            run_log,
            locks,
            registry,
            resume,
            total,
            progress: Arc::new(AtomicU32::new(0)),
            completed: AtomicU32::new(0),
            input: Mutex::new(None),
            source_results: Mutex::new(None),
        }
    }

    pub fn prepare_input(&self) -> Result<()> {
        match &self.target {
            AnalysisTarget::Data(data) => {
                let dest_dir = self.layout.inputs().join(&data.name);
                ensure_dir(&dest_dir)?;
                let name = data.dataset.file_name().ok_or_else(|| {
                    anyhow!("dataset path has no file name: {}", data.dataset.display())
                })?;
                let dest = dest_dir.join(name);
                {
                    let _guard = self.locks.lock(&data.dataset);
                    if !dest.exists() {
                        fs::copy(&data.dataset, &dest).map_err(|e| {
                            anyhow!("failed to copy dataset {}: {}", data.dataset.display(), e)
                        })?;
                    }
                }
                *self.input.lock() = Some(dest);
            }
            AnalysisTarget::Run { run_id, dir } => {
                let results = read_run_results(&self.registry, dir)
                    .map_err(|e| anyhow!("failed to read results of run {}: {}", run_id, e))?;
                debug!(run = %run_id, results = results.len(), "analysed run loaded");
                *self.source_results.lock() = Some(Arc::new(results));
            }
        }
        Ok(())
    }

    pub fn output_for(&self, statistic: &str) -> PathBuf {
        self.layout.analysis_output(self.target.name(), statistic)
    }

    fn mark_completed(&self) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.total > 0 {
            let p = (done as u64 * 10_000 / self.total as u64).min(10_000) as u32;
            self.progress.store(p, Ordering::SeqCst);
        }
    }
}

pub enum IterationWork {
    Execution {
        ctx: Arc<ExecutionContext>,
        wrapper: IterationWrapper,
    },
    Statistic {
        ctx: Arc<AnalysisContext>,
        statistic: AnalysisStatistic,
        iteration: u64,
    },
}

pub struct IterationRunnable {
    label: String,
    work: IterationWork,
    terminated: Arc<AtomicBool>,
    active: Arc<ActiveIterations>,
    running: Mutex<Option<Canceller>>,
    stop_requested: AtomicBool,
    error: Mutex<Option<anyhow::Error>>,
}

impl IterationRunnable {
    pub fn new(
        work: IterationWork,
        terminated: Arc<AtomicBool>,
        active: Arc<ActiveIterations>,
    ) -> Self {
        let label = match &work {
            IterationWork::Execution { ctx, wrapper } => {
                format!("{}.{}", ctx.label, wrapper.iteration)
            }
            IterationWork::Statistic { ctx, statistic, .. } => {
                format!("{}.{}", ctx.target.name(), statistic.id())
            }
        };
        Self {
            label,
            work,
            terminated,
            active,
            running: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn iteration(&self) -> u64 {
        match &self.work {
            IterationWork::Execution { wrapper, .. } => wrapper.iteration,
            IterationWork::Statistic { iteration, .. } => *iteration,
        }
    }

    /// Errors are kept here rather than propagated so siblings are unaffected.
    pub fn run(&self) {
        let _registration = self.active.enter(self.label.clone());
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        let result = match &self.work {
            IterationWork::Execution { ctx, wrapper } => self.run_execution(ctx, wrapper),
            IterationWork::Statistic { ctx, statistic, .. } => self.run_statistic(ctx, statistic),
        };
        match result {
            Ok(()) => {}
            Err(err) if RunnerError::is_interrupted(&err) => {
                debug!(iteration = %self.label, "iteration interrupted");
            }
            Err(err) => {
                debug!(iteration = %self.label, error = %err, "iteration failed");
                *self.error.lock() = Some(err);
            }
        }
    }

    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().take()
    }

    fn run_execution(&self, ctx: &ExecutionContext, w: &IterationWrapper) -> Result<()> {
        let started = Instant::now();
        ctx.note(&format!("Starting iteration {} of {}", w.iteration, ctx.label));
        let invocation = match ctx.invocation(w) {
            Ok(inv) => inv,
            Err(err) => {
                ctx.record_not_terminated(w)?;
                return Err(err);
            }
        };
        debug!(iteration = %self.label, tokens = ?invocation.tokens, "invoking program");
        let mut task = match ctx.binding.start(&invocation) {
            Ok(task) => task,
            Err(err) => {
                warn!(iteration = %self.label, error = %err, "program failed to start");
                ctx.note(&format!(
                    "Iteration {} of {} failed to start: {}",
                    w.iteration, ctx.label, err
                ));
                return ctx.record_not_terminated(w);
            }
        };
        let canceller = task.canceller();
        *self.running.lock() = Some(canceller.clone());
        if self.stop_requested.load(Ordering::SeqCst) {
            canceller.cancel();
        }
        let waited = task.wait_timeout(ctx.max_execution);
        self.running.lock().take();
        match waited? {
            TaskOutcome::Cancelled => return Err(RunnerError::Interrupted.into()),
            TaskOutcome::TimedOut => {
                warn!(iteration = %self.label, "program exceeded its maximum execution time");
                ctx.note(&format!(
                    "Iteration {} of {} exceeded the maximum execution time and was killed",
                    w.iteration, ctx.label
                ));
                return ctx.record_not_terminated(w);
            }
            TaskOutcome::Exited(code) if code != Some(0) => {
                debug!(iteration = %self.label, ?code, "program exited unsuccessfully");
            }
            TaskOutcome::Exited(_) => {}
        }
        match ctx.assess(w) {
            Ok(qualities) => ctx.record_qualities(w, qualities)?,
            Err(err) => {
                warn!(iteration = %self.label, error = %err, "no usable result");
                ctx.note(&format!("Iteration {} of {}: {}", w.iteration, ctx.label, err));
                ctx.record_not_terminated(w)?;
            }
        }
        ctx.note(&format!(
            "Finished iteration {} of {} (Duration {})",
            w.iteration,
            ctx.label,
            format_duration(started.elapsed())
        ));
        Ok(())
    }

    fn run_statistic(&self, ctx: &AnalysisContext, statistic: &AnalysisStatistic) -> Result<()> {
        let output = ctx.output_for(statistic.id());
        let target = ctx.target.name();
        if ctx.resume && output.exists() {
            info!(analysed = %target, statistic = statistic.id(), "statistic already computed");
            ctx.mark_completed();
            return Ok(());
        }
        let value = match (statistic, &ctx.target) {
            (AnalysisStatistic::Data(calc), AnalysisTarget::Data(data)) => {
                let input = ctx
                    .input
                    .lock()
                    .clone()
                    .ok_or_else(|| anyhow!("input for {} was not prepared", target))?;
                calc.compute(data, &input)?
            }
            (AnalysisStatistic::Run(calc), AnalysisTarget::Run { .. }) => {
                let results = ctx
                    .source_results
                    .lock()
                    .clone()
                    .ok_or_else(|| anyhow!("results of {} were not loaded", target))?;
                calc.compute(&results)?
            }
            _ => {
                return Err(anyhow!(
                    "statistic {} does not apply to {}",
                    statistic.id(),
                    target
                ))
            }
        };
        atomic_write_bytes(&output, format!("{}\n", value).as_bytes())?;
        ctx.mark_completed();
        Ok(())
    }
}

impl Schedulable for IterationRunnable {
    fn execute(&self) {
        self.run();
    }

    fn force_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let canceller = self.running.lock().clone();
        if let Some(canceller) = canceller {
            canceller.cancel();
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

pub(crate) fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

pub(crate) fn read_statistic(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal() -> BTreeMap<String, String> {
        [("e", "/bin/km"), ("i", "/in/iris.tsv"), ("o", "/out/1.results")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitution_fills_internal_and_parameters() {
        let params: ParameterSet = [("k", "3"), ("init", "random")].into_iter().collect();
        let text = substitute("%e% -i %i% -o %o% -k %k% --init=%init%", &internal(), &params)
            .expect("substitute");
        assert_eq!(
            text,
            "/bin/km -i /in/iris.tsv -o /out/1.results -k 3 --init=random"
        );
    }

    #[test]
    fn leftover_placeholder_is_missing_value() {
        let err = substitute("%e% %gs% %k%", &internal(), &ParameterSet::new())
            .expect_err("gs has no value");
        match err.downcast_ref::<RunnerError>() {
            Some(RunnerError::MissingParameterValue(name)) => assert_eq!(name, "gs"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn literal_percent_signs_are_not_placeholders() {
        let text = substitute("%e% --ratio 50% of %o%", &internal(), &ParameterSet::new())
            .expect("substitute");
        assert_eq!(text, "/bin/km --ratio 50% of /out/1.results");
        assert_eq!(first_placeholder("100% sure %x y%"), None);
    }
}
