use crate::config::{
    DataConfig, OptimizationSettings, ProgramParameter, RunDefinition, RunMode, RunPair,
};
use crate::context::Context;
use crate::error::RunnerError;
use crate::events::Subscription;
use crate::iteration::{
    format_duration, read_statistic, AnalysisContext, AnalysisStatistic, AnalysisTarget,
    ExecutionContext,
};
use crate::optimization::{OptimizationMethod, OptimizationState, Optimum};
use crate::registry::{QualityMeasure, Registry};
use crate::runnable::{RunRunnable, TaskEnv};
use crate::scheduler::{TaskHandle, TaskStatus};
use crate::store::{ResultFile, RunLayout, RunLog};
use crate::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest};
use anyhow::{anyhow, Result};
use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use walkdir::WalkDir;

const RUN_ID_FORMAT: &str = "%m_%d_%Y-%H_%M_%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Inactive,
    Scheduled,
    Running,
    Finished,
    Terminated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Inactive => "inactive",
            RunStatus::Scheduled => "scheduled",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Terminated => "terminated",
        }
    }
}

pub(crate) struct StatusCell(Mutex<RunStatus>);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(RunStatus::Inactive))
    }

    pub(crate) fn get(&self) -> RunStatus {
        *self.0.lock()
    }

    pub(crate) fn advance(&self, to: RunStatus) -> Result<()> {
        let mut status = self.0.lock();
        if *status == to {
            return Ok(());
        }
        if *status == RunStatus::Terminated || to < *status {
            return Err(RunnerError::InvalidTransition {
                from: status.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into());
        }
        *status = to;
        Ok(())
    }

    pub(crate) fn mark_running(&self) -> Result<()> {
        self.advance(RunStatus::Running)
    }

    pub(crate) fn finish(&self) {
        let mut status = self.0.lock();
        if *status != RunStatus::Terminated {
            *status = RunStatus::Finished;
        }
    }

    pub(crate) fn terminate(&self) {
        *self.0.lock() = RunStatus::Terminated;
    }
}

#[derive(Debug, Clone)]
pub enum RunKind {
    Clustering {
        pairs: Vec<RunPair>,
    },
    ParameterOptimization {
        pairs: Vec<RunPair>,
        settings: OptimizationSettings,
    },
    DataAnalysis {
        data: Vec<Arc<DataConfig>>,
        statistics: Vec<String>,
    },
    RunAnalysis {
        run_ids: Vec<String>,
        statistics: Vec<String>,
    },
}

impl RunKind {
    pub fn from_definition(def: &RunDefinition, registry: &Registry) -> Result<Self> {
        match def.mode {
            RunMode::Clustering => {
                let pairs = def.pairs();
                check_pairs(&pairs, registry)?;
                Ok(RunKind::Clustering { pairs })
            }
            RunMode::ParameterOptimization => {
                let pairs = def.pairs();
                check_pairs(&pairs, registry)?;
                let settings = def.optimization_settings();
                for pair in &pairs {
                    let params = optimizable(pair);
                    if params.is_empty() {
                        return Err(RunnerError::Setup(format!(
                            "program {:?} declares no optimizable parameters",
                            pair.program.name
                        ))
                        .into());
                    }
                    registry.search_policy(&settings.method, &params, &settings)?;
                    let names: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
                    for candidate in &settings.candidates {
                        let keys: BTreeSet<&str> = candidate.iter().map(|(k, _)| k).collect();
                        if keys != names {
                            return Err(RunnerError::Setup(format!(
                                "candidate {} does not match the optimizable parameters of {:?}",
                                candidate, pair.program.name
                            ))
                            .into());
                        }
                    }
                }
                Ok(RunKind::ParameterOptimization { pairs, settings })
            }
            RunMode::DataAnalysis => {
                for id in &def.statistics {
                    registry.statistic(id)?;
                }
                Ok(RunKind::DataAnalysis {
                    data: def.data.iter().cloned().map(Arc::new).collect(),
                    statistics: def.statistics.clone(),
                })
            }
            RunMode::RunAnalysis => {
                for id in &def.statistics {
                    registry.run_statistic(id)?;
                }
                Ok(RunKind::RunAnalysis {
                    run_ids: def.runs.clone(),
                    statistics: def.statistics.clone(),
                })
            }
        }
    }

    pub fn number_of_tasks(&self) -> usize {
        match self {
            RunKind::Clustering { pairs } | RunKind::ParameterOptimization { pairs, .. } => {
                pairs.len()
            }
            RunKind::DataAnalysis { data, .. } => data.len(),
            RunKind::RunAnalysis { run_ids, .. } => run_ids.len(),
        }
    }

    pub fn upper_limit_progress(&self) -> u64 {
        self.number_of_tasks() as u64 * 10_000
    }

    pub fn task_label(&self, index: usize) -> Option<String> {
        match self {
            RunKind::Clustering { pairs } | RunKind::ParameterOptimization { pairs, .. } => {
                pairs.get(index).map(RunPair::label)
            }
            RunKind::DataAnalysis { data, .. } => data.get(index).map(|d| d.name.clone()),
            RunKind::RunAnalysis { run_ids, .. } => run_ids.get(index).cloned(),
        }
    }

    pub fn iterations_per_task(&self, index: usize, registry: &Registry) -> Result<usize> {
        match self {
            RunKind::Clustering { .. } => Ok(1),
            RunKind::ParameterOptimization { pairs, settings } => {
                let pair = pairs
                    .get(index)
                    .ok_or_else(|| anyhow!("no task with index {}", index))?;
                let policy =
                    registry.search_policy(&settings.method, &optimizable(pair), settings)?;
                Ok(policy.total_iterations())
            }
            RunKind::DataAnalysis { statistics, .. } | RunKind::RunAnalysis { statistics, .. } => {
                Ok(statistics.len())
            }
        }
    }

    pub(crate) fn create_task(
        &self,
        index: usize,
        env: &TaskEnv,
        def: &RunDefinition,
    ) -> Result<RunRunnable> {
        let registry = &env.ctx.registry;
        match self {
            RunKind::Clustering { pairs } => {
                let pair = pair_at(pairs, index)?;
                let ctx = execution_context(env, def, pair, None)?;
                Ok(RunRunnable::execution(index, env, ctx, None))
            }
            RunKind::ParameterOptimization { pairs, settings } => {
                let pair = pair_at(pairs, index)?;
                let policy =
                    registry.search_policy(&settings.method, &optimizable(&pair), settings)?;
                let method = Arc::new(Mutex::new(OptimizationMethod::new(
                    &settings.method,
                    policy,
                    env.measures.clone(),
                )));
                let ctx = execution_context(env, def, pair, Some(Arc::clone(&method)))?;
                Ok(RunRunnable::execution(index, env, ctx, Some(method)))
            }
            RunKind::DataAnalysis { data, statistics } => {
                let data = data
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow!("no task with index {}", index))?;
                let calculators = statistics
                    .iter()
                    .map(|id| registry.statistic(id).map(AnalysisStatistic::Data))
                    .collect::<Result<Vec<_>>>()?;
                Ok(analysis_task(index, env, AnalysisTarget::Data(data), calculators))
            }
            RunKind::RunAnalysis {
                run_ids,
                statistics,
            } => {
                let run_id = run_ids
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow!("no task with index {}", index))?;
                let calculators = statistics
                    .iter()
                    .map(|id| registry.run_statistic(id).map(AnalysisStatistic::Run))
                    .collect::<Result<Vec<_>>>()?;
                let target = AnalysisTarget::Run {
                    dir: env.ctx.result_root().join(&run_id),
                    run_id,
                };
                Ok(analysis_task(index, env, target, calculators))
            }
        }
    }
}

fn analysis_task(
    index: usize,
    env: &TaskEnv,
    target: AnalysisTarget,
    statistics: Vec<AnalysisStatistic>,
) -> RunRunnable {
    let ctx = AnalysisContext::new(
        &env.run_name,
        target,
        env.layout.clone(),
        Arc::clone(&env.run_log),
        Arc::clone(&env.ctx.locks),
        Arc::clone(&env.ctx.registry),
        env.resume,
        statistics.len(),
    );
    RunRunnable::analysis(index, env, ctx, statistics)
}

fn check_pairs(pairs: &[RunPair], registry: &Registry) -> Result<()> {
    for pair in pairs {
        registry.binding(&pair.program.binding)?;
        registry.check_format(&pair.program, &pair.data)?;
    }
    Ok(())
}

fn optimizable(pair: &RunPair) -> Vec<ProgramParameter> {
    pair.program
        .optimizable_parameters()
        .into_iter()
        .cloned()
        .collect()
}

fn pair_at(pairs: &[RunPair], index: usize) -> Result<RunPair> {
    pairs
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("no task with index {}", index))
}

fn execution_context(
    env: &TaskEnv,
    def: &RunDefinition,
    pair: RunPair,
    method: Option<Arc<Mutex<OptimizationMethod>>>,
) -> Result<ExecutionContext> {
    let binding = env.ctx.registry.binding(&pair.program.binding)?;
    let fixed = def.fixed_values(&pair.program.name);
    Ok(ExecutionContext::new(
        &env.run_name,
        pair,
        env.layout.clone(),
        Arc::clone(&env.run_log),
        Arc::clone(&env.ctx.registry),
        Arc::clone(&env.ctx.locks),
        binding,
        env.measures.clone(),
        fixed,
        method,
    ))
}

#[derive(Debug, Clone)]
pub struct PairResult {
    pub program: String,
    pub data: String,
    pub file: ResultFile,
    pub optima: OptimizationState,
    pub criterion: Option<String>,
    pub resumed: bool,
}

impl PairResult {
    pub fn optimum(&self, measure: &str) -> Option<&Optimum> {
        self.optima.get(measure)
    }

    pub fn criterion_optimum(&self) -> Option<&Optimum> {
        self.criterion.as_deref().and_then(|c| self.optimum(c))
    }

    pub fn ranked_optima(&self) -> Vec<(&str, &Optimum)> {
        let mut ranked: Vec<(&str, &Optimum)> = self.optima.iter().collect();
        ranked.sort_by_key(|(id, _)| Some(*id) != self.criterion.as_deref());
        ranked
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub target: String,
    pub statistics: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum RunResult {
    Pair(PairResult),
    Analysis(AnalysisResult),
}

pub struct Run {
    ctx: Context,
    definition: Arc<RunDefinition>,
    kind: RunKind,
    measures: Vec<Arc<dyn QualityMeasure>>,
    status: Arc<StatusCell>,
    run_id: Mutex<Option<String>>,
    layout: Mutex<Option<RunLayout>>,
    run_log: Mutex<Option<Arc<RunLog>>>,
    terminated: AtomicBool,
    paused: AtomicBool,
    tasks: Mutex<Vec<(Arc<RunRunnable>, TaskHandle)>>,
    results: Arc<Mutex<Vec<RunResult>>>,
    frozen_progress: Mutex<Option<f64>>,
    stale: Arc<Mutex<BTreeSet<String>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Run {
    pub fn new(ctx: Context, definition: RunDefinition) -> Result<Self> {
        definition.validate()?;
        let measures = definition
            .measures
            .iter()
            .map(|m| ctx.registry.measure(m))
            .collect::<Result<Vec<_>>>()?;
        let kind = RunKind::from_definition(&definition, &ctx.registry)?;
        Ok(Self {
            ctx,
            definition: Arc::new(definition),
            kind,
            measures,
            status: Arc::new(StatusCell::new()),
            run_id: Mutex::new(None),
            layout: Mutex::new(None),
            run_log: Mutex::new(None),
            terminated: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            results: Arc::new(Mutex::new(Vec::new())),
            frozen_progress: Mutex::new(None),
            stale: Arc::new(Mutex::new(BTreeSet::new())),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn from_result_folder(ctx: Context, run_id: &str) -> Result<Self> {
        let layout = RunLayout::new(ctx.result_root(), run_id);
        let snapshot = find_snapshot(&layout.configs())?;
        let raw = fs::read_to_string(&snapshot)
            .map_err(|e| anyhow!("failed to read snapshot {}: {}", snapshot.display(), e))?;
        let definition = RunDefinition::from_yaml(&raw)?;
        Self::new(ctx, definition)
    }

    pub fn definition(&self) -> &RunDefinition {
        &self.definition
    }

    pub fn kind(&self) -> &RunKind {
        &self.kind
    }

    pub fn status(&self) -> RunStatus {
        self.status.get()
    }

    pub fn run_id(&self) -> Option<String> {
        self.run_id.lock().clone()
    }

    pub fn layout(&self) -> Option<RunLayout> {
        self.layout.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn perform(&self) -> Result<()> {
        self.execute(None)
    }

    pub fn resume(&self, run_id: &str) -> Result<()> {
        self.execute(Some(run_id))
    }

    fn execute(&self, resume: Option<&str>) -> Result<()> {
        if self.is_terminated() {
            return Ok(());
        }
        let status = self.status();
        if status != RunStatus::Inactive {
            return Err(RunnerError::InvalidTransition {
                from: status.as_str().to_string(),
                to: RunStatus::Scheduled.as_str().to_string(),
            }
            .into());
        }
        let started = Instant::now();
        let env = match self.before_perform(resume) {
            Ok(env) => env,
            Err(_) if self.is_terminated() => return Ok(()),
            Err(err) => return Err(err),
        };
        let outcome = self.do_perform(&env);
        if outcome.is_err() {
            self.terminate();
        }
        self.wait_for_all();
        self.after_perform(started, &env);
        outcome
    }

    fn before_perform(&self, resume: Option<&str>) -> Result<TaskEnv> {
        self.check_inputs()?;
        let root = self.ctx.result_root();
        let run_id = match resume {
            Some(id) => {
                if !root.join(id).is_dir() {
                    return Err(RunnerError::Setup(format!(
                        "result folder {} does not exist",
                        root.join(id).display()
                    ))
                    .into());
                }
                id.to_string()
            }
            None => unique_run_id(root, &self.definition.name),
        };
        let layout = RunLayout::new(root, &run_id);
        layout.create_all()?;
        if resume.is_none() {
            self.write_snapshot(&layout)?;
        }
        let run_log = Arc::new(RunLog::new(layout.run_log()));
        run_log.append(&format!(
            "{} run {}",
            if resume.is_some() { "Resuming" } else { "Starting" },
            run_id
        ))?;
        info!(
            run = %run_id,
            mode = self.definition.mode.as_str(),
            tasks = self.kind.number_of_tasks(),
            resume = resume.is_some(),
            "run scheduled"
        );
        self.subscribe(&run_id);
        self.status.advance(RunStatus::Scheduled)?;
        *self.run_id.lock() = Some(run_id);
        *self.layout.lock() = Some(layout.clone());
        *self.run_log.lock() = Some(Arc::clone(&run_log));
        Ok(TaskEnv {
            run_name: self.definition.name.clone(),
            layout,
            run_log,
            ctx: self.ctx.clone(),
            resume: resume.is_some(),
            status: Arc::clone(&self.status),
            results: Arc::clone(&self.results),
            measures: self.measures.clone(),
            criterion: self.definition.criterion().map(str::to_string),
        })
    }

    fn check_inputs(&self) -> Result<()> {
        if let RunKind::RunAnalysis { run_ids, .. } = &self.kind {
            for run_id in run_ids {
                let dir = self.ctx.result_root().join(run_id);
                if !dir.join("configs").is_dir() {
                    return Err(RunnerError::Setup(format!(
                        "analysed run {} has no result folder at {}",
                        run_id,
                        dir.display()
                    ))
                    .into());
                }
            }
        }
        for data in &self.definition.data {
            if !data.dataset.is_file() {
                return Err(RunnerError::Setup(format!(
                    "dataset {} of {:?} does not exist",
                    data.dataset.display(),
                    data.name
                ))
                .into());
            }
            if let Some(gs) = &data.goldstandard {
                if !gs.is_file() {
                    return Err(RunnerError::Setup(format!(
                        "goldstandard {} of {:?} does not exist",
                        gs.display(),
                        data.name
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn write_snapshot(&self, layout: &RunLayout) -> Result<()> {
        let yaml = serde_yaml::to_string(&*self.definition)?;
        atomic_write_bytes(
            &layout
                .configs()
                .join(format!("{}.run.yaml", self.definition.name)),
            yaml.as_bytes(),
        )?;
        let digest = canonical_json_digest(&serde_json::to_value(&*self.definition)?);
        let manifest = json!({
            "schema_version": "run_manifest_v1",
            "run_id": layout.run_id,
            "run_name": self.definition.name,
            "mode": self.definition.mode.as_str(),
            "created_at": Utc::now().to_rfc3339(),
            "definition_digest": digest,
            "tasks": self.kind.number_of_tasks(),
        });
        atomic_write_json_pretty(&layout.configs().join("manifest.json"), &manifest)
    }

    fn subscribe(&self, run_id: &str) {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.clear();
        for config_id in self.definition.config_ids() {
            let stale = Arc::clone(&self.stale);
            let run = run_id.to_string();
            subscriptions.push(self.ctx.events.subscribe(&config_id, move |event| {
                warn!(
                    run = %run,
                    config = event.config_id(),
                    "configuration changed while the run is active, keeping the snapshot"
                );
                stale.lock().insert(event.config_id().to_string());
            }));
        }
    }

    fn do_perform(&self, env: &TaskEnv) -> Result<()> {
        let mut tasks = self.tasks.lock();
        for index in 0..self.kind.number_of_tasks() {
            if self.is_terminated() {
                return Ok(());
            }
            let task = Arc::new(self.kind.create_task(index, env, &self.definition)?);
            if self.paused.load(Ordering::SeqCst) {
                task.pause();
            }
            let handle = self.ctx.scheduler.register_run_runnable(Arc::clone(&task))?;
            tasks.push((task, handle));
        }
        Ok(())
    }

    /// Blocks until every submitted task resolved. Failures are logged here
    /// and never abort collection of the other tasks.
    fn wait_for_all(&self) {
        let tasks: Vec<(Arc<RunRunnable>, TaskHandle)> = self.tasks.lock().clone();
        for (task, handle) in &tasks {
            match handle.wait() {
                TaskStatus::Completed => {}
                TaskStatus::Cancelled => {
                    info!(task = task.label(), "task cancelled");
                }
                TaskStatus::Panicked(message) => {
                    error!(task = task.label(), panic = %message, "task panicked");
                    self.note(&format!("Task {} panicked: {}", task.label(), message));
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
    }

    fn after_perform(&self, started: Instant, env: &TaskEnv) {
        let terminated = self.is_terminated();
        let duration = format_duration(started.elapsed());
        self.status.finish();
        self.note(&format!(
            "{} run {} (Duration {})",
            if terminated { "Terminated" } else { "Finished" },
            env.layout.run_id,
            duration
        ));
        info!(
            run = %env.layout.run_id,
            status = self.status().as_str(),
            duration = %duration,
            "run done"
        );
        self.subscriptions.lock().clear();
    }

    fn note(&self, message: &str) {
        let log = self.run_log.lock().clone();
        if let Some(log) = log {
            if let Err(err) = log.append(message) {
                warn!(error = %err, "failed to write run log");
            }
        }
    }

    /// Idempotent. Returns once every task was told to stop, without waiting
    /// for them.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.frozen_progress.lock() = Some(self.live_progress());
        self.status.terminate();
        let tasks = self.tasks.lock();
        for (task, handle) in tasks.iter() {
            task.terminate();
            self.ctx.scheduler.cancel(handle);
        }
        info!(run = ?self.run_id(), "run terminated");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        for (task, _) in self.tasks.lock().iter() {
            task.pause();
        }
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        for (task, _) in self.tasks.lock().iter() {
            task.unpause();
        }
    }

    pub fn percent_finished(&self) -> f64 {
        match self.status() {
            RunStatus::Inactive => 0.0,
            RunStatus::Finished => 100.0,
            RunStatus::Terminated => self.frozen_progress.lock().unwrap_or(0.0),
            RunStatus::Scheduled | RunStatus::Running => self.live_progress(),
        }
    }

    fn live_progress(&self) -> f64 {
        let upper = self.kind.upper_limit_progress();
        if upper == 0 {
            return 0.0;
        }
        let done: u64 = self
            .tasks
            .lock()
            .iter()
            .map(|(task, _)| task.progress() as u64)
            .sum();
        done.min(upper) as f64 * 100.0 / upper as f64
    }

    pub fn results(&self) -> Vec<RunResult> {
        self.results.lock().clone()
    }

    pub fn stale_configs(&self) -> Vec<String> {
        self.stale.lock().iter().cloned().collect()
    }

    pub fn task_errors(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .flat_map(|(task, _)| task.error_messages())
            .collect()
    }
}

pub fn read_run_results(registry: &Registry, run_dir: &Path) -> Result<Vec<RunResult>> {
    let snapshot = find_snapshot(&run_dir.join("configs"))?;
    let raw = fs::read_to_string(&snapshot)
        .map_err(|e| anyhow!("failed to read snapshot {}: {}", snapshot.display(), e))?;
    let definition = RunDefinition::from_yaml(&raw)?;
    let run_id = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("result folder {} has no name", run_dir.display()))?;
    let root = run_dir.parent().unwrap_or(Path::new("."));
    let layout = RunLayout::new(root, &run_id);

    let mut out = Vec::new();
    let targets: Vec<String> = match definition.mode {
        RunMode::DataAnalysis => definition.data.iter().map(|d| d.name.clone()).collect(),
        RunMode::RunAnalysis => definition.runs.clone(),
        RunMode::Clustering | RunMode::ParameterOptimization => Vec::new(),
    };
    if !targets.is_empty() {
        for target in targets {
            let statistics: BTreeMap<String, String> = definition
                .statistics
                .iter()
                .filter_map(|id| {
                    read_statistic(&layout.analysis_output(&target, id)).map(|v| (id.clone(), v))
                })
                .collect();
            out.push(RunResult::Analysis(AnalysisResult { target, statistics }));
        }
        return Ok(out);
    }
    let measures = definition
        .measures
        .iter()
        .map(|m| registry.measure(m))
        .collect::<Result<Vec<_>>>()?;
    for pair in definition.pairs() {
        let path = layout.complete_file(&pair.label());
        if !path.is_file() {
            continue;
        }
        let file = ResultFile::parse(&path)?;
        let optima = OptimizationState::from_file(&file, &measures);
        out.push(RunResult::Pair(PairResult {
            program: pair.program.name.clone(),
            data: pair.data.name.clone(),
            file,
            optima,
            criterion: definition.criterion().map(str::to_string),
            resumed: false,
        }));
    }
    Ok(out)
}

fn unique_run_id(root: &Path, name: &str) -> String {
    let base = format!("{}_{}", Local::now().format(RUN_ID_FORMAT), name);
    if !root.join(&base).exists() {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !root.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

fn find_snapshot(configs: &Path) -> Result<std::path::PathBuf> {
    if !configs.is_dir() {
        return Err(RunnerError::Setup(format!(
            "no configuration snapshot in {}",
            configs.display()
        ))
        .into());
    }
    for entry in WalkDir::new(configs).max_depth(1) {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && name.ends_with(".run.yaml") {
            return Ok(entry.path().to_path_buf());
        }
    }
    Err(RunnerError::Setup(format!(
        "no *.run.yaml snapshot in {}",
        configs.display()
    ))
    .into())
}
