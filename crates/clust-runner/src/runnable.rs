use crate::context::Context;
use crate::error::RunnerError;
use crate::iteration::{
    format_duration, read_statistic, AnalysisContext, AnalysisStatistic, ExecutionContext,
    IterationRunnable, IterationWork,
};
use crate::optimization::{NextIteration, OptimizationMethod, OptimizationState};
use crate::params::ParameterSet;
use crate::registry::QualityMeasure;
use crate::run::{AnalysisResult, PairResult, RunResult, StatusCell};
use crate::scheduler::{Schedulable, Scheduler, TaskHandle, TaskStatus};
use crate::store::{RunLayout, RunLog};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) struct TaskEnv {
    pub run_name: String,
    pub layout: RunLayout,
    pub run_log: Arc<RunLog>,
    pub ctx: Context,
    pub resume: bool,
    pub status: Arc<StatusCell>,
    pub results: Arc<Mutex<Vec<RunResult>>>,
    pub measures: Vec<Arc<dyn QualityMeasure>>,
    pub criterion: Option<String>,
}

enum TaskKind {
    Execution(Arc<ExecutionContext>),
    Analysis(Arc<AnalysisContext>),
}

enum IterationSource {
    Single {
        consumed: bool,
    },
    Optimization {
        method: Arc<Mutex<OptimizationMethod>>,
        exhausted: bool,
    },
    Statistics {
        pending: VecDeque<AnalysisStatistic>,
        next: u64,
    },
}

pub struct RunRunnable {
    index: usize,
    label: String,
    kind: TaskKind,
    source: Mutex<IterationSource>,
    statistics: Vec<AnalysisStatistic>,
    criterion: Option<String>,
    scheduler: Arc<Scheduler>,
    status: Arc<StatusCell>,
    results: Arc<Mutex<Vec<RunResult>>>,
    run_log: Arc<RunLog>,
    resume: bool,
    pause_poll: Duration,
    terminated: Arc<AtomicBool>,
    paused: AtomicBool,
    skipped: AtomicBool,
    submitted: Mutex<Vec<(TaskHandle, Arc<IterationRunnable>)>>,
    errors: Mutex<Vec<String>>,
}

impl RunRunnable {
    pub(crate) fn execution(
        index: usize,
        env: &TaskEnv,
        ctx: ExecutionContext,
        method: Option<Arc<Mutex<OptimizationMethod>>>,
    ) -> Self {
        let label = ctx.label.clone();
        let source = match method {
            Some(method) => IterationSource::Optimization {
                method,
                exhausted: false,
            },
            None => IterationSource::Single { consumed: false },
        };
        Self::build(
            index,
            label,
            TaskKind::Execution(Arc::new(ctx)),
            source,
            Vec::new(),
            env,
        )
    }

    pub(crate) fn analysis(
        index: usize,
        env: &TaskEnv,
        ctx: AnalysisContext,
        statistics: Vec<AnalysisStatistic>,
    ) -> Self {
        let label = ctx.target.name().to_string();
        let source = IterationSource::Statistics {
            pending: statistics.iter().cloned().collect(),
            next: 1,
        };
        Self::build(
            index,
            label,
            TaskKind::Analysis(Arc::new(ctx)),
            source,
            statistics,
            env,
        )
    }

    fn build(
        index: usize,
        label: String,
        kind: TaskKind,
        source: IterationSource,
        statistics: Vec<AnalysisStatistic>,
        env: &TaskEnv,
    ) -> Self {
        Self {
            index,
            label,
            kind,
            source: Mutex::new(source),
            statistics,
            criterion: env.criterion.clone(),
            scheduler: Arc::clone(&env.ctx.scheduler),
            status: Arc::clone(&env.status),
            results: Arc::clone(&env.results),
            run_log: Arc::clone(&env.run_log),
            resume: env.resume,
            pause_poll: env.ctx.pause_poll(),
            terminated: Arc::new(AtomicBool::new(false)),
            paused: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn progress(&self) -> u32 {
        self.progress_cell().load(Ordering::SeqCst)
    }

    fn progress_cell(&self) -> &AtomicU32 {
        match &self.kind {
            TaskKind::Execution(ctx) => ctx.progress.as_ref(),
            TaskKind::Analysis(ctx) => ctx.progress.as_ref(),
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let submitted = self.submitted.lock();
        for (handle, _) in submitted.iter() {
            self.scheduler.cancel(handle);
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn submitted_iterations(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn run(&self) {
        if self.is_terminated() {
            return;
        }
        if let Err(err) = self.status.mark_running() {
            debug!(task = %self.label, error = %err, "run status not advanced");
        }
        let started = Instant::now();
        self.note(&format!("Starting task {}", self.label));
        info!(task = %self.label, resume = self.resume, "task started");

        let outcome = match self.before_run() {
            Ok(true) => self.do_run(),
            Ok(false) => {
                self.skipped.store(true, Ordering::SeqCst);
                info!(task = %self.label, "result already complete, skipping execution");
                self.note(&format!(
                    "Task {} already has a complete result, skipping",
                    self.label
                ));
                Ok(())
            }
            Err(err) => Err(err),
        };
        let mut errors = Vec::new();
        match outcome {
            Ok(()) => {}
            Err(err) if RunnerError::is_interrupted(&err) => {
                info!(task = %self.label, "task interrupted");
            }
            Err(err) => errors.push(err),
        }
        self.after_run(started, errors);
    }

    fn before_run(&self) -> Result<bool> {
        match &self.kind {
            TaskKind::Execution(ctx) => {
                ctx.store.prepare(self.resume)?;
                let existing = if self.resume {
                    Some(ctx.store.read()?)
                } else {
                    None
                };
                let mut source = self.source.lock();
                match &mut *source {
                    IterationSource::Single { .. } => {
                        if existing.as_ref().is_some_and(|f| !f.records.is_empty()) {
                            ctx.progress.store(10_000, Ordering::SeqCst);
                            return Ok(false);
                        }
                    }
                    IterationSource::Optimization { method, exhausted } => {
                        let mut method = method.lock();
                        method.reset(existing.as_ref())?;
                        *exhausted = false;
                        ctx.progress.store(method.progress(), Ordering::SeqCst);
                        if existing.is_some() && !method.has_next() {
                            return Ok(false);
                        }
                    }
                    IterationSource::Statistics { .. } => {}
                }
                drop(source);
                ctx.prepare_inputs()?;
                Ok(true)
            }
            TaskKind::Analysis(ctx) => {
                if self.resume
                    && self
                        .statistics
                        .iter()
                        .all(|s| ctx.output_for(s.id()).exists())
                {
                    ctx.progress.store(10_000, Ordering::SeqCst);
                    return Ok(false);
                }
                ctx.prepare_input()?;
                Ok(true)
            }
        }
    }

    fn do_run(&self) -> Result<()> {
        loop {
            self.wait_while_paused();
            if self.is_terminated() {
                return Err(RunnerError::Interrupted.into());
            }
            if !self.has_next_iteration() {
                return Ok(());
            }
            if let Some(work) = self.consume_next_iteration()? {
                let iteration = Arc::new(IterationRunnable::new(
                    work,
                    Arc::clone(&self.terminated),
                    self.scheduler.active_iterations(),
                ));
                self.submit(iteration)?;
            }
        }
    }

    fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_terminated() {
            std::thread::sleep(self.pause_poll);
        }
    }

    fn has_next_iteration(&self) -> bool {
        match &*self.source.lock() {
            IterationSource::Single { consumed } => !consumed,
            IterationSource::Optimization { method, exhausted } => {
                !exhausted && method.lock().has_next()
            }
            IterationSource::Statistics { pending, .. } => !pending.is_empty(),
        }
    }

    // None when the iteration needs no work of its own.
    fn consume_next_iteration(&self) -> Result<Option<IterationWork>> {
        let mut source = self.source.lock();
        match (&mut *source, &self.kind) {
            (IterationSource::Single { consumed }, TaskKind::Execution(ctx)) => {
                *consumed = true;
                let wrapper = ctx.wrapper(1, &ParameterSet::new())?;
                Ok(Some(IterationWork::Execution {
                    ctx: Arc::clone(ctx),
                    wrapper,
                }))
            }
            (IterationSource::Optimization { method, exhausted }, TaskKind::Execution(ctx)) => {
                let mut guard = method.lock();
                let next = match guard.next() {
                    Ok(next) => next,
                    Err(err) => {
                        if let Some(RunnerError::NoParameterSetFound(reason)) =
                            err.downcast_ref::<RunnerError>()
                        {
                            warn!(task = %self.label, reason = %reason, "search ended early");
                            self.note(&format!("Task {}: {}", self.label, err));
                            *exhausted = true;
                            return Ok(None);
                        }
                        return Err(err);
                    }
                };
                match next {
                    NextIteration::Evaluate {
                        iteration,
                        parameters,
                    } => {
                        drop(guard);
                        let wrapper = ctx.wrapper(iteration, &parameters)?;
                        Ok(Some(IterationWork::Execution {
                            ctx: Arc::clone(ctx),
                            wrapper,
                        }))
                    }
                    NextIteration::AlreadyEvaluated {
                        iteration,
                        previous,
                        parameters,
                    } => {
                        debug!(
                            task = %self.label,
                            iteration,
                            previous,
                            parameters = %parameters,
                            "parameter set already evaluated"
                        );
                        ctx.store.append_duplicate(iteration, previous)?;
                        ctx.progress.store(guard.progress(), Ordering::SeqCst);
                        Ok(None)
                    }
                }
            }
            (IterationSource::Statistics { pending, next }, TaskKind::Analysis(ctx)) => {
                let Some(statistic) = pending.pop_front() else {
                    return Ok(None);
                };
                let iteration = *next;
                *next += 1;
                Ok(Some(IterationWork::Statistic {
                    ctx: Arc::clone(ctx),
                    statistic,
                    iteration,
                }))
            }
            _ => Err(anyhow!(
                "task {} has an iteration source that does not match its kind",
                self.label
            )),
        }
    }

    fn submit(&self, iteration: Arc<IterationRunnable>) -> Result<()> {
        let mut submitted = self.submitted.lock();
        if self.is_terminated() {
            return Err(RunnerError::Interrupted.into());
        }
        let handle = self
            .scheduler
            .register_iteration_runnable(Arc::clone(&iteration))?;
        debug!(task = %self.label, iteration = iteration.iteration(), "iteration submitted");
        submitted.push((handle, iteration));
        Ok(())
    }

    fn after_run(&self, started: Instant, mut errors: Vec<anyhow::Error>) {
        let submitted: Vec<(TaskHandle, Arc<IterationRunnable>)> = self.submitted.lock().clone();
        for (handle, iteration) in &submitted {
            match handle.wait() {
                TaskStatus::Cancelled => iteration.force_stop(),
                TaskStatus::Panicked(message) => errors.push(anyhow!(
                    "iteration_panicked: {} panicked: {}",
                    iteration.label(),
                    message
                )),
                _ => {}
            }
            if let Some(err) = iteration.take_error() {
                errors.push(err);
            }
        }

        if !self.is_terminated() {
            if let Err(err) = self.collect_result() {
                errors.push(err);
            }
            self.progress_cell().store(10_000, Ordering::SeqCst);
        }
        self.report(&errors);

        self.note(&format!(
            "Finished task {} (Duration {})",
            self.label,
            format_duration(started.elapsed())
        ));
        info!(
            task = %self.label,
            errors = errors.len(),
            iterations = submitted.len(),
            "task finished"
        );
    }

    fn report(&self, errors: &[anyhow::Error]) {
        if errors.is_empty() {
            return;
        }
        let mut messages = self.errors.lock();
        for err in errors {
            warn!(task = %self.label, error = %err, "task error");
            let text = error_text(&self.label, err);
            self.note(&text);
            messages.push(text);
        }
    }

    fn collect_result(&self) -> Result<()> {
        let result = match &self.kind {
            TaskKind::Execution(ctx) => {
                let file = ctx.store.read()?;
                let optima = OptimizationState::from_file(&file, &ctx.measures);
                RunResult::Pair(PairResult {
                    program: ctx.pair.program.name.clone(),
                    data: ctx.pair.data.name.clone(),
                    file,
                    optima,
                    criterion: self.criterion.clone(),
                    resumed: self.was_skipped(),
                })
            }
            TaskKind::Analysis(ctx) => {
                let statistics: BTreeMap<String, String> = self
                    .statistics
                    .iter()
                    .filter_map(|s| {
                        read_statistic(&ctx.output_for(s.id())).map(|v| (s.id().to_string(), v))
                    })
                    .collect();
                RunResult::Analysis(AnalysisResult {
                    target: ctx.target.name().to_string(),
                    statistics,
                })
            }
        };
        self.results.lock().push(result);
        Ok(())
    }

    fn note(&self, message: &str) {
        if let Err(err) = self.run_log.append(message) {
            warn!(task = %self.label, error = %err, "failed to write run log");
        }
    }
}

fn error_text(label: &str, err: &anyhow::Error) -> String {
    let mut text = format!("Exception in task {}: {}", label, err);
    for cause in err.chain().skip(1) {
        text.push_str(&format!("\n|--> {}", cause));
    }
    text
}

impl Schedulable for RunRunnable {
    fn execute(&self) {
        self.run();
    }

    fn force_stop(&self) {
        self.terminate();
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}
