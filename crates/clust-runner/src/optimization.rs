use crate::config::{ParameterKind, ProgramParameter};
use crate::error::RunnerError;
use crate::params::{ParameterSet, QualitySet, QualityValue};
use crate::registry::QualityMeasure;
use crate::store::{IterationRecord, ResultFile};
use anyhow::{anyhow, Result};
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Candidate source. Must be deterministic from its construction arguments
/// so that replay after [`SearchPolicy::reset`] sees the same sequence.
pub trait SearchPolicy: Send {
    fn has_next(&self) -> bool;

    fn next_candidate(&mut self) -> Result<ParameterSet>;

    fn total_iterations(&self) -> usize;

    fn reset(&mut self);
}

fn exhausted(policy: &str) -> anyhow::Error {
    RunnerError::NoParameterSetFound(format!("{} search has no candidates left", policy)).into()
}

#[derive(Debug, Clone)]
pub struct GridSearch {
    names: Vec<String>,
    values: Vec<Vec<String>>,
    positions: Vec<usize>,
    done: bool,
}

impl GridSearch {
    pub fn new(params: &[ProgramParameter], budget: usize) -> Result<Self> {
        let mut remaining = budget.max(1) as f64;
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (i, p) in params.iter().enumerate() {
            let left = (params.len() - i) as f64;
            let n = if p.options.is_empty() {
                (remaining.powf(1.0 / left).floor() as usize).max(1)
            } else {
                p.options.len()
            };
            remaining = (remaining / n as f64).max(1.0);
            names.push(p.name.clone());
            values.push(grid_values(p, n)?);
        }
        let done = values.iter().any(|v| v.is_empty());
        Ok(Self {
            positions: vec![0; names.len()],
            names,
            values,
            done,
        })
    }

    pub fn values(&self) -> &[Vec<String>] {
        &self.values
    }
}

fn grid_values(p: &ProgramParameter, n: usize) -> Result<Vec<String>> {
    if !p.options.is_empty() {
        return Ok(p.options.clone());
    }
    let (min, max) = bounds(p)?;
    let point = |j: usize| {
        if n == 1 {
            min
        } else {
            min + (max - min) * j as f64 / (n - 1) as f64
        }
    };
    match p.kind {
        ParameterKind::Float => Ok((0..n).map(|j| point(j).to_string()).collect()),
        ParameterKind::Integer => {
            let mut out: Vec<String> = Vec::new();
            for j in 0..n {
                let v = (point(j).round() as i64).to_string();
                if !out.contains(&v) {
                    out.push(v);
                }
            }
            Ok(out)
        }
        ParameterKind::String => string_needs_options(p),
    }
}

fn bounds(p: &ProgramParameter) -> Result<(f64, f64)> {
    if p.kind == ParameterKind::String {
        return string_needs_options(p);
    }
    match (p.min, p.max) {
        (Some(min), Some(max)) if min <= max => Ok((min, max)),
        (Some(_), Some(_)) => Err(anyhow!("parameter {}: min exceeds max", p.name)),
        _ => Err(anyhow!(
            "parameter {}: optimizable numeric parameters need min and max",
            p.name
        )),
    }
}

fn string_needs_options<T>(p: &ProgramParameter) -> Result<T> {
    Err(anyhow!(
        "parameter {}: optimizable string parameters need options",
        p.name
    ))
}

impl SearchPolicy for GridSearch {
    fn has_next(&self) -> bool {
        !self.done
    }

    fn next_candidate(&mut self) -> Result<ParameterSet> {
        if self.done {
            return Err(exhausted("grid"));
        }
        let candidate: ParameterSet = self
            .names
            .iter()
            .zip(&self.positions)
            .zip(&self.values)
            .map(|((name, &pos), vals)| (name.clone(), vals[pos].clone()))
            .collect();
        let mut i = self.positions.len();
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            self.positions[i] += 1;
            if self.positions[i] < self.values[i].len() {
                break;
            }
            self.positions[i] = 0;
        }
        Ok(candidate)
    }

    fn total_iterations(&self) -> usize {
        self.values.iter().map(Vec::len).product()
    }

    fn reset(&mut self) {
        self.positions.iter_mut().for_each(|p| *p = 0);
        self.done = self.values.iter().any(|v| v.is_empty());
    }
}

#[derive(Debug, Clone)]
pub struct RandomSearch {
    params: Vec<ProgramParameter>,
    budget: usize,
    seed: u64,
    produced: usize,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(params: &[ProgramParameter], budget: usize, seed: u64) -> Result<Self> {
        for p in params {
            if p.options.is_empty() {
                bounds(p)?;
            }
        }
        Ok(Self {
            params: params.to_vec(),
            budget,
            seed,
            produced: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    fn draw(&mut self, p: &ProgramParameter) -> Result<String> {
        if let Some(choice) = p.options.choose(&mut self.rng) {
            return Ok(choice.clone());
        }
        let (min, max) = bounds(p)?;
        Ok(match p.kind {
            ParameterKind::Integer => self
                .rng
                .random_range(min.round() as i64..=max.round() as i64)
                .to_string(),
            _ => self.rng.random_range(min..=max).to_string(),
        })
    }
}

impl SearchPolicy for RandomSearch {
    fn has_next(&self) -> bool {
        self.produced < self.budget
    }

    fn next_candidate(&mut self) -> Result<ParameterSet> {
        if !self.has_next() {
            return Err(exhausted("random"));
        }
        let params = self.params.clone();
        let mut candidate = ParameterSet::new();
        for p in &params {
            candidate.insert(p.name.clone(), self.draw(p)?);
        }
        self.produced += 1;
        Ok(candidate)
    }

    fn total_iterations(&self) -> usize {
        self.budget
    }

    fn reset(&mut self) {
        self.produced = 0;
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
    }
}

#[derive(Debug, Clone)]
pub struct ExplicitSearch {
    candidates: Vec<ParameterSet>,
    pos: usize,
}

impl ExplicitSearch {
    pub fn new(candidates: Vec<ParameterSet>) -> Self {
        Self { candidates, pos: 0 }
    }
}

impl SearchPolicy for ExplicitSearch {
    fn has_next(&self) -> bool {
        self.pos < self.candidates.len()
    }

    fn next_candidate(&mut self) -> Result<ParameterSet> {
        let candidate = self
            .candidates
            .get(self.pos)
            .cloned()
            .ok_or_else(|| exhausted("explicit"))?;
        self.pos += 1;
        Ok(candidate)
    }

    fn total_iterations(&self) -> usize {
        self.candidates.len()
    }

    fn reset(&mut self) {
        self.pos = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    pub parameters: ParameterSet,
    pub value: f64,
    pub iteration: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationState {
    optima: BTreeMap<String, Optimum>,
}

impl OptimizationState {
    pub fn get(&self, measure: &str) -> Option<&Optimum> {
        self.optima.get(measure)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Optimum)> {
        self.optima.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.optima.is_empty()
    }

    pub(crate) fn from_file(file: &ResultFile, measures: &[Arc<dyn QualityMeasure>]) -> Self {
        let mut rows: Vec<&IterationRecord> = file.records.iter().collect();
        rows.sort_by_key(|r| r.iteration());
        let mut state = Self::default();
        for row in rows {
            if let IterationRecord::Completed {
                iteration,
                parameters,
                qualities,
            } = row
            {
                state.offer(*iteration, parameters, qualities, measures);
            }
        }
        state
    }

    /// Replaces an optimum only on a strictly better value; NT never enters.
    fn offer(
        &mut self,
        iteration: u64,
        parameters: &ParameterSet,
        qualities: &QualitySet,
        measures: &[Arc<dyn QualityMeasure>],
    ) {
        for measure in measures {
            let Some(QualityValue::Value(value)) = qualities.get(measure.id()) else {
                continue;
            };
            let replace = match self.optima.get(measure.id()) {
                None => true,
                Some(current) => measure.is_better(value, current.value),
            };
            if replace {
                self.optima.insert(
                    measure.id().to_string(),
                    Optimum {
                        parameters: parameters.clone(),
                        value,
                        iteration,
                    },
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextIteration {
    Evaluate {
        iteration: u64,
        parameters: ParameterSet,
    },
    AlreadyEvaluated {
        iteration: u64,
        previous: u64,
        parameters: ParameterSet,
    },
}

impl NextIteration {
    pub fn iteration(&self) -> u64 {
        match self {
            NextIteration::Evaluate { iteration, .. }
            | NextIteration::AlreadyEvaluated { iteration, .. } => *iteration,
        }
    }
}

pub struct OptimizationMethod {
    name: String,
    policy: Box<dyn SearchPolicy>,
    measures: Vec<Arc<dyn QualityMeasure>>,
    started: u64,
    finished: u64,
    iteration_of: HashMap<ParameterSet, u64>,
    qualities: HashMap<u64, QualitySet>,
    pending: VecDeque<(u64, ParameterSet)>,
    state: OptimizationState,
    ready: bool,
    replay_drift: usize,
}

impl OptimizationMethod {
    pub fn new(
        name: &str,
        policy: Box<dyn SearchPolicy>,
        measures: Vec<Arc<dyn QualityMeasure>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            policy,
            measures,
            started: 0,
            finished: 0,
            iteration_of: HashMap::new(),
            qualities: HashMap::new(),
            pending: VecDeque::new(),
            state: OptimizationState::default(),
            ready: false,
            replay_drift: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clears all state and, when given a previous result file, replays its
    /// rows in iteration order. Iteration numbers absent from the file are
    /// queued so `next` hands them out again under their original numbers.
    pub fn reset(&mut self, existing: Option<&ResultFile>) -> Result<()> {
        self.policy.reset();
        self.started = 0;
        self.finished = 0;
        self.iteration_of.clear();
        self.qualities.clear();
        self.pending.clear();
        self.state = OptimizationState::default();
        self.replay_drift = 0;

        if let Some(file) = existing {
            let mut rows: Vec<&IterationRecord> = file.records.iter().collect();
            rows.sort_by_key(|r| r.iteration());
            for row in rows {
                let iteration = row.iteration();
                if iteration == 0 || iteration <= self.started {
                    continue;
                }
                while self.started + 1 < iteration {
                    match self.policy.next_candidate() {
                        Ok(candidate) => {
                            self.started += 1;
                            self.pending.push_back((self.started, candidate));
                        }
                        Err(_) => break,
                    }
                }
                let replayed = self.policy.next_candidate();
                if let (Ok(candidate), Some((recorded, _))) = (&replayed, file.resolve(iteration)) {
                    if candidate != recorded {
                        self.replay_drift += 1;
                        warn!(
                            method = %self.name,
                            iteration,
                            policy = %candidate,
                            recorded = %recorded,
                            "replayed candidate differs from the result file"
                        );
                    }
                }
                self.started = iteration;
                self.finished += 1;
                if let IterationRecord::Completed {
                    parameters,
                    qualities,
                    ..
                } = row
                {
                    self.iteration_of
                        .entry(parameters.clone())
                        .or_insert(iteration);
                    self.qualities.insert(iteration, qualities.clone());
                    self.state
                        .offer(iteration, parameters, qualities, &self.measures);
                }
            }
        }
        self.ready = true;
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.ready && (!self.pending.is_empty() || self.policy.has_next())
    }

    pub fn next(&mut self) -> Result<NextIteration> {
        if !self.ready {
            return Err(anyhow!("optimizer_not_ready: reset must run before next"));
        }
        let (iteration, parameters) = match self.pending.pop_front() {
            Some(entry) => entry,
            None => {
                let candidate = self.policy.next_candidate()?;
                self.started += 1;
                (self.started, candidate)
            }
        };
        if let Some(&previous) = self.iteration_of.get(&parameters) {
            self.finished += 1;
            return Ok(NextIteration::AlreadyEvaluated {
                iteration,
                previous,
                parameters,
            });
        }
        self.iteration_of.insert(parameters.clone(), iteration);
        Ok(NextIteration::Evaluate {
            iteration,
            parameters,
        })
    }

    pub fn give_quality_feedback(
        &mut self,
        parameters: &ParameterSet,
        qualities: QualitySet,
    ) -> Result<()> {
        let iteration = self.record(parameters, &qualities)?;
        self.state
            .offer(iteration, parameters, &qualities, &self.measures);
        Ok(())
    }

    pub fn give_feedback_not_terminated(
        &mut self,
        parameters: &ParameterSet,
        qualities: QualitySet,
    ) -> Result<()> {
        self.record(parameters, &qualities).map(|_| ())
    }

    fn record(&mut self, parameters: &ParameterSet, qualities: &QualitySet) -> Result<u64> {
        let iteration = *self
            .iteration_of
            .get(parameters)
            .ok_or_else(|| anyhow!("feedback for parameter set {} that was never issued", parameters))?;
        if self.qualities.insert(iteration, qualities.clone()).is_none() {
            self.finished += 1;
        }
        Ok(iteration)
    }

    pub fn replay_drift(&self) -> usize {
        self.replay_drift
    }

    pub fn finished_count(&self) -> u64 {
        self.finished
    }

    pub fn started_count(&self) -> u64 {
        self.started
    }

    pub fn total_iteration_count(&self) -> usize {
        self.policy.total_iterations()
    }

    pub fn state(&self) -> &OptimizationState {
        &self.state
    }

    pub fn optimum(&self, measure: &str) -> Option<&Optimum> {
        self.state.get(measure)
    }

    pub fn qualities_of(&self, iteration: u64) -> Option<&QualitySet> {
        self.qualities.get(&iteration)
    }

    pub fn progress(&self) -> u32 {
        let total = self.total_iteration_count() as u64;
        if total == 0 {
            return 10_000;
        }
        ((self.finished.min(total) * 10_000) / total) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::QualityInput;

    struct Toward {
        id: &'static str,
        higher: bool,
    }

    impl QualityMeasure for Toward {
        fn id(&self) -> &str {
            self.id
        }

        fn is_better(&self, candidate: f64, current: f64) -> bool {
            if self.higher {
                candidate > current
            } else {
                candidate < current
            }
        }

        fn compute(&self, _input: &QualityInput<'_>) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn f1() -> Vec<Arc<dyn QualityMeasure>> {
        vec![Arc::new(Toward {
            id: "F1",
            higher: true,
        })]
    }

    fn k(v: &str) -> ParameterSet {
        [("k", v)].into_iter().collect()
    }

    fn q(v: f64) -> QualitySet {
        [("F1", QualityValue::Value(v))].into_iter().collect()
    }

    fn int_param(name: &str, min: f64, max: f64) -> ProgramParameter {
        ProgramParameter {
            name: name.to_string(),
            kind: ParameterKind::Integer,
            default: None,
            options: Vec::new(),
            min: Some(min),
            max: Some(max),
            optimizable: true,
        }
    }

    fn ready(policy: Box<dyn SearchPolicy>) -> OptimizationMethod {
        let mut method = OptimizationMethod::new("test", policy, f1());
        method.reset(None).expect("reset");
        method
    }

    #[test]
    fn duplicate_candidate_references_first_evaluation() {
        let mut method = ready(Box::new(ExplicitSearch::new(vec![k("2"), k("3"), k("2")])));
        assert_eq!(
            method.next().expect("first"),
            NextIteration::Evaluate {
                iteration: 1,
                parameters: k("2")
            }
        );
        method.give_quality_feedback(&k("2"), q(0.50)).expect("fb1");
        assert_eq!(
            method.next().expect("second"),
            NextIteration::Evaluate {
                iteration: 2,
                parameters: k("3")
            }
        );
        method.give_quality_feedback(&k("3"), q(0.80)).expect("fb2");
        assert_eq!(
            method.next().expect("third"),
            NextIteration::AlreadyEvaluated {
                iteration: 3,
                previous: 1,
                parameters: k("2")
            }
        );
        assert!(!method.has_next());
        assert_eq!(method.finished_count(), 3);
        let best = method.optimum("F1").expect("optimum");
        assert_eq!(best.parameters, k("3"));
        assert_eq!(best.value, 0.80);
        let err = method.next().expect_err("exhausted");
        assert!(matches!(
            err.downcast_ref::<RunnerError>(),
            Some(RunnerError::NoParameterSetFound(_))
        ));
    }

    #[test]
    fn optimum_tracks_maximum_and_ignores_not_terminated() {
        let values = [0.3, 0.9, 0.1, 0.9, 0.7];
        let candidates: Vec<ParameterSet> = (0..values.len()).map(|i| k(&i.to_string())).collect();
        let mut method = ready(Box::new(ExplicitSearch::new(candidates.clone())));
        for (i, v) in values.iter().enumerate() {
            method.next().expect("next");
            method
                .give_quality_feedback(&candidates[i], q(*v))
                .expect("feedback");
        }
        let best = method.optimum("F1").expect("optimum");
        assert_eq!(best.value, 0.9);
        assert_eq!(best.parameters, k("1"));

        let mut lower = OptimizationMethod::new(
            "lower",
            Box::new(ExplicitSearch::new(vec![k("a"), k("b")])),
            vec![Arc::new(Toward {
                id: "F1",
                higher: false,
            })],
        );
        lower.reset(None).expect("reset");
        lower.next().expect("a");
        lower
            .give_feedback_not_terminated(&k("a"), QualitySet::not_terminated(&["F1"]))
            .expect("nt");
        assert!(lower.optimum("F1").is_none());
        lower.next().expect("b");
        lower.give_quality_feedback(&k("b"), q(0.4)).expect("fb");
        assert_eq!(lower.optimum("F1").expect("optimum").parameters, k("b"));
        assert_eq!(lower.finished_count(), 2);
    }

    #[test]
    fn next_requires_reset() {
        let mut method = OptimizationMethod::new("test", Box::new(ExplicitSearch::new(vec![k("1")])), f1());
        assert!(!method.has_next());
        assert!(method.next().is_err());
    }

    #[test]
    fn grid_splits_budget_and_walks_odometer() {
        let params = vec![int_param("k", 2.0, 4.0), int_param("seed", 0.0, 1.0)];
        let mut grid = GridSearch::new(&params, 6).expect("grid");
        assert_eq!(grid.values()[0], vec!["2", "4"]);
        assert_eq!(grid.values()[1], vec!["0", "1"]);
        assert_eq!(grid.total_iterations(), 4);
        let mut seen = Vec::new();
        while grid.has_next() {
            let c = grid.next_candidate().expect("candidate");
            seen.push(format!("{}/{}", c.get("k").unwrap_or(""), c.get("seed").unwrap_or("")));
        }
        assert_eq!(seen, vec!["2/0", "2/1", "4/0", "4/1"]);
        grid.reset();
        assert_eq!(grid.next_candidate().expect("again").get("k"), Some("2"));
    }

    #[test]
    fn grid_integer_range_is_unique_and_floats_are_even() {
        let narrow = GridSearch::new(&[int_param("k", 1.0, 2.0)], 5).expect("grid");
        assert_eq!(narrow.values()[0], vec!["1", "2"]);
        let mut alpha = int_param("alpha", 0.0, 1.0);
        alpha.kind = ParameterKind::Float;
        let floats = GridSearch::new(&[alpha], 3).expect("grid");
        assert_eq!(floats.values()[0], vec!["0", "0.5", "1"]);
        let mut mode = int_param("mode", 0.0, 0.0);
        mode.kind = ParameterKind::String;
        assert!(GridSearch::new(&[mode], 3).is_err());
    }

    #[test]
    fn random_search_repeats_after_reset() {
        let params = vec![int_param("k", 2.0, 9.0)];
        let mut random = RandomSearch::new(&params, 5, 42).expect("random");
        let first: Vec<ParameterSet> = (0..5).map(|_| random.next_candidate().expect("draw")).collect();
        assert!(!random.has_next());
        random.reset();
        let second: Vec<ParameterSet> = (0..5).map(|_| random.next_candidate().expect("draw")).collect();
        assert_eq!(first, second);
        for c in &first {
            let v: i64 = c.get("k").expect("k").parse().expect("int");
            assert!((2..=9).contains(&v));
        }
    }

    fn score(ps: &ParameterSet) -> f64 {
        let v: f64 = ps.get("k").and_then(|s| s.parse().ok()).unwrap_or(0.0);
        1.0 - (v - 5.0).abs() / 10.0
    }

    fn drive(method: &mut OptimizationMethod, records: &mut Vec<IterationRecord>, limit: usize) {
        let mut steps = 0;
        while method.has_next() && steps < limit {
            match method.next().expect("next") {
                NextIteration::Evaluate {
                    iteration,
                    parameters,
                } => {
                    let qualities = q(score(&parameters));
                    method
                        .give_quality_feedback(&parameters, qualities.clone())
                        .expect("feedback");
                    records.push(IterationRecord::Completed {
                        iteration,
                        parameters,
                        qualities,
                    });
                }
                NextIteration::AlreadyEvaluated {
                    iteration,
                    previous,
                    ..
                } => records.push(IterationRecord::Duplicate {
                    iteration,
                    previous,
                }),
            }
            steps += 1;
        }
    }

    fn file(records: &[IterationRecord]) -> ResultFile {
        ResultFile {
            parameter_names: vec!["k".to_string()],
            measure_names: vec!["F1".to_string()],
            records: records.to_vec(),
        }
    }

    #[test]
    fn replay_of_complete_file_reproduces_optimum() {
        let params = vec![int_param("k", 1.0, 9.0)];
        let policy = || Box::new(RandomSearch::new(&params, 12, 7).expect("random")) as Box<dyn SearchPolicy>;
        let mut original = ready(policy());
        let mut records = Vec::new();
        drive(&mut original, &mut records, usize::MAX);
        assert!(records
            .iter()
            .any(|r| matches!(r, IterationRecord::Duplicate { .. })));

        let mut resumed = OptimizationMethod::new("test", policy(), f1());
        resumed.reset(Some(&file(&records))).expect("replay");
        assert!(!resumed.has_next());
        assert_eq!(resumed.finished_count(), original.finished_count());
        assert_eq!(resumed.started_count(), 12);
        assert_eq!(resumed.state(), original.state());
    }

    #[test]
    fn interrupted_search_continues_to_same_optimum() {
        let params = vec![int_param("k", 1.0, 9.0)];
        let policy = || Box::new(RandomSearch::new(&params, 12, 99).expect("random")) as Box<dyn SearchPolicy>;
        let mut full = ready(policy());
        let mut all = Vec::new();
        drive(&mut full, &mut all, usize::MAX);

        let mut partial = ready(policy());
        let mut head = Vec::new();
        drive(&mut partial, &mut head, 5);

        let mut resumed = OptimizationMethod::new("test", policy(), f1());
        resumed.reset(Some(&file(&head))).expect("replay");
        let mut tail = Vec::new();
        drive(&mut resumed, &mut tail, usize::MAX);
        assert_eq!(head.len() + tail.len(), all.len());
        assert_eq!(resumed.state(), full.state());
        assert_eq!(resumed.finished_count(), full.finished_count());
    }

    #[test]
    fn replay_requeues_iterations_missing_from_file() {
        let candidates = vec![k("1"), k("2"), k("3"), k("4"), k("5")];
        let records = vec![
            IterationRecord::Completed {
                iteration: 1,
                parameters: k("1"),
                qualities: q(0.1),
            },
            IterationRecord::Completed {
                iteration: 4,
                parameters: k("4"),
                qualities: q(0.4),
            },
            IterationRecord::Completed {
                iteration: 2,
                parameters: k("2"),
                qualities: q(0.2),
            },
        ];
        let mut method = OptimizationMethod::new(
            "test",
            Box::new(ExplicitSearch::new(candidates)),
            f1(),
        );
        method.reset(Some(&file(&records))).expect("replay");
        assert_eq!(method.finished_count(), 3);
        assert_eq!(
            method.next().expect("gap"),
            NextIteration::Evaluate {
                iteration: 3,
                parameters: k("3")
            }
        );
        assert_eq!(
            method.next().expect("tail"),
            NextIteration::Evaluate {
                iteration: 5,
                parameters: k("5")
            }
        );
        assert!(!method.has_next());
        assert_eq!(method.optimum("F1").expect("optimum").parameters, k("4"));
        assert_eq!(method.progress(), 6_000);
    }

    #[test]
    fn replay_counts_rows_the_policy_no_longer_produces() {
        let records = vec![
            IterationRecord::Completed {
                iteration: 1,
                parameters: k("2"),
                qualities: q(0.5),
            },
            IterationRecord::Completed {
                iteration: 2,
                parameters: k("7"),
                qualities: q(0.6),
            },
            IterationRecord::Duplicate {
                iteration: 3,
                previous: 1,
            },
        ];
        let mut same = OptimizationMethod::new(
            "test",
            Box::new(ExplicitSearch::new(vec![k("2"), k("7"), k("2")])),
            f1(),
        );
        same.reset(Some(&file(&records))).expect("replay");
        assert_eq!(same.replay_drift(), 0);

        let mut changed = OptimizationMethod::new(
            "test",
            Box::new(ExplicitSearch::new(vec![k("2"), k("3"), k("4")])),
            f1(),
        );
        changed.reset(Some(&file(&records))).expect("replay");
        assert_eq!(changed.replay_drift(), 2);
        assert_eq!(changed.finished_count(), 3);
        changed.reset(None).expect("fresh");
        assert_eq!(changed.replay_drift(), 0);
    }

    #[test]
    fn replayed_duplicates_are_not_evaluations() {
        let records = vec![
            IterationRecord::Completed {
                iteration: 1,
                parameters: k("2"),
                qualities: q(0.5),
            },
            IterationRecord::Duplicate {
                iteration: 2,
                previous: 1,
            },
        ];
        let mut method = OptimizationMethod::new(
            "test",
            Box::new(ExplicitSearch::new(vec![k("2"), k("2"), k("3")])),
            f1(),
        );
        method.reset(Some(&file(&records))).expect("replay");
        assert_eq!(method.finished_count(), 2);
        assert!(method.qualities_of(2).is_none());
        assert_eq!(
            method.next().expect("third"),
            NextIteration::Evaluate {
                iteration: 3,
                parameters: k("3")
            }
        );
    }
}
