pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod iteration;
pub mod locks;
pub mod optimization;
pub mod params;
pub mod registry;
pub mod run;
pub mod runnable;
pub mod scheduler;
pub mod store;
pub mod task;

pub use config::{
    load_engine_config, load_run_definition, DataConfig, EngineConfig, MeasureDefinition,
    OptimizationSettings, ParameterKind, ProgramConfig, ProgramParameter, RunDefinition, RunMode,
    RunPair,
};
pub use context::Context;
pub use error::RunnerError;
pub use events::{ConfigEvent, ConfigEvents, Subscription};
pub use locks::LockRegistry;
pub use optimization::{
    NextIteration, OptimizationMethod, OptimizationState, Optimum, SearchPolicy,
};
pub use params::{ParameterSet, QualitySet, QualityValue};
pub use registry::{QualityMeasure, Registry, RunStatistic, StatisticCalculator};
pub use run::{read_run_results, AnalysisResult, PairResult, Run, RunKind, RunResult, RunStatus};
pub use runnable::RunRunnable;
pub use scheduler::{Scheduler, TaskHandle, TaskStatus};
pub use store::{IterationRecord, ResultFile, ResultStore, RunLayout};
pub use task::{
    CancelToken, CancellableTask, Canceller, InProcessBinding, Invocation, ProcessBinding,
    ProgramBinding, TaskOutcome,
};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Hex sha256 of the compact JSON form. Object keys serialize sorted, so
/// equal documents digest equally regardless of source key order.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
pub(crate) fn scratch_dir(prefix: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}
