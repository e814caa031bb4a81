use crate::params::ParameterSet;
use anyhow::{anyhow, Result};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Canceller(Arc<dyn Fn() + Send + Sync>);

impl Canceller {
    pub fn new<F: Fn() + Send + Sync + 'static>(f: F) -> Self {
        Self(Arc::new(f))
    }

    pub fn cancel(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Canceller")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

pub trait CancellableTask: Send {
    fn canceller(&self) -> Canceller;

    /// Blocks until the task ends, `limit` elapses (the task is killed and
    /// `TimedOut` returned), or the canceller fires.
    fn wait_timeout(&mut self, limit: Option<Duration>) -> Result<TaskOutcome>;
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub tokens: Vec<String>,
    pub parameters: ParameterSet,
    pub input: PathBuf,
    pub goldstandard: Option<PathBuf>,
    pub output: PathBuf,
    pub log_file: PathBuf,
}

pub trait ProgramBinding: Send + Sync {
    fn start(&self, invocation: &Invocation) -> Result<Box<dyn CancellableTask>>;
}

#[derive(Debug, Clone)]
pub struct ProcessBinding {
    poll: Duration,
}

impl ProcessBinding {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }
}

impl Default for ProcessBinding {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl ProgramBinding for ProcessBinding {
    fn start(&self, invocation: &Invocation) -> Result<Box<dyn CancellableTask>> {
        let (program, args) = invocation
            .tokens
            .split_first()
            .ok_or_else(|| anyhow!("empty invocation for program {}", invocation.program))?;
        if let Some(parent) = invocation.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = fs::File::create(&invocation.log_file)?;
        let err_log = log.try_clone()?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {:?}: {}", program, e))?;
        Ok(Box::new(ProcessTask {
            child: Arc::new(Mutex::new(child)),
            cancelled: Arc::new(AtomicBool::new(false)),
            poll: self.poll,
        }))
    }
}

struct ProcessTask {
    child: Arc<Mutex<Child>>,
    cancelled: Arc<AtomicBool>,
    poll: Duration,
}

impl CancellableTask for ProcessTask {
    fn canceller(&self) -> Canceller {
        let child = Arc::clone(&self.child);
        let cancelled = Arc::clone(&self.cancelled);
        Canceller::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            let _ = child.lock().kill();
        })
    }

    fn wait_timeout(&mut self, limit: Option<Duration>) -> Result<TaskOutcome> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.lock().try_wait()? {
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(TaskOutcome::Cancelled);
                }
                return Ok(TaskOutcome::Exited(status.code()));
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                let mut child = self.child.lock();
                let _ = child.kill();
                let _ = child.wait();
                return Ok(TaskOutcome::TimedOut);
            }
            thread::sleep(self.poll);
        }
    }
}

pub type InProcessFn = dyn Fn(&Invocation, &CancelToken) -> Result<()> + Send + Sync;

#[derive(Clone)]
pub struct InProcessBinding {
    func: Arc<InProcessFn>,
    poll: Duration,
}

impl InProcessBinding {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Invocation, &CancelToken) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            poll: Duration::from_millis(10),
        }
    }
}

impl ProgramBinding for InProcessBinding {
    fn start(&self, invocation: &Invocation) -> Result<Box<dyn CancellableTask>> {
        let token = CancelToken::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let func = Arc::clone(&self.func);
        let inv = invocation.clone();
        let thread_token = token.clone();
        thread::Builder::new()
            .name(format!("inproc-{}", invocation.program))
            .spawn(move || {
                let result = func(&inv, &thread_token);
                if let Err(err) = &result {
                    if let Ok(mut log) = fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&inv.log_file)
                    {
                        let _ = writeln!(log, "{:#}", err);
                    }
                }
                let _ = tx.send(result.is_ok());
            })?;
        Ok(Box::new(ThreadTask {
            done: rx,
            token,
            poll: self.poll,
        }))
    }
}

struct ThreadTask {
    done: crossbeam_channel::Receiver<bool>,
    token: CancelToken,
    poll: Duration,
}

impl CancellableTask for ThreadTask {
    fn canceller(&self) -> Canceller {
        let token = self.token.clone();
        Canceller::new(move || token.cancel())
    }

    fn wait_timeout(&mut self, limit: Option<Duration>) -> Result<TaskOutcome> {
        let started = Instant::now();
        loop {
            if self.token.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            match self.done.recv_timeout(self.poll) {
                Ok(ok) => {
                    if self.token.is_cancelled() {
                        return Ok(TaskOutcome::Cancelled);
                    }
                    return Ok(TaskOutcome::Exited(Some(if ok { 0 } else { 1 })));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("in-process program thread panicked"));
                }
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                self.token.cancel();
                return Ok(TaskOutcome::TimedOut);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(dir: &std::path::Path, tokens: &[&str]) -> Invocation {
        Invocation {
            program: "probe".to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            parameters: ParameterSet::new(),
            input: dir.join("in"),
            goldstandard: None,
            output: dir.join("out"),
            log_file: dir.join("probe.log"),
        }
    }

    #[test]
    fn in_process_task_reports_exit() {
        let dir = crate::scratch_dir("clust_task_inproc");
        let binding = InProcessBinding::new(|inv, _| {
            fs::write(&inv.output, "done")?;
            Ok(())
        });
        let mut task = binding.start(&invocation(&dir, &[])).expect("start");
        assert_eq!(task.wait_timeout(None).expect("wait"), TaskOutcome::Exited(Some(0)));
        assert!(dir.join("out").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn in_process_task_times_out_and_sees_token() {
        let dir = crate::scratch_dir("clust_task_inproc_timeout");
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_cancel);
        let binding = InProcessBinding::new(move |_, token| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let mut task = binding.start(&invocation(&dir, &[])).expect("start");
        let outcome = task
            .wait_timeout(Some(Duration::from_millis(50)))
            .expect("wait");
        assert_eq!(outcome, TaskOutcome::TimedOut);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !saw_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(saw_cancel.load(Ordering::SeqCst));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn canceller_stops_in_process_wait() {
        let dir = crate::scratch_dir("clust_task_inproc_cancel");
        let binding = InProcessBinding::new(|_, token| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let mut task = binding.start(&invocation(&dir, &[])).expect("start");
        let cancel = task.canceller();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        assert_eq!(task.wait_timeout(None).expect("wait"), TaskOutcome::Cancelled);
        killer.join().expect("killer");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn process_task_is_killed_on_timeout() {
        let dir = crate::scratch_dir("clust_task_proc_timeout");
        let binding = ProcessBinding::new(Duration::from_millis(10));
        let started = Instant::now();
        let mut task = binding
            .start(&invocation(&dir, &["sleep", "5"]))
            .expect("spawn sleep");
        let outcome = task
            .wait_timeout(Some(Duration::from_millis(200)))
            .expect("wait");
        assert_eq!(outcome, TaskOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn process_output_lands_in_log() {
        let dir = crate::scratch_dir("clust_task_proc_log");
        let binding = ProcessBinding::new(Duration::from_millis(10));
        let mut task = binding
            .start(&invocation(&dir, &["echo", "hello"]))
            .expect("spawn echo");
        assert_eq!(task.wait_timeout(None).expect("wait"), TaskOutcome::Exited(Some(0)));
        let log = fs::read_to_string(dir.join("probe.log")).expect("log");
        assert_eq!(log.trim(), "hello");
        let _ = fs::remove_dir_all(dir);
    }
}
