use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub type TaskId = u64;

pub trait Schedulable: Send + Sync + 'static {
    fn execute(&self);

    fn force_stop(&self) {}

    fn label(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Panicked(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

struct HandleState {
    status: TaskStatus,
    cancel_requested: bool,
}

struct HandleShared {
    id: TaskId,
    label: String,
    state: Mutex<HandleState>,
    resolved: Condvar,
}

enum CancelEffect {
    WasPending,
    WasRunning,
    AlreadyResolved,
}

#[derive(Clone)]
pub struct TaskHandle(Arc<HandleShared>);

impl TaskHandle {
    fn new(id: TaskId, label: String) -> Self {
        Self(Arc::new(HandleShared {
            id,
            label,
            state: Mutex::new(HandleState {
                status: TaskStatus::Pending,
                cancel_requested: false,
            }),
            resolved: Condvar::new(),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn status(&self) -> TaskStatus {
        self.0.state.lock().status.clone()
    }

    pub fn wait(&self) -> TaskStatus {
        let mut state = self.0.state.lock();
        while !state.status.is_terminal() {
            self.0.resolved.wait(&mut state);
        }
        state.status.clone()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskStatus> {
        let mut state = self.0.state.lock();
        if !state.status.is_terminal() {
            self.0.resolved.wait_for(&mut state, timeout);
        }
        state
            .status
            .is_terminal()
            .then(|| state.status.clone())
    }

    fn begin(&self) -> bool {
        let mut state = self.0.state.lock();
        if state.status != TaskStatus::Pending {
            return false;
        }
        state.status = TaskStatus::Running;
        true
    }

    fn finish(&self, panic_message: Option<String>) {
        let mut state = self.0.state.lock();
        state.status = if state.cancel_requested {
            TaskStatus::Cancelled
        } else if let Some(msg) = panic_message {
            TaskStatus::Panicked(msg)
        } else {
            TaskStatus::Completed
        };
        self.0.resolved.notify_all();
    }

    fn request_cancel(&self) -> CancelEffect {
        let mut state = self.0.state.lock();
        match state.status {
            TaskStatus::Pending => {
                state.cancel_requested = true;
                state.status = TaskStatus::Cancelled;
                self.0.resolved.notify_all();
                CancelEffect::WasPending
            }
            TaskStatus::Running => {
                state.cancel_requested = true;
                CancelEffect::WasRunning
            }
            _ => CancelEffect::AlreadyResolved,
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.0.id)
            .field("label", &self.0.label)
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(name: &'static str, size: usize) -> Result<Self> {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock();
        let tx = sender
            .as_ref()
            .ok_or_else(|| anyhow!("scheduler_closed: {} pool no longer accepts work", self.name))?;
        tx.send(job)
            .map_err(|_| anyhow!("scheduler_closed: {} pool workers are gone", self.name))
    }

    fn close(&self) {
        self.sender.lock().take();
    }

    fn join(&self) {
        let me = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() != me {
                let _ = worker.join();
            }
        }
    }
}

#[derive(Default)]
pub struct ActiveIterations {
    next: AtomicU64,
    active: Mutex<HashMap<u64, String>>,
}

impl ActiveIterations {
    pub fn enter(self: &Arc<Self>, label: String) -> ActiveGuard {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(id, label);
        ActiveGuard {
            owner: Arc::clone(self),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.active.lock().values().cloned().collect();
        labels.sort();
        labels
    }
}

pub struct ActiveGuard {
    owner: Arc<ActiveIterations>,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.owner.active.lock().remove(&self.id);
    }
}

type Submitted = Arc<Mutex<HashMap<TaskId, Arc<dyn Schedulable>>>>;

pub struct Scheduler {
    run_pool: WorkerPool,
    iteration_pool: WorkerPool,
    next_id: AtomicU64,
    submitted: Submitted,
    active: Arc<ActiveIterations>,
}

impl Scheduler {
    pub fn new(run_threads: usize, iteration_threads: usize) -> Result<Self> {
        debug!(run_threads, iteration_threads, "starting scheduler pools");
        Ok(Self {
            run_pool: WorkerPool::new("run", run_threads)?,
            iteration_pool: WorkerPool::new("iteration", iteration_threads)?,
            next_id: AtomicU64::new(1),
            submitted: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(ActiveIterations::default()),
        })
    }

    pub fn register_run_runnable<T: Schedulable>(&self, task: Arc<T>) -> Result<TaskHandle> {
        self.submit(&self.run_pool, task)
    }

    pub fn register_iteration_runnable<T: Schedulable>(&self, task: Arc<T>) -> Result<TaskHandle> {
        self.submit(&self.iteration_pool, task)
    }

    fn submit(&self, pool: &WorkerPool, task: Arc<dyn Schedulable>) -> Result<TaskHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id, task.label());
        self.submitted.lock().insert(id, Arc::clone(&task));
        let job_handle = handle.clone();
        let submitted = Arc::clone(&self.submitted);
        let job: Job = Box::new(move || {
            if job_handle.begin() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.execute()));
                let panic_message = outcome.err().map(|payload| panic_message(&*payload));
                if let Some(msg) = &panic_message {
                    warn!(task = job_handle.label(), panic = %msg, "scheduled task panicked");
                }
                job_handle.finish(panic_message);
            }
            submitted.lock().remove(&id);
        });
        if let Err(err) = pool.submit(job) {
            self.submitted.lock().remove(&id);
            handle.request_cancel();
            return Err(err);
        }
        Ok(handle)
    }

    /// Pending entries never start; running entries get `force_stop`.
    /// Returns false when the entry had already resolved.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        match handle.request_cancel() {
            CancelEffect::WasPending => true,
            CancelEffect::WasRunning => {
                let task = self.submitted.lock().get(&handle.id()).cloned();
                if let Some(task) = task {
                    task.force_stop();
                }
                true
            }
            CancelEffect::AlreadyResolved => false,
        }
    }

    pub fn active_iterations(&self) -> Arc<ActiveIterations> {
        Arc::clone(&self.active)
    }

    pub fn in_flight_iterations(&self) -> usize {
        self.active.count()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn shutdown(&self) {
        self.run_pool.close();
        self.iteration_pool.close();
        self.run_pool.join();
        self.iteration_pool.join();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.run_pool.close();
        self.iteration_pool.close();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    struct Probe {
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        ran: Arc<AtomicUsize>,
        hold: Duration,
    }

    impl Schedulable for Probe {
        fn execute(&self) {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.hold);
            self.inside.fetch_sub(1, Ordering::SeqCst);
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        fn label(&self) -> String {
            "probe".to_string()
        }
    }

    struct Blocker {
        stopped: Arc<AtomicBool>,
        started: Arc<AtomicBool>,
    }

    impl Schedulable for Blocker {
        fn execute(&self) {
            self.started.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.stopped.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn force_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn label(&self) -> String {
            "blocker".to_string()
        }
    }

    struct Exploder;

    impl Schedulable for Exploder {
        fn execute(&self) {
            panic!("boom");
        }

        fn label(&self) -> String {
            "exploder".to_string()
        }
    }

    #[test]
    fn iteration_pool_bounds_concurrency() {
        let scheduler = Scheduler::new(1, 2).expect("scheduler");
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let handles: Vec<TaskHandle> = (0..6)
            .map(|_| {
                scheduler
                    .register_iteration_runnable(Arc::new(Probe {
                        inside: Arc::clone(&inside),
                        peak: Arc::clone(&peak),
                        ran: Arc::clone(&ran),
                        hold: Duration::from_millis(20),
                    }))
                    .expect("submit")
            })
            .collect();
        for h in &handles {
            assert_eq!(h.wait(), TaskStatus::Completed);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        scheduler.shutdown();
    }

    #[test]
    fn cancelling_pending_entry_skips_it() {
        let scheduler = Scheduler::new(1, 1).expect("scheduler");
        let stopped = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let blocker = scheduler
            .register_iteration_runnable(Arc::new(Blocker {
                stopped: Arc::clone(&stopped),
                started: Arc::clone(&started),
            }))
            .expect("blocker");
        let ran = Arc::new(AtomicUsize::new(0));
        let queued = scheduler
            .register_iteration_runnable(Arc::new(Probe {
                inside: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                ran: Arc::clone(&ran),
                hold: Duration::from_millis(1),
            }))
            .expect("queued");
        assert!(scheduler.cancel(&queued));
        assert_eq!(queued.wait(), TaskStatus::Cancelled);
        stopped.store(true, Ordering::SeqCst);
        assert_eq!(blocker.wait(), TaskStatus::Completed);
        scheduler.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.submitted_count(), 0);
    }

    #[test]
    fn cancelling_running_entry_reaches_force_stop() {
        let scheduler = Scheduler::new(1, 1).expect("scheduler");
        let stopped = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let handle = scheduler
            .register_run_runnable(Arc::new(Blocker {
                stopped: Arc::clone(&stopped),
                started: Arc::clone(&started),
            }))
            .expect("submit");
        let deadline = Instant::now() + Duration::from_secs(2);
        while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(scheduler.cancel(&handle));
        assert_eq!(handle.wait(), TaskStatus::Cancelled);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!scheduler.cancel(&handle));
        scheduler.shutdown();
    }

    #[test]
    fn panics_resolve_the_handle() {
        let scheduler = Scheduler::new(1, 1).expect("scheduler");
        let handle = scheduler
            .register_iteration_runnable(Arc::new(Exploder))
            .expect("submit");
        assert_eq!(handle.wait(), TaskStatus::Panicked("boom".to_string()));
        scheduler.shutdown();
    }

    #[test]
    fn closed_scheduler_rejects_work() {
        let scheduler = Scheduler::new(1, 1).expect("scheduler");
        scheduler.shutdown();
        let err = scheduler
            .register_iteration_runnable(Arc::new(Exploder))
            .expect_err("closed");
        assert!(err.to_string().contains("scheduler_closed"));
    }

    #[test]
    fn active_guard_unregisters_on_drop() {
        let active = Arc::new(ActiveIterations::default());
        let guard = active.enter("kmeans_iris.1".to_string());
        assert_eq!(active.count(), 1);
        assert_eq!(active.labels(), vec!["kmeans_iris.1".to_string()]);
        drop(guard);
        assert_eq!(active.count(), 0);
    }
}
