use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type PathGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, path: &Path) -> PathGuard {
        let lock = self.lock_for(path);
        lock.lock_arc()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let key = canonical_key(path);
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key).or_default())
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(real_parent) => real_parent.join(name),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn aliases_of_one_file_share_a_lock() {
        let dir = crate::scratch_dir("clust_locks_alias");
        std::fs::create_dir_all(dir.join("sub")).expect("sub dir");
        let file = dir.join("data.tsv");
        std::fs::write(&file, "x").expect("write");
        let registry = LockRegistry::new();
        let _a = registry.lock(&file);
        let alias = dir.join("sub").join("..").join("data.tsv");
        assert!(Arc::ptr_eq(&registry.lock_for(&alias), &registry.lock_for(&file)));
        assert_eq!(registry.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn lock_serializes_holders() {
        let dir = crate::scratch_dir("clust_locks_serial");
        let file = dir.join("shared.qual");
        let registry = Arc::new(LockRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let file = file.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..5 {
                    let _guard = registry.lock(&file);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for w in workers {
            w.join().expect("worker");
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
