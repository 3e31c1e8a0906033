use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{VmError, calls::panic_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

/// A unit of background work: one native call.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<Job>>,
    has_work: Condvar,
    busy: AtomicBool,
    should_stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            busy: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, job: Job) {
        self.local.lock().push_back(job);
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.local.lock().pop_front()
    }

    fn steal_back(&self) -> Option<Job> {
        self.local.lock().pop_back()
    }

    /// Queued jobs plus the one running, if any.
    fn load(&self) -> usize {
        self.local.lock().len() + self.busy.load(Ordering::Relaxed) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleConfig {
    /// Spawn a worker once the average load per worker reaches this.
    pub spawn_backlog_threshold: usize,
    /// A worker idle for this long exits.
    pub retire_after_idle: Duration,
    pub max_pool_workers: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            spawn_backlog_threshold: 1,
            retire_after_idle: Duration::from_secs(2),
            max_pool_workers: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCreateInfo {
    pub spawn_backlog_threshold: Option<usize>,
    pub retire_after_idle: Option<Duration>,
    pub max_pool_workers: Option<usize>,
}

impl PoolCreateInfo {
    pub fn scale(&self) -> Result<ScaleConfig, VmError> {
        let mut scale = ScaleConfig::default();
        self.spawn_backlog_threshold
            .inspect(|&val| scale.spawn_backlog_threshold = val);
        self.retire_after_idle
            .inspect(|&val| scale.retire_after_idle = val);
        self.max_pool_workers
            .inspect(|&val| scale.max_pool_workers = val);
        // background natives lock the heap, so they can never run on the
        // scheduler thread that already holds it
        if scale.max_pool_workers == 0 {
            return Err(VmError::InvalidSettings("max_pool_workers must be positive"));
        }
        Ok(scale)
    }
}

/// Threads running background native calls for every process.
///
/// Jobs land on the least loaded worker; idle workers steal from the back
/// of busier queues, and workers idle past `retire_after_idle` exit.
pub struct BackgroundPool {
    pool: Mutex<Vec<Arc<Worker>>>,
    id_gen: AtomicU64,
    running: AtomicUsize,
    scale: ScaleConfig,
}

impl BackgroundPool {
    pub fn new(scale: ScaleConfig) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(Vec::new()),
            id_gen: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            scale,
        })
    }

    pub fn scale(&self) -> ScaleConfig {
        self.scale
    }

    pub fn worker_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn submit(self: &Arc<Self>, job: Job) {
        let mut pool = self.pool.lock();
        let worker = self.pick_or_spawn(&mut pool);
        // pushed under the pool lock so a retiring worker cannot drop it
        worker.push(job);
    }

    fn spawn_worker(self: &Arc<Self>, pool: &mut Vec<Arc<Worker>>) -> Arc<Worker> {
        let id = WorkerId(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let w = Worker::new(id);
        let me = Arc::clone(self);
        let w_clone = Arc::clone(&w);
        let handle = thread::Builder::new()
            .name(format!("background-{}", id.0))
            .spawn(move || me.worker_loop(w_clone))
            .expect("spawn background worker");
        *w.handle.lock() = Some(handle);
        pool.push(Arc::clone(&w));
        log::debug!("background worker {} spawned ({} total)", id.0, pool.len());
        w
    }

    fn pick_or_spawn(self: &Arc<Self>, pool: &mut Vec<Arc<Worker>>) -> Arc<Worker> {
        if pool.is_empty() {
            return self.spawn_worker(pool);
        }

        let total_load: usize = pool.iter().map(|w| w.load()).sum();
        let avg = total_load / pool.len();
        if avg >= self.scale.spawn_backlog_threshold
            && pool.len() < self.scale.max_pool_workers
        {
            return self.spawn_worker(pool);
        }

        pool.iter()
            .min_by_key(|w| w.load())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&pool[0]))
    }

    fn run(&self, me: &Worker, job: Job) {
        me.busy.store(true, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            log::error!(
                "background worker {} caught a panicking job: {}",
                me.id.0,
                panic_message(payload.as_ref())
            );
        }
        self.running.fetch_sub(1, Ordering::Relaxed);
        me.busy.store(false, Ordering::Relaxed);
    }

    fn worker_loop(self: Arc<Self>, me: Arc<Worker>) {
        let retire_after = self.scale.retire_after_idle;
        let mut last_work = Instant::now();

        loop {
            if me.should_stop.load(Ordering::Relaxed) {
                break;
            }

            if let Some(job) = me.pop() {
                self.run(&me, job);
                last_work = Instant::now();
                continue;
            }

            if let Some(job) = self.try_steal(&me) {
                self.run(&me, job);
                last_work = Instant::now();
                continue;
            }

            {
                let mut guard = me.local.lock();
                if guard.is_empty() {
                    let _ = me.has_work.wait_for(&mut guard, Duration::from_millis(10));
                }
            }

            if Instant::now().duration_since(last_work) >= retire_after {
                let mut pool = self.pool.lock();
                if !me.local.lock().is_empty() {
                    continue;
                }
                if let Some(pos) = pool.iter().position(|w| w.id == me.id) {
                    pool.swap_remove(pos);
                }
                log::debug!("background worker {} retired", me.id.0);
                break;
            }
        }
    }

    fn try_steal(&self, me: &Worker) -> Option<Job> {
        let pool_snapshot = self.pool.lock().clone();
        pool_snapshot
            .iter()
            .filter(|w| w.id != me.id)
            .find_map(|w| w.steal_back())
    }

    /// Stop every worker after its current job and join them. Queued jobs
    /// that have not started are dropped.
    pub fn shutdown(&self) {
        let workers: Vec<_> = self.pool.lock().drain(..).collect();
        for w in &workers {
            w.should_stop.store(true, Ordering::Relaxed);
            w.has_work.notify_one();
        }
        for w in workers {
            if let Some(h) = w.handle.lock().take() {
                if h.thread().id() != thread::current().id() {
                    let _ = h.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(threshold: usize, retire_ms: u64, max: usize) -> Arc<BackgroundPool> {
        BackgroundPool::new(ScaleConfig {
            spawn_backlog_threshold: threshold,
            retire_after_idle: Duration::from_millis(retire_ms),
            max_pool_workers: max,
        })
    }

    #[test]
    fn runs_every_submitted_job() {
        let p = pool(1, 200, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let ran = ran.clone();
            p.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 16);
        p.shutdown();
    }

    #[test]
    fn blocking_jobs_get_their_own_workers() {
        let p = pool(1, 500, 4);
        let (tx, rx) = std::sync::mpsc::channel();
        let start = Instant::now();
        for _ in 0..2 {
            let tx = tx.clone();
            p.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(150));
                tx.send(()).expect("send");
            }));
            // let the first job start so its worker counts as busy
            thread::sleep(Duration::from_millis(20));
        }
        rx.recv().expect("first");
        rx.recv().expect("second");
        assert!(start.elapsed() < Duration::from_millis(290));
        assert_eq!(p.worker_count(), 2);
        p.shutdown();
    }

    #[test]
    fn idle_workers_retire() {
        let p = pool(1, 40, 3);
        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            p.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                tx.send(()).expect("send");
            }));
        }
        for _ in 0..3 {
            rx.recv().expect("job");
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(p.worker_count(), 0);

        // the pool grows again on demand
        let tx2 = tx.clone();
        p.submit(Box::new(move || tx2.send(()).expect("send")));
        rx.recv_timeout(Duration::from_secs(2)).expect("respawned worker ran");
        p.shutdown();
    }

    #[test]
    fn a_panicking_job_leaves_the_worker_usable() {
        let p = pool(4, 500, 1);
        let (tx, rx) = std::sync::mpsc::channel();
        fn failing_job() {
            panic!("job failed");
        }
        p.submit(Box::new(failing_job));
        for i in 0..3 {
            let tx = tx.clone();
            p.submit(Box::new(move || tx.send(i).expect("send")));
        }
        let got: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("job after panic ran"))
            .collect();
        assert_eq!(got, [0, 1, 2]);
        assert_eq!(p.worker_count(), 1);
        let deadline = Instant::now() + Duration::from_secs(2);
        while p.pool.lock().iter().any(|w| w.busy.load(Ordering::Relaxed)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(p.pool.lock().iter().all(|w| w.load() == 0));
        p.shutdown();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let info = PoolCreateInfo {
            max_pool_workers: Some(0),
            ..Default::default()
        };
        assert!(info.scale().is_err());
    }
}
