//! Periodic and one-shot task dispatch onto a small worker pool.
//!
//! Tasks run to completion without preemption. For a given worker
//! everything is totally ordered; with the default single worker the
//! whole trading path is serialized, which the cycle engine relies
//! on.

use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::error;

/// Identifies a scheduled task for [`Scheduler::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

type OnceTask = Box<dyn FnOnce() + Send>;
type PeriodicTask = Arc<Mutex<Box<dyn FnMut() + Send>>>;

enum TaskKind {
    Once(Option<OnceTask>),
    Periodic(PeriodicTask),
}

struct Entry {
    at: Instant,
    period: Option<Duration>,
    id: u64,
    task: TaskKind,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        other.at.cmp(&self.at).then(other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimedState {
    heap: BinaryHeap<Entry>,
    removed: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct WorkState {
    queue: VecDeque<OnceTask>,
    in_flight: usize,
    shutdown: bool,
}

struct Inner {
    timed: Mutex<TimedState>,
    timed_cv: Condvar,
    work: Mutex<WorkState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Handle to the scheduler. Cheap to clone; all clones share the
/// same timer thread and worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// The "run this on a worker thread" facet of the scheduler.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start a scheduler with `workers` worker threads (at least 1).
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            timed: Mutex::new(TimedState::default()),
            timed_cv: Condvar::new(),
            work: Mutex::new(WorkState::default()),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        {
            let inner = inner.clone();
            threads.push(
                thread::Builder::new()
                    .name("pmm-timer".into())
                    .spawn(move || timer_loop(&inner))
                    .expect("spawn timer thread"),
            );
        }
        for i in 0..workers.max(1) {
            let inner = inner.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("pmm-worker-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("spawn worker thread"),
            );
        }
        *inner.threads.lock() = threads;

        Self { inner }
    }

    /// Schedule a one-shot task after `delay`.
    pub fn after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Handle {
        self.insert(delay, None, TaskKind::Once(Some(Box::new(task))))
    }

    /// Schedule a recurring task, first firing after `period`.
    pub fn each(&self, period: Duration, task: impl FnMut() + Send + 'static) -> Handle {
        self.insert(
            period,
            Some(period),
            TaskKind::Periodic(Arc::new(Mutex::new(Box::new(task)))),
        )
    }

    /// Enqueue a task onto the worker pool as soon as possible.
    pub fn immediate(&self, task: impl FnOnce() + Send + 'static) {
        self.push_work(Box::new(task));
    }

    /// Cancel a scheduled task. Recurring tasks stop re-arming; an
    /// execution already handed to a worker still completes.
    pub fn remove(&self, handle: Handle) {
        let mut timed = self.inner.timed.lock();
        timed.removed.insert(handle.0);
        self.inner.timed_cv.notify_all();
    }

    /// Block until the work queue is drained and no task is running.
    pub fn sync(&self) {
        let mut work = self.inner.work.lock();
        while !work.queue.is_empty() || work.in_flight > 0 {
            self.inner.idle_cv.wait(&mut work);
        }
    }

    pub fn worker(&self) -> Worker {
        Worker {
            inner: self.inner.clone(),
        }
    }

    /// Stop the timer and workers. Queued work that has not started
    /// is dropped; running tasks complete.
    pub fn shutdown(&self) {
        self.inner.timed.lock().shutdown = true;
        self.inner.timed_cv.notify_all();
        self.inner.work.lock().shutdown = true;
        self.inner.work_cv.notify_all();
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for t in threads {
            let _ = t.join();
        }
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, task: TaskKind) -> Handle {
        let mut timed = self.inner.timed.lock();
        timed.next_id += 1;
        let id = timed.next_id;
        timed.heap.push(Entry {
            at: Instant::now() + delay,
            period,
            id,
            task,
        });
        self.inner.timed_cv.notify_all();
        Handle(id)
    }

    fn push_work(&self, task: OnceTask) {
        push_work(&self.inner, task);
    }
}

impl Worker {
    /// Enqueue a task; it runs on a worker thread in FIFO order.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        push_work(&self.inner, Box::new(task));
    }

    /// Run `f` on a worker thread and wait for its result. A panic
    /// inside `f` is re-raised on the calling thread.
    pub fn run<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        self.submit(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(result);
        });
        match rx.recv() {
            Ok(Ok(value)) => value,
            Ok(Err(panic)) => resume_unwind(panic),
            Err(_) => panic!("worker dropped the task without running it"),
        }
    }
}

fn push_work(inner: &Arc<Inner>, task: OnceTask) {
    let mut work = inner.work.lock();
    if work.shutdown {
        return;
    }
    work.queue.push_back(task);
    inner.work_cv.notify_one();
}

fn timer_loop(inner: &Arc<Inner>) {
    loop {
        let fired = {
            let mut timed = inner.timed.lock();
            loop {
                if timed.shutdown {
                    return;
                }
                let now = Instant::now();
                match timed.heap.peek() {
                    None => {
                        inner.timed_cv.wait(&mut timed);
                    }
                    Some(entry) if entry.at > now => {
                        let deadline = entry.at;
                        inner.timed_cv.wait_until(&mut timed, deadline);
                    }
                    Some(_) => break,
                }
            }
            let mut entry = timed.heap.pop().expect("peeked entry");
            if timed.removed.contains(&entry.id) {
                timed.removed.remove(&entry.id);
                None
            } else {
                let work = match &mut entry.task {
                    TaskKind::Once(slot) => slot.take(),
                    TaskKind::Periodic(task) => {
                        let task = task.clone();
                        Some(Box::new(move || {
                            let mut task = task.lock();
                            (*task)();
                        }) as OnceTask)
                    }
                };
                if let Some(period) = entry.period {
                    entry.at += period;
                    timed.heap.push(entry);
                }
                work
            }
        };
        if let Some(task) = fired {
            push_work(inner, task);
        }
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let task = {
            let mut work = inner.work.lock();
            loop {
                if work.shutdown {
                    return;
                }
                if let Some(task) = work.queue.pop_front() {
                    work.in_flight += 1;
                    break task;
                }
                inner.work_cv.wait(&mut work);
            }
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker task panicked");
        }
        let mut work = inner.work.lock();
        work.in_flight -= 1;
        if work.queue.is_empty() && work.in_flight == 0 {
            inner.idle_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_immediate_runs_and_sync_waits() {
        let sch = Scheduler::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            sch.immediate(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        sch.sync();
        assert_eq!(count.load(Ordering::SeqCst), 5);
        sch.shutdown();
    }

    #[test]
    fn test_after_fires_once() {
        let sch = Scheduler::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            sch.after(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        thread::sleep(Duration::from_millis(80));
        sch.sync();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sch.shutdown();
    }

    #[test]
    fn test_each_repeats_until_removed() {
        let sch = Scheduler::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = count.clone();
            sch.each(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(100));
        sch.remove(handle);
        sch.sync();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        thread::sleep(Duration::from_millis(50));
        sch.sync();
        assert_eq!(count.load(Ordering::SeqCst), seen);
        sch.shutdown();
    }

    #[test]
    fn test_run_in_worker_returns_value() {
        let sch = Scheduler::new(1);
        let worker = sch.worker();
        let value = worker.run(|| 21 * 2);
        assert_eq!(value, 42);
        sch.shutdown();
    }

    #[test]
    fn test_run_in_worker_propagates_panic() {
        let sch = Scheduler::new(1);
        let worker = sch.worker();
        let result = catch_unwind(AssertUnwindSafe(|| {
            worker.run(|| panic!("boom"));
        }));
        assert!(result.is_err());
        // The worker survives a panicking task.
        assert_eq!(worker.run(|| 7), 7);
        sch.shutdown();
    }

    #[test]
    fn test_ordering_is_fifo_on_single_worker() {
        let sch = Scheduler::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            sch.immediate(move || seen.lock().push(i));
        }
        sch.sync();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        sch.shutdown();
    }
}
