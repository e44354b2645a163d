//! A scheduler that runs every worker on its own thread and caches idle
//! threads for reuse, evicting them after a time-to-live.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Disposable, Rejected, Scheduler, Task, Worker};
use crate::error::on_error_dropped;

const DEFAULT_TTL: Duration = Duration::from_secs(60);

static EXECUTOR_COUNTER: AtomicU64 = AtomicU64::new(0);

enum Message {
  Run(Arc<TaskCell>),
  Stop,
}

/// One single-thread executor: a mailbox thread draining tasks in order.
struct ExecutorHandle {
  sender: Sender<Message>,
}

impl ExecutorHandle {
  fn submit(&self, cell: Arc<TaskCell>) -> Result<(), Rejected> {
    self.sender.send(Message::Run(cell)).map_err(|_| Rejected)
  }

  fn stop(&self) { let _ = self.sender.send(Message::Stop); }
}

fn spawn_executor() -> Arc<ExecutorHandle> {
  let (sender, receiver): (Sender<Message>, Receiver<Message>) = unbounded();
  let id = EXECUTOR_COUNTER.fetch_add(1, Ordering::Relaxed);
  thread::Builder::new()
    .name(format!("rivulet-cached-{id}"))
    .spawn(move || {
      for message in receiver.iter() {
        match message {
          Message::Run(cell) => cell.run(),
          Message::Stop => break,
        }
      }
    })
    .expect("failed to spawn scheduler thread");
  Arc::new(ExecutorHandle { sender })
}

lazy_static! {
  /// Every submission to this executor fails; handed out once the
  /// scheduler has shut down.
  static ref STOPPED: Arc<ExecutorHandle> = {
    let (sender, receiver) = unbounded();
    drop(receiver);
    Arc::new(ExecutorHandle { sender })
  };
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// A scheduled task and its `Pending -> Running -> (Finished | Cancelled)`
/// state machine. The CAS on `state` resolves the race between the executor
/// starting the task and a concurrent `dispose`.
struct TaskCell {
  task: Mutex<Option<Task>>,
  state: AtomicU8,
  owner: Weak<CachedWorker>,
}

impl TaskCell {
  fn new(task: Task, owner: Weak<CachedWorker>) -> Arc<Self> {
    Arc::new(TaskCell {
      task: Mutex::new(Some(task)),
      state: AtomicU8::new(PENDING),
      owner,
    })
  }

  fn run(self: Arc<Self>) {
    if self
      .state
      .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }
    let task = self.task.lock().unwrap().take();
    if let Some(task) = task {
      if let Err(e) = crate::error::catch_callback(task) {
        on_error_dropped(e);
      }
    }
    self.state.store(FINISHED, Ordering::Release);
    if let Some(worker) = self.owner.upgrade() {
      worker.remove(&self);
    }
  }
}

impl Disposable for TaskCell {
  fn dispose(&self) {
    if self
      .state
      .compare_exchange(
        PENDING,
        CANCELLED,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
    {
      self.task.lock().unwrap().take();
    }
  }

  fn is_disposed(&self) -> bool {
    matches!(self.state.load(Ordering::Acquire), FINISHED | CANCELLED)
  }
}

struct CachedEntry {
  executor: Arc<ExecutorHandle>,
  expires_at: Instant,
}

struct CachedInner {
  ttl: Duration,
  cache: Mutex<Vec<CachedEntry>>,
  all: Mutex<Vec<Arc<ExecutorHandle>>>,
  shutdown: AtomicBool,
  evictor_stop: Sender<()>,
}

impl CachedInner {
  fn pick(&self) -> Arc<ExecutorHandle> {
    if self.shutdown.load(Ordering::Acquire) {
      return STOPPED.clone();
    }
    if let Some(entry) = self.cache.lock().unwrap().pop() {
      return entry.executor;
    }
    let executor = spawn_executor();
    self.all.lock().unwrap().push(executor.clone());
    if self.shutdown.load(Ordering::Acquire) {
      self
        .all
        .lock()
        .unwrap()
        .retain(|e| !Arc::ptr_eq(e, &executor));
      executor.stop();
      return STOPPED.clone();
    }
    executor
  }

  fn release(&self, executor: Arc<ExecutorHandle>) {
    if Arc::ptr_eq(&executor, &STOPPED) {
      return;
    }
    if self.shutdown.load(Ordering::Acquire) {
      executor.stop();
      return;
    }
    let expires_at = Instant::now() + self.ttl;
    self.cache.lock().unwrap().push(CachedEntry {
      executor: executor.clone(),
      expires_at,
    });
    // Shutdown may have raced the push; take the entry back out if so.
    if self.shutdown.load(Ordering::Acquire) {
      let mut cache = self.cache.lock().unwrap();
      let before = cache.len();
      cache.retain(|e| !Arc::ptr_eq(&e.executor, &executor));
      if cache.len() != before {
        executor.stop();
      }
    }
  }

  fn evict(&self) {
    let now = Instant::now();
    let mut expired = Vec::new();
    {
      let mut cache = self.cache.lock().unwrap();
      cache.retain(|entry| {
        if entry.expires_at < now {
          expired.push(entry.executor.clone());
          false
        } else {
          true
        }
      });
    }
    for executor in expired {
      executor.stop();
    }
  }

  fn shutdown(&self) {
    if self.shutdown.swap(true, Ordering::AcqRel) {
      return;
    }
    let _ = self.evictor_stop.send(());
    for entry in self.cache.lock().unwrap().drain(..) {
      entry.executor.stop();
    }
    for executor in self.all.lock().unwrap().drain(..) {
      executor.stop();
    }
  }
}

/// Hands out workers backed by cached single-thread executors. An idle
/// executor is kept for `ttl` and then stopped; `shutdown` is terminal and
/// not restartable.
pub struct CachedThreadScheduler {
  inner: Arc<CachedInner>,
}

impl Default for CachedThreadScheduler {
  fn default() -> Self { Self::new() }
}

impl CachedThreadScheduler {
  pub fn new() -> Self { Self::with_ttl(DEFAULT_TTL) }

  pub fn with_ttl(ttl: Duration) -> Self {
    let (stop_tx, stop_rx) = unbounded::<()>();
    let inner = Arc::new(CachedInner {
      ttl,
      cache: Mutex::new(Vec::new()),
      all: Mutex::new(Vec::new()),
      shutdown: AtomicBool::new(false),
      evictor_stop: stop_tx,
    });
    let evictor_target = Arc::downgrade(&inner);
    thread::Builder::new()
      .name("rivulet-cached-evictor".into())
      .spawn(move || loop {
        match stop_rx.recv_timeout(ttl) {
          Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
            match evictor_target.upgrade() {
              Some(inner) => inner.evict(),
              None => break,
            }
          }
          _ => break,
        }
      })
      .expect("failed to spawn scheduler thread");
    CachedThreadScheduler { inner }
  }
}

impl Scheduler for CachedThreadScheduler {
  fn schedule(&self, task: Task) -> Result<Arc<dyn Disposable>, Rejected> {
    let executor = self.inner.pick();
    let inner = self.inner.clone();
    let home = executor.clone();
    let wrapped: Task = Box::new(move || {
      let _release = ReleaseOnDrop { inner, executor: Some(home) };
      task();
    });
    let cell = TaskCell::new(wrapped, Weak::new());
    executor.submit(cell.clone())?;
    Ok(cell)
  }

  fn create_worker(&self) -> Arc<dyn Worker> {
    let executor = self.inner.pick();
    let parent = self.inner.clone();
    Arc::new_cyclic(|me| CachedWorker {
      executor,
      parent,
      tasks: Mutex::new(Some(Vec::new())),
      stopped: AtomicBool::new(false),
      me: me.clone(),
    })
  }

  fn shutdown(&self) { self.inner.shutdown(); }
}

struct ReleaseOnDrop {
  inner: Arc<CachedInner>,
  executor: Option<Arc<ExecutorHandle>>,
}

impl Drop for ReleaseOnDrop {
  fn drop(&mut self) {
    if let Some(executor) = self.executor.take() {
      self.inner.release(executor);
    }
  }
}

/// A worker on a cached executor. Tracks its in-flight tasks so `shutdown`
/// can cancel them before returning the executor to the cache.
struct CachedWorker {
  executor: Arc<ExecutorHandle>,
  parent: Arc<CachedInner>,
  tasks: Mutex<Option<Vec<Arc<TaskCell>>>>,
  stopped: AtomicBool,
  me: Weak<CachedWorker>,
}

impl CachedWorker {
  fn remove(&self, cell: &Arc<TaskCell>) {
    if self.stopped.load(Ordering::Acquire) {
      return;
    }
    if let Some(tasks) = self.tasks.lock().unwrap().as_mut() {
      tasks.retain(|t| !Arc::ptr_eq(t, cell));
    }
  }
}

impl Worker for CachedWorker {
  fn schedule(&self, task: Task) -> Result<Arc<dyn Disposable>, Rejected> {
    if self.stopped.load(Ordering::Acquire) {
      return Err(Rejected);
    }
    let cell = TaskCell::new(task, self.me.clone());
    {
      let mut tasks = self.tasks.lock().unwrap();
      match tasks.as_mut() {
        None => return Err(Rejected),
        Some(tasks) => tasks.push(cell.clone()),
      }
    }
    if self.executor.submit(cell.clone()).is_err() {
      self.remove(&cell);
      return Err(Rejected);
    }
    Ok(cell)
  }

  fn shutdown(&self) {
    if self.stopped.swap(true, Ordering::AcqRel) {
      return;
    }
    let pending = self.tasks.lock().unwrap().take();
    if let Some(pending) = pending {
      for cell in pending {
        cell.dispose();
      }
    }
    self.parent.release(self.executor.clone());
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::mpsc;

  fn run_and_join(worker: &Arc<dyn Worker>, f: impl FnOnce() + Send + 'static) {
    let (tx, rx) = mpsc::channel();
    worker
      .schedule(Box::new(move || {
        f();
        tx.send(()).unwrap();
      }))
      .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
  }

  #[test]
  fn worker_runs_tasks_in_submission_order() {
    let scheduler = CachedThreadScheduler::new();
    let worker = scheduler.create_worker();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..8 {
      let seen = seen.clone();
      worker
        .schedule(Box::new(move || seen.lock().unwrap().push(i)))
        .unwrap();
    }
    run_and_join(&worker, || {});
    assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    worker.shutdown();
    scheduler.shutdown();
  }

  #[test]
  fn disposed_pending_task_never_runs() {
    let scheduler = CachedThreadScheduler::new();
    let worker = scheduler.create_worker();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    worker
      .schedule(Box::new(move || {
        gate_rx.recv_timeout(Duration::from_secs(5)).ok();
      }))
      .unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let handle = worker
      .schedule(Box::new(move || flag.store(true, Ordering::SeqCst)))
      .unwrap();
    handle.dispose();
    assert!(handle.is_disposed());
    gate_tx.send(()).unwrap();
    run_and_join(&worker, || {});
    assert!(!ran.load(Ordering::SeqCst));
    worker.shutdown();
    scheduler.shutdown();
  }

  #[test]
  fn shutdown_worker_rejects_submissions() {
    let scheduler = CachedThreadScheduler::new();
    let worker = scheduler.create_worker();
    worker.shutdown();
    worker.shutdown();
    assert!(matches!(worker.schedule(Box::new(|| {})), Err(Rejected)));
    scheduler.shutdown();
  }

  #[test]
  fn shutdown_scheduler_rejects_everything() {
    let scheduler = CachedThreadScheduler::new();
    scheduler.shutdown();
    assert!(scheduler.schedule(Box::new(|| {})).is_err());
    let worker = scheduler.create_worker();
    assert!(matches!(worker.schedule(Box::new(|| {})), Err(Rejected)));
    worker.shutdown();
  }

  #[test]
  fn released_executor_is_reused() {
    let scheduler = CachedThreadScheduler::new();
    let first = scheduler.create_worker();
    let (tx, rx) = mpsc::channel();
    first
      .schedule(Box::new(move || {
        tx.send(thread::current().id()).unwrap();
      }))
      .unwrap();
    let first_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    first.shutdown();

    let second = scheduler.create_worker();
    let (tx, rx) = mpsc::channel();
    second
      .schedule(Box::new(move || {
        tx.send(thread::current().id()).unwrap();
      }))
      .unwrap();
    let second_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    second.shutdown();
    assert_eq!(first_thread, second_thread);
    scheduler.shutdown();
  }

  #[test]
  fn idle_executor_is_evicted_after_ttl() {
    let scheduler = CachedThreadScheduler::with_ttl(Duration::from_millis(50));
    let first = scheduler.create_worker();
    let (tx, rx) = mpsc::channel();
    first
      .schedule(Box::new(move || {
        tx.send(thread::current().id()).unwrap();
      }))
      .unwrap();
    let first_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    first.shutdown();

    thread::sleep(Duration::from_millis(400));

    let second = scheduler.create_worker();
    let (tx, rx) = mpsc::channel();
    second
      .schedule(Box::new(move || {
        tx.send(thread::current().id()).unwrap();
      }))
      .unwrap();
    let second_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    second.shutdown();
    assert_ne!(first_thread, second_thread);
    scheduler.shutdown();
  }

  #[test]
  fn direct_schedule_runs_and_releases() {
    let scheduler = CachedThreadScheduler::new();
    let (tx, rx) = mpsc::channel();
    scheduler
      .schedule(Box::new(move || tx.send(7).unwrap()))
      .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    scheduler.shutdown();
  }
}
