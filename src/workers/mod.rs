//! Worker: the module-independent skeleton of a long-lived task.
//!
//! A worker owns its thread, a store handle, its status and progress, and
//! the pause/interrupt signalling. Module behaviour is supplied through the
//! [`WorkerModule`] trait (init/tick/pause/unpause/clear hooks); the module
//! only ever sees a [`WorkerContext`], which exposes no signalling surface,
//! so a module cannot start, pause or stop itself.

pub mod analyzer;
pub mod crawler;
pub mod extractor;
pub mod parser;
pub mod supervisor;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::models::{ModuleKind, ThreadOptions, ThreadRow};
use crate::repository::{RepositoryError, Store};
use crate::utils::datetime::seconds_to_string;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0}")]
    Repository(#[from] RepositoryError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Fatal(String),
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// The module's work is complete; the worker idles but keeps its record.
    Finished,
}

/// Module-specific behaviour hooks.
pub trait WorkerModule: Send {
    fn on_init(&mut self, ctx: &mut WorkerContext, resumed: bool) -> Result<(), WorkerError>;
    fn on_tick(&mut self, ctx: &mut WorkerContext) -> Result<Tick, WorkerError>;
    fn on_pause(&mut self, _ctx: &mut WorkerContext) {}
    fn on_unpause(&mut self, _ctx: &mut WorkerContext) {}
    /// Final cleanup; must release every lease the module may still hold.
    fn on_clear(&mut self, ctx: &mut WorkerContext, interrupted: bool);
}

/// Signalling state shared between the worker thread and its handle.
struct Signals {
    running: AtomicBool,
    paused: AtomicBool,
    pause_allowed: AtomicBool,
    interrupted: AtomicBool,
    terminated: AtomicBool,
    finished: AtomicBool,
    pause_lock: Mutex<()>,
    pause_condition: Condvar,
    status: Mutex<String>,
}

impl Signals {
    fn new(paused: bool, status: String) -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(paused),
            pause_allowed: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_condition: Condvar::new(),
            status: Mutex::new(status),
        }
    }

    fn status(&self) -> String {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_status(&self, status: &str) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.to_string();
        }
    }

    fn wake(&self) {
        let _guard = self.pause_lock.lock();
        self.paused.store(false, Ordering::SeqCst);
        self.pause_condition.notify_one();
    }
}

/// Everything a module sees: its store handle, identity, options and status
/// reporting. No signalling methods live here.
pub struct WorkerContext {
    pub store: Store,
    id: u64,
    module: ModuleKind,
    pub options: ThreadOptions,
    pub website_namespace: String,
    pub urllist_namespace: String,
    pub config_body: String,
    last: u64,
    signals: Arc<Signals>,
}

impl WorkerContext {
    fn connect(db_path: &Path, row: &ThreadRow, signals: Arc<Signals>) -> Result<Self, WorkerError> {
        let mut store = Store::open(db_path)?;
        let website_namespace = store.get_website_namespace(row.options.website)?;
        let urllist_namespace = store.get_url_list_namespace(row.options.url_list)?;
        let config_body = store.get_configuration(row.options.config)?.config;
        Ok(Self {
            store,
            id: row.id,
            module: row.module,
            options: row.options,
            website_namespace,
            urllist_namespace,
            config_body,
            last: row.last,
            signals,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module(&self) -> ModuleKind {
        self.module
    }

    /// Whether the worker is still supposed to run; long inner loops must
    /// observe this and return promptly.
    pub fn is_running(&self) -> bool {
        self.signals.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        self.signals.status()
    }

    pub fn set_status(&mut self, status: &str) -> Result<(), WorkerError> {
        self.signals.set_status(status);
        let paused = self.signals.paused.load(Ordering::SeqCst);
        self.store.set_thread_status(self.id, paused, status)?;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: f64) -> Result<(), WorkerError> {
        Ok(self.store.set_thread_progress(self.id, progress)?)
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn set_last(&mut self, last: u64) -> Result<(), WorkerError> {
        self.last = last;
        Ok(self.store.set_thread_last(self.id, last)?)
    }

    /// Write a module log entry tagged with the worker id.
    pub fn log(&mut self, entry: &str) {
        let tagged = format!("[#{}] {entry}", self.id);
        if let Err(error) = self.store.log(self.module.as_str(), &tagged) {
            tracing::warn!(%error, "could not write log entry: {tagged}");
        }
    }

    /// Forbid or re-allow external pausing during a short critical section.
    pub fn set_pause_allowed(&mut self, allowed: bool) {
        self.signals.pause_allowed.store(allowed, Ordering::SeqCst);
    }
}

/// Accumulated run/pause time, flushed to the store at state changes so the
/// totals survive restarts.
struct Timing {
    run: Duration,
    pause: Duration,
    run_start: Option<Instant>,
    pause_start: Option<Instant>,
}

impl Timing {
    fn resume(run_secs: u64, pause_secs: u64) -> Self {
        Self {
            run: Duration::from_secs(run_secs),
            pause: Duration::from_secs(pause_secs),
            run_start: None,
            pause_start: None,
        }
    }

    fn start_running(&mut self) {
        self.run_start = Some(Instant::now());
    }

    fn start_pausing(&mut self) {
        self.pause_start = Some(Instant::now());
    }

    fn flush_run(&mut self, ctx: &mut WorkerContext) {
        if let Some(start) = self.run_start.take() {
            self.run += start.elapsed();
            if let Err(error) = ctx.store.set_thread_run_time(ctx.id, self.run.as_secs()) {
                tracing::warn!(%error, "could not persist run time");
            }
        }
    }

    fn flush_pause(&mut self, ctx: &mut WorkerContext) {
        if let Some(start) = self.pause_start.take() {
            self.pause += start.elapsed();
            if let Err(error) = ctx.store.set_thread_pause_time(ctx.id, self.pause.as_secs()) {
                tracing::warn!(%error, "could not persist pause time");
            }
        }
    }
}

/// A running worker, as seen by the supervisor. All signalling goes through
/// this handle; the worker thread itself has no access to it.
pub struct Worker {
    id: u64,
    module: ModuleKind,
    options: ThreadOptions,
    signals: Arc<Signals>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread for a persisted thread record. `resumed` marks
    /// a worker resurrected after a process restart.
    pub fn spawn(
        db_path: &Path,
        row: ThreadRow,
        resumed: bool,
        module_impl: Box<dyn WorkerModule>,
    ) -> Self {
        let signals = Arc::new(Signals::new(row.paused, row.status.clone()));
        let thread_signals = Arc::clone(&signals);
        let db_path: PathBuf = db_path.to_path_buf();
        let worker = Self {
            id: row.id,
            module: row.module,
            options: row.options,
            signals,
            handle: None,
        };
        let handle = std::thread::spawn(move || {
            run_worker(&db_path, row, resumed, thread_signals, module_impl);
        });
        Self {
            handle: Some(handle),
            ..worker
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module(&self) -> ModuleKind {
        self.module
    }

    pub fn website(&self) -> u64 {
        self.options.website
    }

    pub fn url_list(&self) -> u64 {
        self.options.url_list
    }

    pub fn status(&self) -> String {
        self.signals.status()
    }

    pub fn is_running(&self) -> bool {
        self.signals.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.signals.paused.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.signals.terminated.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.signals.finished.load(Ordering::SeqCst)
    }

    /// Pause the worker. Returns false if the worker currently forbids
    /// pausing (short critical section) or is already paused.
    pub fn pause(&self, store: &mut Store) -> Result<bool, RepositoryError> {
        if self.signals.paused.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if !self.signals.pause_allowed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.signals.paused.store(true, Ordering::SeqCst);
        store.set_thread_status(self.id, true, &self.signals.status())?;
        Ok(true)
    }

    /// Unpause the worker.
    pub fn unpause(&self, store: &mut Store) -> Result<bool, RepositoryError> {
        if !self.signals.paused.load(Ordering::SeqCst) {
            return Ok(false);
        }
        store.set_thread_status(self.id, false, &self.signals.status())?;
        self.signals.wake();
        Ok(true)
    }

    /// Stop the worker for good: join its thread and delete its record.
    pub fn stop(mut self, store: &mut Store) -> Result<(), RepositoryError> {
        self.signals.running.store(false, Ordering::SeqCst);
        self.signals.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        store.delete_thread(self.id)
    }

    /// Signal shutdown. The worker wakes if paused and exits at the next
    /// loop boundary; call [`Worker::finish_interrupt`] afterwards to join.
    /// Interrupting every worker first and joining afterwards lets them
    /// wind down in parallel.
    pub fn send_interrupt(&self) {
        if self.is_running() {
            self.signals.interrupted.store(true, Ordering::SeqCst);
            self.signals.running.store(false, Ordering::SeqCst);
            self.signals.wake();
        }
    }

    /// Wait for an interrupted (or terminated) worker to conclude.
    pub fn finish_interrupt(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    db_path: &Path,
    row: ThreadRow,
    resumed: bool,
    signals: Arc<Signals>,
    mut module_impl: Box<dyn WorkerModule>,
) {
    let mut ctx = match WorkerContext::connect(db_path, &row, Arc::clone(&signals)) {
        Ok(ctx) => ctx,
        Err(error) => {
            tracing::error!(worker = row.id, %error, "worker could not connect to the store");
            signals.terminated.store(true, Ordering::SeqCst);
            signals.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let run_secs = ctx.store.get_thread_run_time(row.id).unwrap_or(0);
    let pause_secs = ctx.store.get_thread_pause_time(row.id).unwrap_or(0);
    let mut timing = Timing::resume(run_secs, pause_secs);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        run_loop(&mut ctx, &mut *module_impl, resumed, &mut timing, &signals)
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            ctx.log(&format!("Failed - {error}."));
            timing.flush_run(&mut ctx);
            timing.flush_pause(&mut ctx);
            signals.terminated.store(true, Ordering::SeqCst);
        }
        Err(_) => {
            ctx.log("Failed - worker panicked.");
            timing.flush_run(&mut ctx);
            timing.flush_pause(&mut ctx);
            signals.terminated.store(true, Ordering::SeqCst);
        }
    }
    signals.running.store(false, Ordering::SeqCst);
}

fn run_loop(
    ctx: &mut WorkerContext,
    module_impl: &mut dyn WorkerModule,
    resumed: bool,
    timing: &mut Timing,
    signals: &Arc<Signals>,
) -> Result<(), WorkerError> {
    if let Err(error) = module_impl.on_init(ctx, resumed) {
        // initialization failures terminate the worker so the supervisor
        // reaps it and the website/URL list is no longer held busy
        let _ = ctx.set_status(&format!("FAILED {error}"));
        return Err(error);
    }

    timing.start_running();

    while signals.running.load(Ordering::SeqCst) {
        if signals.paused.load(Ordering::SeqCst) {
            timing.flush_run(ctx);
            timing.start_pausing();
            module_impl.on_pause(ctx);

            // no store writes happen while blocked here
            {
                let mut guard = signals
                    .pause_lock
                    .lock()
                    .map_err(|_| WorkerError::Fatal("pause lock poisoned".to_string()))?;
                while signals.paused.load(Ordering::SeqCst) {
                    guard = signals
                        .pause_condition
                        .wait(guard)
                        .map_err(|_| WorkerError::Fatal("pause lock poisoned".to_string()))?;
                }
            }

            if signals.running.load(Ordering::SeqCst) {
                module_impl.on_unpause(ctx);
            }
            timing.flush_pause(ctx);
            timing.start_running();
        } else if signals.finished.load(Ordering::SeqCst) {
            // work is complete; idle but keep the record until stopped
            std::thread::sleep(Duration::from_millis(500));
        } else {
            match module_impl.on_tick(ctx)? {
                Tick::Continue => {}
                Tick::Finished => {
                    signals.finished.store(true, Ordering::SeqCst);
                    ctx.set_status("FINISHED")?;
                }
            }
        }
    }

    timing.flush_run(ctx);
    module_impl.on_clear(ctx, signals.interrupted.load(Ordering::SeqCst));

    if signals.interrupted.load(Ordering::SeqCst) {
        let status = ctx.status();
        ctx.set_status(&format!("INTERRUPTED {status}"))?;
    } else {
        let mut message = format!("Stopped after {} running", seconds_to_string(timing.run.as_secs()));
        if !timing.pause.is_zero() {
            message.push_str(&format!(
                " and {} pausing",
                seconds_to_string(timing.pause.as_secs())
            ));
        }
        message.push('.');
        ctx.log(&message);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A worker context over a scratch database, detached from any thread.
    pub(crate) fn test_context(db_path: &Path, row: &ThreadRow) -> WorkerContext {
        let signals = Arc::new(Signals::new(false, String::new()));
        WorkerContext::connect(db_path, row, signals).expect("context fixture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    struct CountingModule {
        ticks: Arc<Mutex<u32>>,
        finish_after: u32,
    }

    impl WorkerModule for CountingModule {
        fn on_init(&mut self, _ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
            Ok(())
        }

        fn on_tick(&mut self, _ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
            let mut ticks = self.ticks.lock().unwrap();
            *ticks += 1;
            if *ticks >= self.finish_after {
                return Ok(Tick::Finished);
            }
            std::thread::sleep(Duration::from_millis(5));
            Ok(Tick::Continue)
        }

        fn on_clear(&mut self, _ctx: &mut WorkerContext, _interrupted: bool) {}
    }

    struct FailingModule;

    impl WorkerModule for FailingModule {
        fn on_init(&mut self, _ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
            Ok(())
        }

        fn on_tick(&mut self, _ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
            Err(WorkerError::Fatal("invariant violated".to_string()))
        }

        fn on_clear(&mut self, _ctx: &mut WorkerContext, _interrupted: bool) {}
    }

    fn fixture(store: &mut Store) -> ThreadRow {
        let website = store.add_website("News", "news", "example.com").unwrap();
        let list = store.add_url_list(website, "Main", "main").unwrap();
        let config = store
            .add_configuration(website, "crawler", "default", "[]")
            .unwrap();
        let options = ThreadOptions {
            website,
            url_list: list,
            config,
        };
        let id = store.add_thread(ModuleKind::Crawler, options).unwrap();
        ThreadRow {
            id,
            module: ModuleKind::Crawler,
            status: String::new(),
            paused: false,
            options,
            last: 0,
            run_time: 0,
            pause_time: 0,
            progress: 0.0,
        }
    }

    fn db_path(store: &Store) -> PathBuf {
        store.db_path().to_path_buf()
    }

    #[test]
    fn worker_runs_until_finished() {
        let (_dir, mut store) = scratch_store();
        let row = fixture(&mut store);
        let path = db_path(&store);
        let ticks = Arc::new(Mutex::new(0));

        let mut worker = Worker::spawn(
            &path,
            row,
            false,
            Box::new(CountingModule {
                ticks: Arc::clone(&ticks),
                finish_after: 3,
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.is_finished());
        assert_eq!(*ticks.lock().unwrap(), 3);

        worker.send_interrupt();
        worker.finish_interrupt();
    }

    #[test]
    fn interrupt_prefixes_status() {
        let (_dir, mut store) = scratch_store();
        let row = fixture(&mut store);
        let id = row.id;
        let path = db_path(&store);
        let ticks = Arc::new(Mutex::new(0));

        let mut worker = Worker::spawn(
            &path,
            row,
            false,
            Box::new(CountingModule {
                ticks,
                finish_after: u32::MAX,
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        worker.send_interrupt();
        worker.finish_interrupt();

        let rows = store.get_threads().unwrap();
        let row = rows.iter().find(|t| t.id == id).unwrap();
        assert!(row.status.starts_with("INTERRUPTED"), "status: {}", row.status);
    }

    #[test]
    fn tick_error_terminates_worker() {
        let (_dir, mut store) = scratch_store();
        let row = fixture(&mut store);
        let path = db_path(&store);

        let mut worker = Worker::spawn(&path, row, false, Box::new(FailingModule));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_terminated() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.is_terminated());
        worker.finish_interrupt();

        // the failure is in the module log
        let count = store.count_log_entries("crawler").unwrap();
        assert!(count > 0);
    }

    #[test]
    fn pause_and_unpause_round_trip() {
        let (_dir, mut store) = scratch_store();
        let row = fixture(&mut store);
        let path = db_path(&store);
        let ticks = Arc::new(Mutex::new(0));

        let mut worker = Worker::spawn(
            &path,
            row,
            false,
            Box::new(CountingModule {
                ticks: Arc::clone(&ticks),
                finish_after: u32::MAX,
            }),
        );
        std::thread::sleep(Duration::from_millis(30));

        assert!(worker.pause(&mut store).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        let paused_at = *ticks.lock().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // no ticks while paused
        assert_eq!(*ticks.lock().unwrap(), paused_at);

        assert!(worker.unpause(&mut store).unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while *ticks.lock().unwrap() == paused_at && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(*ticks.lock().unwrap() > paused_at);

        worker.send_interrupt();
        worker.finish_interrupt();
    }
}
