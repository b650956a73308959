//! Supervisor: the process-wide registry of workers.
//!
//! Launches, signals and reaps workers, resurrects the workers recorded in
//! the store on startup, and joins short-lived query-test threads. All
//! interaction with a worker goes through its signalling handle; the
//! supervisor never touches worker-internal state.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::ServerSettings;
use crate::models::{ModuleKind, ThreadOptions, ThreadRow};
use crate::repository::{RepositoryError, Store};
use crate::workers::{
    analyzer::Analyzer, crawler::Crawler, extractor::Extractor, parser::Parser, Worker,
    WorkerModule,
};

fn make_module(kind: ModuleKind) -> Box<dyn WorkerModule> {
    match kind {
        ModuleKind::Crawler => Box::new(Crawler::new()),
        ModuleKind::Parser => Box::new(Parser::new()),
        ModuleKind::Extractor => Box::new(Extractor::new()),
        ModuleKind::Analyzer => Box::new(Analyzer::new()),
    }
}

pub struct Supervisor {
    db_path: PathBuf,
    store: Store,
    settings: ServerSettings,
    allowed: String,
    workers: Vec<Worker>,
    query_tests: Vec<JoinHandle<()>>,
    status: String,
    running: bool,
    started_at: Instant,
}

impl Supervisor {
    /// Connect to the store, initialise the schema, and resurrect every
    /// worker recorded in the threads table in its stored paused/running
    /// state.
    pub fn new(db_path: &Path, settings: ServerSettings) -> Result<Self, RepositoryError> {
        // persistent cookie jars land here when a fetcher is configured
        // with one
        if let Err(error) = std::fs::create_dir_all("cookies") {
            tracing::warn!(%error, "could not create cookies directory");
        }

        let mut store = Store::open(db_path)?;
        store.init_schema()?;

        let mut supervisor = Self {
            db_path: db_path.to_path_buf(),
            allowed: settings.allowed_clients.clone(),
            settings,
            store,
            workers: Vec::new(),
            query_tests: Vec::new(),
            status: "webacquire is ready".to_string(),
            running: true,
            started_at: Instant::now(),
        };

        for row in supervisor.store.get_threads()? {
            let id = row.id;
            let module = row.module;
            let worker = Worker::spawn(&supervisor.db_path, row, true, make_module(module));
            supervisor.workers.push(worker);
            supervisor
                .store
                .log(module.as_str(), &format!("#{id} continued."))?;
        }

        supervisor.store.log("server", "Server started.")?;
        Ok(supervisor)
    }

    pub fn store(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Stop the supervisor loop; workers are wound down by [`Self::shutdown`].
    pub fn kill(&mut self) {
        self.running = false;
    }

    // ------------------------------------------------------------------
    // IP allow list
    // ------------------------------------------------------------------

    pub fn is_allowed(&self, ip: &str) -> bool {
        self.allowed
            .split(',')
            .map(str::trim)
            .any(|allowed| allowed == "*" || allowed == ip)
    }

    pub fn allowed_list(&self) -> &str {
        &self.allowed
    }

    pub fn allow_ip(&mut self, ip: &str) {
        self.allowed.push(',');
        self.allowed.push_str(ip);
    }

    /// Revoke access from all but the clients of the configuration file.
    pub fn disallow_ips(&mut self) {
        self.allowed = self.settings.allowed_clients.clone();
    }

    // ------------------------------------------------------------------
    // worker management
    // ------------------------------------------------------------------

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// The module of a running worker bound to this website, if any.
    pub fn website_busy(&self, website: u64) -> Option<ModuleKind> {
        self.workers
            .iter()
            .find(|w| w.website() == website)
            .map(|w| w.module())
    }

    /// The module of a running worker bound to this URL list, if any.
    pub fn url_list_busy(&self, url_list: u64) -> Option<ModuleKind> {
        self.workers
            .iter()
            .find(|w| w.url_list() == url_list)
            .map(|w| w.module())
    }

    /// Create and start a new worker; returns its id.
    pub fn start_worker(
        &mut self,
        module: ModuleKind,
        options: ThreadOptions,
    ) -> Result<u64, RepositoryError> {
        let id = self.store.add_thread(module, options)?;
        let row = ThreadRow {
            id,
            module,
            status: String::new(),
            paused: false,
            options,
            last: 0,
            run_time: 0,
            pause_time: 0,
            progress: 0.0,
        };
        self.workers
            .push(Worker::spawn(&self.db_path, row, false, make_module(module)));
        Ok(id)
    }

    fn find_worker(&self, module: ModuleKind, id: u64) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.module() == module && w.id() == id)
    }

    /// Pause a worker; `None` if there is no such worker.
    pub fn pause_worker(
        &mut self,
        module: ModuleKind,
        id: u64,
    ) -> Result<Option<bool>, RepositoryError> {
        match self.find_worker(module, id) {
            Some(index) => {
                let paused = self.workers[index].pause(&mut self.store)?;
                Ok(Some(paused))
            }
            None => Ok(None),
        }
    }

    /// Unpause a worker; `None` if there is no such worker.
    pub fn unpause_worker(
        &mut self,
        module: ModuleKind,
        id: u64,
    ) -> Result<Option<bool>, RepositoryError> {
        match self.find_worker(module, id) {
            Some(index) => {
                let unpaused = self.workers[index].unpause(&mut self.store)?;
                Ok(Some(unpaused))
            }
            None => Ok(None),
        }
    }

    /// Stop a worker for good and delete its record; `None` if not found.
    pub fn stop_worker(
        &mut self,
        module: ModuleKind,
        id: u64,
    ) -> Result<Option<()>, RepositoryError> {
        match self.find_worker(module, id) {
            Some(index) => {
                let worker = self.workers.remove(index);
                worker.stop(&mut self.store)?;
                Ok(Some(()))
            }
            None => Ok(None),
        }
    }

    /// Adopt a short-lived query-test thread; joined by the tick loop.
    pub fn adopt_query_test(&mut self, handle: JoinHandle<()>) {
        self.query_tests.push(handle);
    }

    /// One supervisor tick (~1 Hz): reap concluded workers and join
    /// completed query-test threads.
    pub fn tick(&mut self) {
        let mut index = 0;
        while index < self.workers.len() {
            if self.workers[index].is_terminated() {
                let mut worker = self.workers.remove(index);
                worker.finish_interrupt();
                tracing::warn!(
                    worker = worker.id(),
                    module = worker.module().as_str(),
                    "reaped terminated worker"
                );
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.query_tests.len() {
            if self.query_tests[index].is_finished() {
                let handle = self.query_tests.swap_remove(index);
                let _ = handle.join();
            } else {
                index += 1;
            }
        }
    }

    /// Interrupt every worker, then join all of them. No thread is left
    /// detached.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.send_interrupt();
        }
        for worker in &mut self.workers {
            let id = worker.id();
            let module = worker.module();
            worker.finish_interrupt();
            let _ = self.store.log(module.as_str(), &format!("[#{id}] interrupted."));
        }
        self.workers.clear();

        for handle in self.query_tests.drain(..) {
            let _ = handle.join();
        }

        let _ = self.store.log("server", "Server stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ServerSettings {
        ServerSettings {
            port: 0,
            allowed_clients: "127.0.0.1".to_string(),
            logs_deletable: true,
            data_deletable: true,
        }
    }

    #[test]
    fn allow_list_management() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor =
            Supervisor::new(&dir.path().join("db.sqlite3"), settings()).unwrap();

        assert!(supervisor.is_allowed("127.0.0.1"));
        assert!(!supervisor.is_allowed("10.0.0.1"));

        supervisor.allow_ip("10.0.0.1");
        assert!(supervisor.is_allowed("10.0.0.1"));

        supervisor.disallow_ips();
        assert!(!supervisor.is_allowed("10.0.0.1"));

        let mut wildcard = settings();
        wildcard.allowed_clients = "*".to_string();
        let supervisor2 =
            Supervisor::new(&dir.path().join("db2.sqlite3"), wildcard).unwrap();
        assert!(supervisor2.is_allowed("203.0.113.9"));
    }

    #[test]
    fn resurrection_spawns_one_worker_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.sqlite3");
        let options;
        {
            let mut store = Store::open(&db).unwrap();
            store.init_schema().unwrap();
            let website = store.add_website("News", "news", "example.com").unwrap();
            let list = store.add_url_list(website, "Main", "main").unwrap();
            let config = store
                .add_configuration(website, "extractor", "default", "[]")
                .unwrap();
            options = ThreadOptions {
                website,
                url_list: list,
                config,
            };
            let id = store.add_thread(ModuleKind::Extractor, options).unwrap();
            store.set_thread_status(id, true, "INTERRUPTED previous run").unwrap();
            // mark the stored record paused so the resurrected worker waits
            store.set_thread_last(id, 3).unwrap();
        }

        let mut supervisor = Supervisor::new(&db, settings()).unwrap();
        assert_eq!(supervisor.workers().len(), 1);
        let worker = &supervisor.workers()[0];
        assert_eq!(worker.module(), ModuleKind::Extractor);
        assert!(worker.is_paused());
        assert!(worker.status().starts_with("PAUSED INTERRUPTED"));

        supervisor.shutdown();
    }
}
