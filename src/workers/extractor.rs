//! Extractor: issues secondary requests derived from parsed data.
//!
//! The module body is deliberately thin; it exercises the shared supervisor
//! contract and the extract lease so that parsed URLs move through the
//! pipeline.

use std::time::{Duration, Instant};

use crate::models::{ConfigEntry, UrlRef};
use crate::repository::{parse_config_entries, ListTables};
use crate::utils::config_reader::ConfigReader;
use crate::workers::{Tick, WorkerContext, WorkerError, WorkerModule};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub logging: u64,
    pub lock_ttl: u64,
    pub sleep_idle: u64,
    pub sleep_db: u64,
}

impl ExtractorConfig {
    pub fn from_entries(entries: &[ConfigEntry]) -> (Self, Vec<String>) {
        let mut reader = ConfigReader::new(entries);
        let config = ExtractorConfig {
            logging: reader.u64("general", "logging", 1),
            lock_ttl: reader.u64("general", "lock", 300),
            sleep_idle: reader.u64("general", "sleep.idle", 5000),
            sleep_db: reader.u64("general", "sleep.mysql", 20),
        };
        (config, reader.take_warnings())
    }
}

pub struct Extractor {
    config: ExtractorConfig,
    tables: ListTables,
    current_url: UrlRef,
    lock_expiry: String,
    idle_since: Option<Instant>,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            config: ExtractorConfig::from_entries(&[]).0,
            tables: ListTables::new("none", "none"),
            current_url: UrlRef::default(),
            lock_expiry: String::new(),
            idle_since: None,
        }
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerModule for Extractor {
    fn on_init(&mut self, ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
        let entries = parse_config_entries(&ctx.config_body)
            .map_err(|e| WorkerError::Config(format!("could not parse configuration: {e}")))?;
        let (config, warnings) = ExtractorConfig::from_entries(&entries);
        self.config = config;
        if self.config.logging > 0 {
            for warning in &warnings {
                ctx.log(&format!("WARNING: {warning}"));
            }
        }
        ctx.store
            .set_sleep_on_error(Duration::from_secs(self.config.sleep_db));
        self.tables = ListTables::new(&ctx.website_namespace, &ctx.urllist_namespace);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
        let mut scan_after = ctx.last();
        let mut selected = None;
        loop {
            if !ctx.is_running() {
                break;
            }
            match ctx
                .store
                .next_url(&self.tables, ctx.module(), scan_after, false)?
            {
                Some(candidate) => {
                    match ctx.store.lock_url(
                        &self.tables,
                        ctx.module(),
                        candidate.id,
                        Duration::from_secs(self.config.lock_ttl),
                    )? {
                        Some(expiry) => {
                            self.lock_expiry = expiry;
                            selected = Some(candidate);
                            break;
                        }
                        None => {
                            if self.config.logging > 0 {
                                ctx.log(&format!(
                                    "skipped {}, because it is locked.",
                                    candidate.url
                                ));
                            }
                            scan_after = candidate.id;
                        }
                    }
                }
                None => break,
            }
        }

        match selected {
            Some(url) => {
                self.idle_since = None;
                self.current_url = url.clone();
                ctx.set_status(&url.url)?;

                ctx.store
                    .finish_url(&self.tables, ctx.module(), url.id, &self.lock_expiry)?;
                ctx.store
                    .release_url(&self.tables, ctx.module(), url.id, &self.lock_expiry)?;
                self.lock_expiry.clear();
                self.current_url.clear();

                ctx.set_last(url.id)?;
                let position = ctx.store.url_position(&self.tables, url.id)?;
                let total = ctx.store.url_count(&self.tables)?;
                if total > 0 {
                    ctx.set_progress((position + 1) as f64 / total as f64)?;
                }
            }
            None => {
                if self.idle_since.is_none() {
                    self.idle_since = Some(Instant::now());
                }
                ctx.set_status("IDLE Waiting for new URLs to extract.")?;
                ctx.set_progress(1.0)?;
                std::thread::sleep(Duration::from_millis(self.config.sleep_idle));
            }
        }
        Ok(Tick::Continue)
    }

    fn on_clear(&mut self, ctx: &mut WorkerContext, _interrupted: bool) {
        if !self.lock_expiry.is_empty() && self.current_url.is_set() {
            let _ = ctx.store.release_url(
                &self.tables,
                ctx.module(),
                self.current_url.id,
                &self.lock_expiry,
            );
            self.lock_expiry.clear();
        }
    }
}
