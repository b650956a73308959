//! Analyzer: runs one algorithmic pass over previously produced data.
//!
//! The corpus pass walks every crawled URL under the analyze lease, reduces
//! its newest content to plain text, and appends it to an analyzed target
//! table. When the list is exhausted the worker reports itself finished and
//! idles.

use std::time::Duration;

use scraper::Html;

use crate::models::ConfigEntry;
use crate::repository::{parse_config_entries, ListTables, TargetKind};
use crate::utils::config_reader::ConfigReader;
use crate::workers::{Tick, WorkerContext, WorkerError, WorkerModule};

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub logging: u64,
    pub lock_ttl: u64,
    pub result_table: String,
    pub sleep_db: u64,
}

impl AnalyzerConfig {
    pub fn from_entries(entries: &[ConfigEntry]) -> (Self, Vec<String>) {
        let mut reader = ConfigReader::new(entries);
        let config = AnalyzerConfig {
            logging: reader.u64("general", "logging", 1),
            lock_ttl: reader.u64("general", "lock", 300),
            result_table: reader.string("general", "result.table", "corpus"),
            sleep_db: reader.u64("general", "sleep.mysql", 20),
        };
        (config, reader.take_warnings())
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
    tables: ListTables,
    target_table: String,
    current_url: crate::models::UrlRef,
    lock_expiry: String,
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            config: AnalyzerConfig::from_entries(&[]).0,
            tables: ListTables::new("none", "none"),
            target_table: String::new(),
            current_url: crate::models::UrlRef::default(),
            lock_expiry: String::new(),
        }
    }

    /// Reduce a document to its visible text.
    fn text_of(content: &str) -> String {
        let doc = Html::parse_document(content);
        doc.root_element().text().collect::<Vec<_>>().concat()
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerModule for Analyzer {
    fn on_init(&mut self, ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
        let entries = parse_config_entries(&ctx.config_body)
            .map_err(|e| WorkerError::Config(format!("could not parse configuration: {e}")))?;
        let (config, warnings) = AnalyzerConfig::from_entries(&entries);
        self.config = config;
        if self.config.logging > 0 {
            for warning in &warnings {
                ctx.log(&format!("WARNING: {warning}"));
            }
        }

        ctx.store
            .set_sleep_on_error(Duration::from_secs(self.config.sleep_db));
        self.tables = ListTables::new(&ctx.website_namespace, &ctx.urllist_namespace);

        // algorithm initialization is a short critical section
        ctx.set_pause_allowed(false);
        let result = ctx.store.init_target_table(
            TargetKind::Analyzed,
            ctx.options.website,
            ctx.options.url_list,
            &self.config.result_table.clone(),
            &["text".to_string()],
        );
        ctx.set_pause_allowed(true);
        self.target_table = result?;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
        let mut scan_after = ctx.last();
        loop {
            if !ctx.is_running() {
                return Ok(Tick::Continue);
            }
            let Some(candidate) = ctx
                .store
                .next_url(&self.tables, ctx.module(), scan_after, false)?
            else {
                // corpus complete
                if self.config.logging > 0 {
                    ctx.log("corpus pass finished.");
                }
                return Ok(Tick::Finished);
            };

            match ctx.store.lock_url(
                &self.tables,
                ctx.module(),
                candidate.id,
                Duration::from_secs(self.config.lock_ttl),
            )? {
                Some(expiry) => {
                    self.lock_expiry = expiry;
                    self.current_url = candidate.clone();
                    ctx.set_status(&candidate.url)?;

                    if let Some((content_id, content)) =
                        ctx.store.latest_content(&self.tables, candidate.id)?
                    {
                        let text = Self::text_of(&content);
                        ctx.store.upsert_target_row(
                            TargetKind::Analyzed,
                            &self.target_table,
                            content_id,
                            &candidate.id.to_string(),
                            None,
                            &[("text".to_string(), text)],
                        )?;
                    }

                    ctx.store
                        .finish_url(&self.tables, ctx.module(), candidate.id, &self.lock_expiry)?;
                    ctx.store
                        .release_url(&self.tables, ctx.module(), candidate.id, &self.lock_expiry)?;
                    self.lock_expiry.clear();
                    self.current_url.clear();

                    ctx.set_last(candidate.id)?;
                    let position = ctx.store.url_position(&self.tables, candidate.id)?;
                    let total = ctx.store.url_count(&self.tables)?;
                    if total > 0 {
                        ctx.set_progress((position + 1) as f64 / total as f64)?;
                    }
                    return Ok(Tick::Continue);
                }
                None => {
                    if self.config.logging > 0 {
                        ctx.log(&format!("skipped {}, because it is locked.", candidate.url));
                    }
                    scan_after = candidate.id;
                }
            }
        }
    }

    fn on_clear(&mut self, ctx: &mut WorkerContext, _interrupted: bool) {
        if !self.lock_expiry.is_empty() && self.current_url.is_set() {
            let _ = ctx.store.release_url(
                &self.tables,
                ctx.module(),
                self.current_url.id,
                &self.lock_expiry,
            );
        }
        self.lock_expiry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_extraction_drops_markup() {
        let text = Analyzer::text_of("<html><body><p>Hello <b>world</b></p></body></html>");
        assert_eq!(text, "Hello world");
    }
}
