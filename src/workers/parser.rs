//! Parser: transforms stored crawled content into structured fields.
//!
//! Selects URLs under the parse lease, runs id, date/time and field queries
//! against the URL string or the stored content, and writes one row per
//! content into the configuration's parsed target table.

use std::time::{Duration, Instant};

use scraper::Html;

use crate::models::{ConfigEntry, QueryKind, UrlRef};
use crate::queries::CompiledQuery;
use crate::repository::{parse_config_entries, ListTables, TargetKind};
use crate::utils::config_reader::ConfigReader;
use crate::utils::datetime::convert_custom_datetime;
use crate::workers::{Tick, WorkerContext, WorkerError, WorkerModule};

/// Query source: the URL string or the stored content.
const SOURCE_URL: u64 = 0;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub logging: u64,
    pub lock_ttl: u64,
    pub newest_only: bool,
    pub reparse: bool,
    pub result_table: String,
    pub sleep_idle: u64,
    pub sleep_db: u64,
    pub timing: bool,
    pub id_queries: Vec<u64>,
    pub id_sources: Vec<u64>,
    pub datetime_queries: Vec<u64>,
    pub datetime_formats: Vec<String>,
    pub datetime_sources: Vec<u64>,
    pub field_names: Vec<String>,
    pub field_queries: Vec<u64>,
    pub field_sources: Vec<u64>,
}

impl ParserConfig {
    pub fn from_entries(entries: &[ConfigEntry]) -> (Self, Vec<String>) {
        let mut reader = ConfigReader::new(entries);
        let config = ParserConfig {
            logging: reader.u64("general", "logging", 1),
            lock_ttl: reader.u64("general", "lock", 300),
            newest_only: reader.bool("general", "newest.only", true),
            reparse: reader.bool("general", "reparse", false),
            result_table: reader.string("general", "result.table", ""),
            sleep_idle: reader.u64("general", "sleep.idle", 5000),
            sleep_db: reader.u64("general", "sleep.mysql", 20),
            timing: reader.bool("general", "timing", false),
            id_queries: reader.u64s("parser", "id.queries"),
            id_sources: reader.u64s("parser", "id.sources"),
            datetime_queries: reader.u64s("parser", "datetime.queries"),
            datetime_formats: reader.strings("parser", "datetime.formats"),
            datetime_sources: reader.u64s("parser", "datetime.sources"),
            field_names: reader.strings("parser", "field.names"),
            field_queries: reader.u64s("parser", "field.queries"),
            field_sources: reader.u64s("parser", "field.sources"),
        };
        (config, reader.take_warnings())
    }
}

pub struct Parser {
    config: ParserConfig,
    tables: ListTables,
    target_table: String,
    id_queries: Vec<CompiledQuery>,
    datetime_queries: Vec<CompiledQuery>,
    field_queries: Vec<CompiledQuery>,

    current_url: UrlRef,
    lock_expiry: String,
    tick_counter: u64,
    idle_since: Option<Instant>,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            config: ParserConfig::from_entries(&[]).0,
            tables: ListTables::new("none", "none"),
            target_table: String::new(),
            id_queries: Vec::new(),
            datetime_queries: Vec::new(),
            field_queries: Vec::new(),
            current_url: UrlRef::default(),
            lock_expiry: String::new(),
            tick_counter: 0,
            idle_since: None,
        }
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl)
    }

    fn compile_list(
        &self,
        ctx: &mut WorkerContext,
        ids: &[u64],
    ) -> Result<Vec<CompiledQuery>, WorkerError> {
        let mut compiled = Vec::with_capacity(ids.len());
        for id in ids {
            let props = ctx.store.get_query_properties(*id)?;
            compiled.push(
                CompiledQuery::compile(&props)
                    .map_err(|e| WorkerError::Config(format!("query #{id}: {e}")))?,
            );
        }
        Ok(compiled)
    }

    fn select_url(&mut self, ctx: &mut WorkerContext) -> Result<bool, WorkerError> {
        let mut log_entries = Vec::new();
        let mut scan_after = ctx.last();
        let mut found = false;

        loop {
            if !ctx.is_running() {
                break;
            }
            match ctx
                .store
                .next_url(&self.tables, ctx.module(), scan_after, self.config.reparse)?
            {
                Some(candidate) => {
                    if let Some(expiry) = ctx.store.lock_url(
                        &self.tables,
                        ctx.module(),
                        candidate.id,
                        self.lock_ttl(),
                    )? {
                        self.lock_expiry = expiry;
                        self.current_url = candidate;
                        found = true;
                        break;
                    }
                    log_entries.push(format!("skipped {}, because it is locked.", candidate.url));
                    scan_after = candidate.id;
                }
                None => break,
            }
        }

        if self.config.logging > 0 {
            for entry in log_entries {
                ctx.log(&entry);
            }
        }
        if found {
            let status = self.current_url.url.clone();
            ctx.set_status(&status)?;
        } else {
            ctx.set_status("IDLE Waiting for new URLs to parse.")?;
            ctx.set_progress(1.0)?;
        }
        Ok(found)
    }

    /// Run one single-result query against the URL or a content string.
    fn first_result(
        &self,
        ctx: &mut WorkerContext,
        query: &CompiledQuery,
        source: u64,
        content: &str,
        doc: &Html,
        what: &str,
    ) -> Option<String> {
        if !query.result_single && self.config.logging > 0 {
            ctx.log(&format!("WARNING: Invalid result type of {what} query (not single)."));
        }
        let url = &self.current_url.url;
        let outcome = if source == SOURCE_URL {
            match query.kind {
                QueryKind::Regex => query.match_first(url),
                QueryKind::XPath => {
                    if self.config.logging > 0 {
                        ctx.log(&format!("WARNING: {what} query on URL is not of type RegEx."));
                    }
                    Ok(None)
                }
            }
        } else {
            match query.kind {
                QueryKind::Regex => query.match_first(content),
                QueryKind::XPath => query.select_first(doc),
            }
        };
        match outcome {
            Ok(result) => result.filter(|r| !r.is_empty()),
            Err(e) => {
                if self.config.logging > 0 {
                    ctx.log(&format!("{e} [{url}]."));
                }
                None
            }
        }
    }

    /// Parse one content row; returns whether a row was written.
    fn parse_content(
        &self,
        ctx: &mut WorkerContext,
        content_id: u64,
        content: &str,
    ) -> Result<bool, WorkerError> {
        let doc = Html::parse_document(content);

        // id: first id query that yields a non-empty single result
        let mut parsed_id = String::new();
        for (i, query) in self.id_queries.iter().enumerate() {
            let source = self.config.id_sources.get(i).copied().unwrap_or(1);
            if let Some(id) = self.first_result(ctx, query, source, content, &doc, "ID") {
                parsed_id = id;
                break;
            }
        }
        if parsed_id.is_empty() {
            return Ok(false);
        }

        // date/time: first query whose result converts to a SQL timestamp
        let mut parsed_datetime = None;
        for (i, query) in self.datetime_queries.iter().enumerate() {
            let source = self.config.datetime_sources.get(i).copied().unwrap_or(1);
            if let Some(raw) = self.first_result(ctx, query, source, content, &doc, "DateTime") {
                let format = self
                    .config
                    .datetime_formats
                    .get(i)
                    .map(String::as_str)
                    .unwrap_or("");
                match convert_custom_datetime(&raw, format) {
                    Some(timestamp) => {
                        parsed_datetime = Some(timestamp);
                        break;
                    }
                    None => {
                        if self.config.logging > 0 {
                            ctx.log(&format!(
                                "WARNING: Could not convert date/time '{raw}' [{}].",
                                self.current_url.url
                            ));
                        }
                    }
                }
            }
        }

        // fields: one column per configured field query
        let mut fields = Vec::with_capacity(self.field_queries.len());
        for (i, query) in self.field_queries.iter().enumerate() {
            let Some(name) = self.config.field_names.get(i) else {
                continue;
            };
            let source = self.config.field_sources.get(i).copied().unwrap_or(1);
            let url = &self.current_url.url;
            let value = if query.result_multi {
                let outcome = if source == SOURCE_URL {
                    query.match_all(url)
                } else {
                    match query.kind {
                        QueryKind::Regex => query.match_all(content),
                        QueryKind::XPath => query.select_all(&doc),
                    }
                };
                match outcome {
                    Ok(values) => values.join("\n"),
                    Err(e) => {
                        if self.config.logging > 0 {
                            ctx.log(&format!("{e} [{url}]."));
                        }
                        String::new()
                    }
                }
            } else {
                self.first_result(ctx, query, source, content, &doc, "field")
                    .unwrap_or_default()
            };
            fields.push((name.clone(), value));
        }

        ctx.store.upsert_target_row(
            TargetKind::Parsed,
            &self.target_table,
            content_id,
            &parsed_id,
            parsed_datetime.as_deref(),
            &fields,
        )?;
        Ok(true)
    }

    fn parse_current(&mut self, ctx: &mut WorkerContext) -> Result<u64, WorkerError> {
        let url_id = self.current_url.id;
        if self.config.newest_only {
            match ctx.store.latest_content(&self.tables, url_id)? {
                Some((content_id, content)) => {
                    Ok(self.parse_content(ctx, content_id, &content)? as u64)
                }
                None => Ok(0),
            }
        } else {
            let mut parsed = 0;
            for (content_id, content) in ctx.store.all_contents(&self.tables, url_id)? {
                if !ctx.is_running() {
                    break;
                }
                if self.parse_content(ctx, content_id, &content)? {
                    parsed += 1;
                }
            }
            Ok(parsed)
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerModule for Parser {
    fn on_init(&mut self, ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
        let entries = parse_config_entries(&ctx.config_body)
            .map_err(|e| WorkerError::Config(format!("could not parse configuration: {e}")))?;
        let (config, warnings) = ParserConfig::from_entries(&entries);
        self.config = config;
        if self.config.logging > 0 {
            for warning in &warnings {
                ctx.log(&format!("WARNING: {warning}"));
            }
        }
        if self.config.result_table.is_empty() {
            return Err(WorkerError::Config("no result table specified".to_string()));
        }
        if self.config.id_queries.is_empty() {
            return Err(WorkerError::Config("no ID query specified".to_string()));
        }

        ctx.store
            .set_sleep_on_error(Duration::from_secs(self.config.sleep_db));
        self.tables = ListTables::new(&ctx.website_namespace, &ctx.urllist_namespace);
        self.target_table = ctx.store.init_target_table(
            TargetKind::Parsed,
            ctx.options.website,
            ctx.options.url_list,
            &self.config.result_table.clone(),
            &self.config.field_names.clone(),
        )?;

        self.id_queries = self.compile_list(ctx, &self.config.id_queries.clone())?;
        self.datetime_queries = self.compile_list(ctx, &self.config.datetime_queries.clone())?;
        self.field_queries = self.compile_list(ctx, &self.config.field_queries.clone())?;
        self.tick_counter = 0;
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
        let tick_start = Instant::now();
        if self.select_url(ctx)? {
            self.idle_since = None;
            self.tick_counter += 1;
            let url = self.current_url.clone();
            if self.config.logging > 1 {
                ctx.log(&format!("parses {}...", url.url));
            }

            let parsed = self.parse_current(ctx)?;

            ctx.store
                .finish_url(&self.tables, ctx.module(), url.id, &self.lock_expiry)?;
            ctx.store
                .release_url(&self.tables, ctx.module(), url.id, &self.lock_expiry)?;
            self.lock_expiry.clear();

            ctx.set_last(url.id)?;
            let position = ctx.store.url_position(&self.tables, url.id)?;
            let total = ctx.store.url_count(&self.tables)?;
            if total > 0 {
                ctx.set_progress((position + 1) as f64 / total as f64)?;
            }

            if self.config.logging > 1 || (self.config.timing && self.config.logging > 0) {
                let mut message = match parsed {
                    0 => format!("skipped {}", url.url),
                    1 => format!("parsed {}", url.url),
                    n => format!("parsed {n} versions of {}", url.url),
                };
                if self.config.timing {
                    message.push_str(&format!(
                        " in {}",
                        crate::utils::datetime::ms_to_string(tick_start.elapsed().as_millis() as u64)
                    ));
                }
                ctx.log(&message);
            } else if self.config.logging > 0 && parsed == 0 {
                ctx.log(&format!("skipped {}", url.url));
            }
        } else {
            if self.idle_since.is_none() {
                self.idle_since = Some(Instant::now());
            }
            std::thread::sleep(Duration::from_millis(self.config.sleep_idle));
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
        self.id_queries.clear();
        self.datetime_queries.clear();
        self.field_queries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let (config, warnings) = ParserConfig::from_entries(&[]);
        assert!(config.newest_only);
        assert!(!config.reparse);
        assert_eq!(config.lock_ttl, 300);
        assert!(warnings.is_empty());
    }

    #[test]
    fn config_reads_queries() {
        let entries: Vec<ConfigEntry> = serde_json::from_str(
            r#"[
                {"cat":"general","name":"result.table","value":"articles"},
                {"cat":"parser","name":"id.queries","value":[3]},
                {"cat":"parser","name":"id.sources","value":[0]},
                {"cat":"parser","name":"field.names","value":["title"]},
                {"cat":"parser","name":"field.queries","value":[4]}
            ]"#,
        )
        .unwrap();
        let (config, _) = ParserConfig::from_entries(&entries);
        assert_eq!(config.result_table, "articles");
        assert_eq!(config.id_queries, vec![3]);
        assert_eq!(config.id_sources, vec![0]);
        assert_eq!(config.field_names, vec!["title"]);
    }
}
