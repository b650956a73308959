//! Crawler: the concrete worker fetching HTML for the URLs of one URL list,
//! persisting raw content, and discovering further URLs via link-extraction
//! queries. Archive captures of every URL are walked through the Memento
//! protocol when configured.

mod archive;
pub mod config;
pub mod links;
pub mod mementos;

use std::time::{Duration, Instant};

use scraper::Html;

use crate::fetcher::{FetchError, FetchedResponse, Fetcher, NetworkConfig};
use crate::models::{QueryKind, UrlRef};
use crate::queries::CompiledQuery;
use crate::repository::{parse_config_entries, ListTables, MAX_URL_LENGTH};
use crate::utils::datetime::ms_to_string;
use crate::workers::{Tick, WorkerContext, WorkerError, WorkerModule};

use self::config::CrawlerConfig;
use self::links::{clean_raw_link, resolve_link, strip_archive_prefix, ResolvedLink};

pub const LOGGING_SILENT: u64 = 0;
pub const LOGGING_DEFAULT: u64 = 1;
pub const LOGGING_EXTENDED: u64 = 2;
pub const LOGGING_VERBOSE: u64 = 3;

/// Per-URL recoverable failure: the URL is skipped, its lease released, and
/// the worker continues. Disjoint from [`WorkerError`], which aborts the
/// tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SkipReason {
    ResponseCode(u16),
    ContentType,
    Content,
    LostLock,
}

/// Compiled queries per role.
#[derive(Default)]
struct CompiledQueries {
    blacklist_content: Vec<CompiledQuery>,
    blacklist_types: Vec<CompiledQuery>,
    blacklist_urls: Vec<CompiledQuery>,
    links: Vec<CompiledQuery>,
    whitelist_content: Vec<CompiledQuery>,
    whitelist_types: Vec<CompiledQuery>,
    whitelist_urls: Vec<CompiledQuery>,
}

pub struct Crawler {
    config: CrawlerConfig,
    logging: u64,
    domain: String,
    tables: ListTables,
    fetcher: Option<Fetcher>,
    fetcher_archives: Option<Fetcher>,
    queries: CompiledQueries,

    start_page_id: u64,
    custom_pages: Vec<UrlRef>,

    // crawling state
    next_url: UrlRef,
    lock_expiry: String,
    manual_url: UrlRef,
    manual_counter: usize,
    start_crawled: bool,
    manual_off: bool,
    retry_counter: u64,
    archive_retry: bool,
    http_time: Option<Instant>,

    // timing
    tick_counter: u64,
    crawl_start: Option<Instant>,
    idle_since: Option<Instant>,
    pause_since: Option<Instant>,

    // manual-mode progress is a monotone counter
    processed: u64,
    total_at_start: u64,
}

impl Crawler {
    pub fn new() -> Self {
        Self {
            config: CrawlerConfig::from_entries(&[]).0,
            logging: LOGGING_DEFAULT,
            domain: String::new(),
            tables: ListTables::new("none", "none"),
            fetcher: None,
            fetcher_archives: None,
            queries: CompiledQueries::default(),
            start_page_id: 0,
            custom_pages: Vec::new(),
            next_url: UrlRef::default(),
            lock_expiry: String::new(),
            manual_url: UrlRef::default(),
            manual_counter: 0,
            start_crawled: false,
            manual_off: false,
            retry_counter: 0,
            archive_retry: false,
            http_time: None,
            tick_counter: 0,
            crawl_start: None,
            idle_since: None,
            pause_since: None,
            processed: 0,
            total_at_start: 0,
        }
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl)
    }

    fn log_at(&self, ctx: &mut WorkerContext, level: u64, entry: &str) {
        if self.logging >= level {
            ctx.log(entry);
        }
    }

    // ------------------------------------------------------------------
    // initialization
    // ------------------------------------------------------------------

    fn init_custom_urls(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        self.log_at(ctx, LOGGING_VERBOSE, "initializes start page and custom URLs...");

        self.start_page_id =
            ctx.store
                .find_or_add_url(&self.tables, &self.config.start_page, true)?;

        let mut urls: Vec<String> = if self.config.custom_counters.is_empty() {
            self.config.custom_urls.clone()
        } else if self.config.custom_counters_global {
            // each counter cross-products over every URL
            let mut expanded = self.config.custom_urls.clone();
            for counter in &self.config.custom_counters {
                let mut next = Vec::new();
                for url in &expanded {
                    if url.contains(&counter.variable) {
                        for value in counter.values() {
                            next.push(url.replace(&counter.variable, &value.to_string()));
                        }
                    } else {
                        next.push(url.clone());
                    }
                }
                next.sort();
                next.dedup();
                expanded = next;
            }
            expanded
        } else {
            // one counter per URL, paired by index
            let mut expanded = Vec::new();
            let pairs = self
                .config
                .custom_counters
                .len()
                .min(self.config.custom_urls.len());
            for i in 0..pairs {
                let url = &self.config.custom_urls[i];
                let counter = &self.config.custom_counters[i];
                if url.contains(&counter.variable) {
                    for value in counter.values() {
                        expanded.push(url.replace(&counter.variable, &value.to_string()));
                    }
                } else {
                    expanded.push(url.clone());
                }
            }
            expanded
        };
        urls.sort();
        urls.dedup();

        self.custom_pages.clear();
        for url in urls {
            let id = ctx.store.find_or_add_url(&self.tables, &url, true)?;
            self.custom_pages.push(UrlRef::new(id, url));
        }
        Ok(())
    }

    fn compile_query_list(
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

    fn init_queries(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        let config = self.config.clone();
        self.queries.blacklist_content =
            self.compile_query_list(ctx, &config.queries_blacklist_content)?;
        self.queries.blacklist_types =
            self.compile_query_list(ctx, &config.queries_blacklist_types)?;
        self.queries.blacklist_urls = self.compile_query_list(ctx, &config.queries_blacklist_urls)?;
        self.queries.links = self.compile_query_list(ctx, &config.queries_links)?;
        self.queries.whitelist_content =
            self.compile_query_list(ctx, &config.queries_whitelist_content)?;
        self.queries.whitelist_types =
            self.compile_query_list(ctx, &config.queries_whitelist_types)?;
        self.queries.whitelist_urls = self.compile_query_list(ctx, &config.queries_whitelist_urls)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // URL selection
    // ------------------------------------------------------------------

    fn select_url(&mut self, ctx: &mut WorkerContext) -> Result<Option<UrlRef>, WorkerError> {
        let mut log_entries: Vec<String> = Vec::new();
        let mut selected: Option<UrlRef> = None;

        // MANUAL mode: current retry URL, then custom URLs, then the start page
        if ctx.last() == 0 {
            if self.manual_url.is_set() {
                match ctx.store.renew_url_lock(
                    &self.tables,
                    ctx.module(),
                    self.manual_url.id,
                    self.lock_ttl(),
                    &self.lock_expiry,
                )? {
                    Some(expiry) => {
                        self.lock_expiry = expiry;
                        selected = Some(self.manual_url.clone());
                    }
                    None => {
                        log_entries
                            .push(format!("URL lock active - {} skipped.", self.manual_url.url));
                        self.manual_url.clear();
                    }
                }
            }

            if selected.is_none() && !self.manual_url.is_set() {
                if !self.custom_pages.is_empty() {
                    if self.manual_counter == 0 {
                        log_entries.push("starts crawling in non-recoverable MANUAL mode.".to_string());
                    }
                    while self.manual_counter < self.custom_pages.len() {
                        let candidate = self.custom_pages[self.manual_counter].clone();
                        if !self.config.custom_recrawl
                            && ctx
                                .store
                                .is_url_finished(&self.tables, ctx.module(), candidate.id)?
                        {
                            self.manual_counter += 1;
                            continue;
                        }
                        if let Some(expiry) = ctx.store.lock_url(
                            &self.tables,
                            ctx.module(),
                            candidate.id,
                            self.lock_ttl(),
                        )? {
                            self.lock_expiry = expiry;
                            self.manual_url = candidate.clone();
                            selected = Some(candidate);
                            break;
                        }
                        log_entries.push(format!("URL lock active - {} skipped.", candidate.url));
                        self.manual_counter += 1;
                    }
                }

                if selected.is_none()
                    && self.manual_counter == self.custom_pages.len()
                    && !self.start_crawled
                {
                    if self.custom_pages.is_empty() && self.manual_counter == 0 {
                        log_entries.push("starts crawling in non-recoverable MANUAL mode.".to_string());
                    }
                    let candidate = UrlRef::new(self.start_page_id, self.config.start_page.clone());
                    let wanted = self.config.recrawl_start
                        || !ctx
                            .store
                            .is_url_finished(&self.tables, ctx.module(), candidate.id)?;
                    let mut locked = false;
                    if wanted {
                        if let Some(expiry) = ctx.store.lock_url(
                            &self.tables,
                            ctx.module(),
                            candidate.id,
                            self.lock_ttl(),
                        )? {
                            self.lock_expiry = expiry;
                            self.manual_url = candidate.clone();
                            selected = Some(candidate);
                            locked = true;
                        }
                    }
                    if !locked && selected.is_none() {
                        log_entries.push(format!(
                            "URL lock active - {} skipped.",
                            self.config.start_page
                        ));
                        self.manual_url.clear();
                        self.start_crawled = true;
                    }
                }
            }
        }

        // AUTOMATIC mode: sequential processing from the database
        if selected.is_none() && !self.manual_url.is_set() {
            if !self.manual_off {
                log_entries.push("switches to recoverable AUTOMATIC mode.".to_string());
                self.manual_off = true;
            }

            let mut retried = false;
            if self.next_url.is_set() {
                // retry the current URL if this worker still holds its lease
                match ctx.store.renew_url_lock(
                    &self.tables,
                    ctx.module(),
                    self.next_url.id,
                    self.lock_ttl(),
                    &self.lock_expiry,
                )? {
                    Some(expiry) => {
                        self.lock_expiry = expiry;
                        log_entries.push(format!("retries {}...", self.next_url.url));
                        selected = Some(self.next_url.clone());
                        retried = true;
                    }
                    None => {
                        log_entries.push(format!(
                            "could not retry {}, because it is locked.",
                            self.next_url.url
                        ));
                    }
                }
            }

            if !retried {
                let mut scan_after = ctx.last();
                loop {
                    if !ctx.is_running() {
                        break;
                    }
                    match ctx.store.next_url(
                        &self.tables,
                        ctx.module(),
                        scan_after,
                        self.config.recrawl,
                    )? {
                        Some(candidate) => {
                            if let Some(expiry) = ctx.store.lock_url(
                                &self.tables,
                                ctx.module(),
                                candidate.id,
                                self.lock_ttl(),
                            )? {
                                self.lock_expiry = expiry;
                                self.next_url = candidate.clone();
                                selected = Some(candidate);
                                break;
                            }
                            // locked by another worker: advance past it
                            log_entries
                                .push(format!("skipped {}, because it is locked.", candidate.url));
                            scan_after = candidate.id;
                        }
                        None => break,
                    }
                }
            }
        }

        if self.logging >= LOGGING_DEFAULT {
            for entry in log_entries {
                ctx.log(&entry);
            }
        }

        match &selected {
            Some(url) => ctx.set_status(&url.url)?,
            None => {
                ctx.set_status("IDLE Waiting for new URLs to crawl.")?;
                ctx.set_progress(1.0)?;
            }
        }
        Ok(selected)
    }

    // ------------------------------------------------------------------
    // checks
    // ------------------------------------------------------------------

    fn check_response_code(&self, ctx: &mut WorkerContext, url: &str, status: u16) -> bool {
        if (400..600).contains(&status) {
            self.log_at(
                ctx,
                LOGGING_DEFAULT,
                &format!("HTTP error {status} from {url} - skips..."),
            );
            return false;
        }
        if status != 200 {
            self.log_at(
                ctx,
                LOGGING_DEFAULT,
                &format!("WARNING: HTTP response code {status} from {url}."),
            );
        }
        true
    }

    /// Regex-only check used for URL strings and content types.
    fn check_text_queries(
        &self,
        ctx: &mut WorkerContext,
        whitelist: &[CompiledQuery],
        blacklist: &[CompiledQuery],
        subject: &str,
        text: &str,
        context: &str,
    ) -> bool {
        if !whitelist.is_empty() {
            let mut found = false;
            for query in whitelist {
                if query.kind != QueryKind::Regex {
                    self.log_at(
                        ctx,
                        LOGGING_DEFAULT,
                        &format!("WARNING: Query on {subject} is not of type RegEx."),
                    );
                    continue;
                }
                match query.match_bool(text) {
                    Ok(true) => {
                        found = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => self.log_at(ctx, LOGGING_DEFAULT, &format!("{e} [{context}].")),
                }
            }
            if !found {
                return false;
            }
        }
        for query in blacklist {
            if query.kind != QueryKind::Regex {
                self.log_at(
                    ctx,
                    LOGGING_DEFAULT,
                    &format!("WARNING: Query on {subject} is not of type RegEx."),
                );
                continue;
            }
            match query.match_bool(text) {
                Ok(true) => return false,
                Ok(false) => {}
                Err(e) => self.log_at(ctx, LOGGING_DEFAULT, &format!("{e} [{context}].")),
            }
        }
        true
    }

    fn check_url(&self, ctx: &mut WorkerContext, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let allowed = self.check_text_queries(
            ctx,
            &self.queries.whitelist_urls,
            &self.queries.blacklist_urls,
            "URL",
            url,
            url,
        );
        if !allowed {
            self.log_at(ctx, LOGGING_EXTENDED, &format!("skipped {url} (filtered)."));
        }
        allowed
    }

    fn check_content_type(&self, ctx: &mut WorkerContext, url: &UrlRef, content_type: &str) -> bool {
        self.check_text_queries(
            ctx,
            &self.queries.whitelist_types,
            &self.queries.blacklist_types,
            "content type",
            content_type,
            &url.url,
        )
    }

    /// Content checks run regex queries on the raw body and XPath queries on
    /// the parsed document.
    fn check_content(&self, ctx: &mut WorkerContext, url: &UrlRef, body: &str, doc: &Html) -> bool {
        let eval = |query: &CompiledQuery, ctx: &mut WorkerContext| -> bool {
            let result = match query.kind {
                QueryKind::Regex => query.match_bool(body),
                QueryKind::XPath => query.select_bool(doc),
            };
            match result {
                Ok(found) => found,
                Err(e) => {
                    self.log_at(ctx, LOGGING_DEFAULT, &format!("{e} [{}].", url.url));
                    false
                }
            }
        };

        if !self.queries.whitelist_content.is_empty()
            && !self.queries.whitelist_content.iter().any(|q| eval(q, ctx))
        {
            return false;
        }
        if self.queries.blacklist_content.iter().any(|q| eval(q, ctx)) {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // fetch, persist, extract
    // ------------------------------------------------------------------

    fn crawl_content(
        &mut self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        // only the archive needs to be retried for this URL
        if self.config.archives && self.archive_retry {
            self.log_at(
                ctx,
                LOGGING_EXTENDED,
                &format!("Re-trying archive only [{}].", url.url),
            );
            return Ok(true);
        }

        // honour the pacing interval between HTTP requests
        if self.config.sleep_http > 0 {
            if let Some(last_request) = self.http_time {
                let elapsed = last_request.elapsed().as_millis() as u64;
                if elapsed < self.config.sleep_http {
                    let idle_start = Instant::now();
                    std::thread::sleep(Duration::from_millis(self.config.sleep_http - elapsed));
                    if let Some(start) = self.crawl_start.as_mut() {
                        *start += idle_start.elapsed();
                    }
                }
            }
        }

        let Some(fetcher) = self.fetcher.take() else {
            return Err(WorkerError::Fatal("fetcher not initialized".to_string()));
        };
        self.http_time = Some(Instant::now());
        let target = format!("https://{}{}", self.domain, url.url);
        let result = fetcher.fetch(&target, &self.config.retry_http);
        self.fetcher = Some(fetcher);

        match result {
            Ok(response) => self.process_response(ctx, url, response, checked, added),
            Err(FetchError::Redirect(e)) => {
                self.log_at(
                    ctx,
                    LOGGING_DEFAULT,
                    &format!("redirection error at {} - skips... ({e})", url.url),
                );
                self.crawling_skip(ctx, url)?;
                Ok(false)
            }
            Err(error) => {
                // retriable status or transport error: reset and retry
                if self.logging >= LOGGING_DEFAULT {
                    ctx.log(&format!("{error} [{}].", url.url));
                    ctx.log("resets connection...");
                }
                ctx.set_status(&format!("ERROR {error} [{}]", url.url))?;
                let backoff = Duration::from_millis(self.config.sleep_error);
                if let Some(fetcher) = self.fetcher.as_mut() {
                    if let Err(reset_error) = fetcher.reset(backoff) {
                        ctx.log(&format!("could not reset connection: {reset_error}"));
                    }
                }
                self.crawling_retry(ctx, url, false)?;
                Ok(false)
            }
        }
    }

    fn process_response(
        &mut self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        response: FetchedResponse,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        let doc = Html::parse_document(&response.body);
        if let Some(reason) = self.filter_response(ctx, url, &response, &doc)? {
            self.log_at(
                ctx,
                LOGGING_VERBOSE,
                &format!("skip of {}: {reason:?}", url.url),
            );
            self.crawling_skip(ctx, url)?;
            return Ok(false);
        }

        self.save_content(ctx, url, &response, &doc)?;

        let raw_links = self.extract_links(ctx, url, &response.body, &doc);
        if !raw_links.is_empty() {
            *checked += raw_links.len() as u64;
            self.parse_and_add_urls(ctx, url, raw_links, added, false)?;
        }
        Ok(true)
    }

    /// The filter phase of the pipeline. A reason means the URL is skipped;
    /// only repository failures abort the tick.
    fn filter_response(
        &self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        response: &FetchedResponse,
        doc: &Html,
    ) -> Result<Option<SkipReason>, WorkerError> {
        if !self.check_response_code(ctx, &url.url, response.status) {
            return Ok(Some(SkipReason::ResponseCode(response.status)));
        }
        if !self.check_content_type(ctx, url, &response.content_type) {
            return Ok(Some(SkipReason::ContentType));
        }
        if !self.check_content(ctx, url, &response.body, doc) {
            return Ok(Some(SkipReason::Content));
        }
        // the lease must still be held before any write targeting this URL
        if !ctx
            .store
            .check_url_lock(&self.tables, ctx.module(), url.id, &self.lock_expiry)?
        {
            self.log_at(
                ctx,
                LOGGING_DEFAULT,
                &format!("lost URL lock - {} skipped.", url.url),
            );
            return Ok(Some(SkipReason::LostLock));
        }
        Ok(None)
    }

    fn save_content(
        &self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        response: &FetchedResponse,
        doc: &Html,
    ) -> Result<(), WorkerError> {
        if self.config.xml {
            // store the cleaned document instead of the raw body
            let serialised = doc.html();
            if !serialised.is_empty() {
                ctx.store.save_content(
                    &self.tables,
                    url.id,
                    response.status,
                    &response.content_type,
                    &serialised,
                )?;
                return Ok(());
            }
            self.log_at(
                ctx,
                LOGGING_DEFAULT,
                &format!("WARNING: Could not clean content [{}].", url.url),
            );
        }
        ctx.store.save_content(
            &self.tables,
            url.id,
            response.status,
            &response.content_type,
            &response.body,
        )?;
        Ok(())
    }

    fn extract_links(
        &self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        body: &str,
        doc: &Html,
    ) -> Vec<String> {
        let mut results: Vec<String> = Vec::new();
        for query in &self.queries.links {
            let outcome = match (query.kind, query.result_multi) {
                (QueryKind::Regex, true) => query.match_all(body),
                (QueryKind::Regex, false) => {
                    query.match_first(body).map(|r| r.into_iter().collect())
                }
                (QueryKind::XPath, true) => query.select_all(doc),
                (QueryKind::XPath, false) => {
                    query.select_first(doc).map(|r| r.into_iter().collect())
                }
            };
            match outcome {
                Ok(mut links) => results.append(&mut links),
                Err(e) => self.log_at(ctx, LOGGING_DEFAULT, &format!("{e} [{}].", url.url)),
            }
        }
        results.sort();
        results.dedup();
        results
    }

    fn parse_and_add_urls(
        &self,
        ctx: &mut WorkerContext,
        from: &UrlRef,
        raw_links: Vec<String>,
        added: &mut u64,
        archived: bool,
    ) -> Result<(), WorkerError> {
        let mut sub_urls: Vec<String> = Vec::new();
        for mut raw in raw_links {
            if archived {
                // only absolute links behind the archive prefix are real
                match strip_archive_prefix(&raw) {
                    Some(stripped) => raw = stripped,
                    None => continue,
                }
            }
            let cleaned = clean_raw_link(&raw);
            if cleaned.is_empty() {
                continue;
            }
            match resolve_link(
                &self.domain,
                &from.url,
                &cleaned,
                &self.config.params_blacklist,
                &self.config.params_whitelist,
            ) {
                ResolvedLink::SubUrl(sub_url) => {
                    if !self.check_url(ctx, &sub_url) {
                        continue;
                    }
                    if !sub_url.starts_with('/') {
                        return Err(WorkerError::Fatal(format!("{sub_url} is no sub-URL")));
                    }
                    if sub_url.len() > 1 && sub_url.as_bytes()[1] == b'#' {
                        self.log_at(
                            ctx,
                            LOGGING_DEFAULT,
                            &format!("WARNING: Found anchor '{sub_url}'."),
                        );
                    }
                    sub_urls.push(sub_url);
                }
                ResolvedLink::OtherDomain => {}
                ResolvedLink::Invalid(message) => {
                    self.log_at(ctx, LOGGING_DEFAULT, &format!("WARNING: {message}"));
                }
            }
        }
        sub_urls.sort();
        sub_urls.dedup();
        if sub_urls.is_empty() {
            return Ok(());
        }

        if self.config.warn_files && self.logging >= LOGGING_DEFAULT {
            for sub_url in sub_urls.iter().filter(|u| !u.ends_with('/')) {
                ctx.log(&format!("WARNING: Found file '{sub_url}'."));
            }
        }

        // batched inserts bound the table-lock window; status shows progress
        let status = ctx.status();
        let total = sub_urls.len();
        let mut inserted = 0usize;
        let mut long_urls = false;
        for chunk in sub_urls.chunks(500) {
            if !ctx.is_running() {
                break;
            }
            if total > 500 {
                inserted += chunk.len();
                ctx.set_status(&format!("[URLs: {inserted}/{total}] {status}"))?;
            }
            let outcome = ctx
                .store
                .insert_links_chunk(&self.tables, from.id, chunk, archived)?;
            *added += outcome.new_urls;
            long_urls |= outcome.long_urls;
        }
        if total > 500 {
            ctx.set_status(&status)?;
        }
        if long_urls {
            self.log_at(
                ctx,
                LOGGING_DEFAULT,
                &format!("WARNING: URLs longer than {MAX_URL_LENGTH} Bytes ignored."),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // success / skip / retry
    // ------------------------------------------------------------------

    fn advance(&mut self, ctx: &mut WorkerContext, url: &UrlRef) -> Result<(), WorkerError> {
        self.processed += 1;
        if self.manual_url.is_set() {
            self.manual_url.clear();
            if self.manual_counter < self.custom_pages.len() {
                self.manual_counter += 1;
            } else {
                self.start_crawled = true;
            }
            let denominator = self.total_at_start.max(self.processed);
            if denominator > 0 {
                ctx.set_progress(self.processed as f64 / denominator as f64)?;
            }
        } else {
            ctx.set_last(url.id)?;
            let position = ctx.store.url_position(&self.tables, url.id)?;
            let total = ctx.store.url_count(&self.tables)?;
            if total > 0 {
                ctx.set_progress((position + 1) as f64 / total as f64)?;
            }
        }
        self.retry_counter = 0;
        self.next_url.clear();
        Ok(())
    }

    fn crawling_success(&mut self, ctx: &mut WorkerContext, url: &UrlRef) -> Result<(), WorkerError> {
        ctx.store
            .finish_url(&self.tables, ctx.module(), url.id, &self.lock_expiry)?;
        self.advance(ctx, url)
    }

    fn crawling_skip(&mut self, ctx: &mut WorkerContext, url: &UrlRef) -> Result<(), WorkerError> {
        self.advance(ctx, url)?;
        self.archive_retry = false;
        Ok(())
    }

    fn crawling_retry(
        &mut self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        archive_only: bool,
    ) -> Result<(), WorkerError> {
        if self.config.retries > -1 {
            self.retry_counter += 1;
            if self.retry_counter > self.config.retries as u64 {
                self.crawling_skip(ctx, url)?;
                return Ok(());
            }
        }
        if archive_only {
            self.archive_retry = true;
        }
        Ok(())
    }
}

impl Default for Crawler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerModule for Crawler {
    fn on_init(&mut self, ctx: &mut WorkerContext, _resumed: bool) -> Result<(), WorkerError> {
        let entries = parse_config_entries(&ctx.config_body)
            .map_err(|e| WorkerError::Config(format!("could not parse configuration: {e}")))?;

        let (config, warnings) = CrawlerConfig::from_entries(&entries);
        self.logging = config_logging(&entries);
        self.config = config;
        if self.logging >= LOGGING_DEFAULT {
            for warning in &warnings {
                ctx.log(&format!("WARNING: {warning}"));
            }
        }
        if self.config.queries_links.is_empty() {
            return Err(WorkerError::Config(
                "no link extraction query specified".to_string(),
            ));
        }

        ctx.store
            .set_sleep_on_error(Duration::from_secs(self.config.sleep_db));
        self.tables = ListTables::new(&ctx.website_namespace, &ctx.urllist_namespace);
        self.domain = ctx.store.get_website_domain(ctx.options.website)?;

        let (network, network_warnings) = NetworkConfig::from_entries(&entries);
        self.log_at(ctx, LOGGING_VERBOSE, "sets network configuration...");
        let (fetcher, fetcher_warnings) = Fetcher::new(network.clone())
            .map_err(|e| WorkerError::Config(e.to_string()))?;
        self.fetcher = Some(fetcher);
        if self.logging >= LOGGING_DEFAULT {
            for warning in network_warnings.iter().chain(fetcher_warnings.iter()) {
                ctx.log(&format!("WARNING: {warning}"));
            }
        }

        self.init_custom_urls(ctx)?;
        self.init_queries(ctx)?;

        if self.config.archives {
            let (fetcher, archive_warnings) =
                Fetcher::new(network).map_err(|e| WorkerError::Config(e.to_string()))?;
            self.fetcher_archives = Some(fetcher);
            if self.logging >= LOGGING_DEFAULT {
                for warning in &archive_warnings {
                    ctx.log(&format!("WARNING: {warning}"));
                }
            }
        }

        self.total_at_start = ctx.store.url_count(&self.tables)?;
        self.processed = if ctx.last() > 0 {
            ctx.store.url_position(&self.tables, ctx.last())? + 1
        } else {
            0
        };
        self.tick_counter = 0;
        self.crawl_start = Some(Instant::now());
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext) -> Result<Tick, WorkerError> {
        let timing = self.config.timing;
        let tick_start = Instant::now();
        let mut checked = 0u64;
        let mut added = 0u64;
        let mut checked_archive = 0u64;
        let mut added_archive = 0u64;

        let select_start = Instant::now();
        let selected = self.select_url(ctx)?;
        let select_elapsed = select_start.elapsed();

        match selected {
            Some(url) => {
                if let Some(idle_start) = self.idle_since.take() {
                    // idling ended; exclude it from the crawl metric
                    if let Some(start) = self.crawl_start.as_mut() {
                        *start += idle_start.elapsed();
                    }
                }
                self.tick_counter += 1;
                self.log_at(ctx, LOGGING_EXTENDED, &format!("crawls {}...", url.url));

                let crawled = self.crawl_content(ctx, &url, &mut checked, &mut added)?;

                self.log_at(
                    ctx,
                    LOGGING_EXTENDED,
                    &format!("gets archives of {}...", url.url),
                );
                let archive_start = Instant::now();
                let archives_done =
                    self.crawl_archives(ctx, &url, &mut checked_archive, &mut added_archive)?;
                let archive_elapsed = archive_start.elapsed();

                if archives_done && crawled {
                    self.crawling_success(ctx, &url)?;
                    if self.logging >= LOGGING_EXTENDED || (timing && self.logging >= LOGGING_DEFAULT)
                    {
                        let mut message = format!(
                            "finished {} after {}",
                            url.url,
                            ms_to_string(tick_start.elapsed().as_millis() as u64)
                        );
                        if timing {
                            message.push_str(&format!(
                                " (select: {}",
                                ms_to_string(select_elapsed.as_millis() as u64)
                            ));
                            if self.config.archives {
                                message.push_str(&format!(
                                    ", archive: {}",
                                    ms_to_string(archive_elapsed.as_millis() as u64)
                                ));
                            }
                            message.push(')');
                        }
                        message.push_str(&format!(" - checked {checked}"));
                        if checked_archive > 0 {
                            message.push_str(&format!(" (+{checked_archive} archived)"));
                        }
                        message.push_str(&format!(", added {added}"));
                        if added_archive > 0 {
                            message.push_str(&format!(" (+{added_archive} archived)"));
                        }
                        message.push_str(" URL(s).");
                        ctx.log(&message);
                    }
                }

                // drop the lease if this worker still holds it
                if !self.lock_expiry.is_empty() {
                    ctx.store.release_url(
                        &self.tables,
                        ctx.module(),
                        url.id,
                        &self.lock_expiry,
                    )?;
                }
                self.lock_expiry.clear();
            }
            None => {
                if self.idle_since.is_none() {
                    self.idle_since = Some(Instant::now());
                }
                std::thread::sleep(Duration::from_millis(self.config.sleep_idle));
            }
        }
        Ok(Tick::Continue)
    }

    fn on_pause(&mut self, _ctx: &mut WorkerContext) {
        self.pause_since = Some(Instant::now());
    }

    fn on_unpause(&mut self, _ctx: &mut WorkerContext) {
        // exclude the pause from the crawl or idle interval
        if let Some(pause_start) = self.pause_since.take() {
            let paused = pause_start.elapsed();
            if let Some(idle) = self.idle_since.as_mut() {
                *idle += paused;
            } else if let Some(start) = self.crawl_start.as_mut() {
                *start += paused;
            }
        }
    }

    fn on_clear(&mut self, ctx: &mut WorkerContext, _interrupted: bool) {
        if self.tick_counter > 0 {
            if let Some(mut start) = self.crawl_start.take() {
                if let Some(pause_start) = self.pause_since.take() {
                    start += pause_start.elapsed();
                }
                if let Some(idle_start) = self.idle_since.take() {
                    start += idle_start.elapsed();
                }
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let tps = self.tick_counter as f64 / elapsed;
                    if self.logging >= LOGGING_DEFAULT {
                        ctx.log(&format!("average speed: {tps:.2} ticks per second."));
                    }
                }
            }
        }

        // release any lease still held
        if !self.lock_expiry.is_empty() {
            for url in [self.manual_url.clone(), self.next_url.clone()] {
                if url.is_set() {
                    let _ = ctx
                        .store
                        .release_url(&self.tables, ctx.module(), url.id, &self.lock_expiry);
                }
            }
            self.lock_expiry.clear();
        }

        self.queries = CompiledQueries::default();
        self.custom_pages.clear();
        self.fetcher = None;
        self.fetcher_archives = None;
    }
}

fn config_logging(entries: &[crate::models::ConfigEntry]) -> u64 {
    entries
        .iter()
        .find(|e| e.cat == "crawler" && e.name == "logging")
        .and_then(|e| e.value.as_u64())
        .unwrap_or(LOGGING_DEFAULT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModuleKind, ThreadOptions, ThreadRow};
    use crate::repository::test_support::scratch_store;
    use crate::repository::Store;
    use crate::workers::test_support::test_context;
    use crate::workers::WorkerContext;

    fn fixture() -> (tempfile::TempDir, WorkerContext, Crawler) {
        let (dir, mut store) = scratch_store();
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
        let row = ThreadRow {
            id,
            module: ModuleKind::Crawler,
            status: String::new(),
            paused: false,
            options,
            last: 0,
            run_time: 0,
            pause_time: 0,
            progress: 0.0,
        };
        let ctx = test_context(store.db_path(), &row);
        let mut crawler = Crawler::new();
        crawler.tables = ListTables::new("news", "main");
        crawler.domain = "example.com".to_string();
        crawler.manual_off = true;
        (dir, ctx, crawler)
    }

    fn add_url(ctx: &mut WorkerContext, tables: &ListTables, url: &str) -> UrlRef {
        let id = ctx.store.add_url(tables, url, false).unwrap();
        UrlRef::new(id, url)
    }

    #[test]
    fn zero_retries_escalates_to_skip_immediately() {
        let (_dir, mut ctx, mut crawler) = fixture();
        crawler.config.retries = 0;
        let tables = crawler.tables.clone();
        let url = add_url(&mut ctx, &tables, "/a");
        crawler.next_url = url.clone();

        crawler.crawling_retry(&mut ctx, &url, false).unwrap();

        // skipped: cursor advanced, no work item left for the next tick
        assert_eq!(ctx.last(), url.id);
        assert!(!crawler.next_url.is_set());
        assert_eq!(crawler.retry_counter, 0);
    }

    #[test]
    fn unlimited_retries_keep_the_work_item() {
        let (_dir, mut ctx, mut crawler) = fixture();
        crawler.config.retries = -1;
        let tables = crawler.tables.clone();
        let url = add_url(&mut ctx, &tables, "/a");
        crawler.next_url = url.clone();

        for _ in 0..50 {
            crawler.crawling_retry(&mut ctx, &url, false).unwrap();
        }
        assert!(crawler.next_url.is_set());
        assert_eq!(ctx.last(), 0);
    }

    #[test]
    fn bounded_retries_escalate_after_the_limit() {
        let (_dir, mut ctx, mut crawler) = fixture();
        crawler.config.retries = 2;
        let tables = crawler.tables.clone();
        let url = add_url(&mut ctx, &tables, "/a");
        crawler.next_url = url.clone();

        crawler.crawling_retry(&mut ctx, &url, false).unwrap();
        crawler.crawling_retry(&mut ctx, &url, false).unwrap();
        assert!(crawler.next_url.is_set());

        // the third failure exceeds the limit
        crawler.crawling_retry(&mut ctx, &url, false).unwrap();
        assert!(!crawler.next_url.is_set());
        assert_eq!(ctx.last(), url.id);
    }

    #[test]
    fn archive_only_retry_sets_flag() {
        let (_dir, mut ctx, mut crawler) = fixture();
        let tables = crawler.tables.clone();
        let url = add_url(&mut ctx, &tables, "/a");
        crawler.next_url = url.clone();

        crawler.crawling_retry(&mut ctx, &url, true).unwrap();
        assert!(crawler.archive_retry);

        // a successful crawl clears it through the skip path
        crawler.crawling_skip(&mut ctx, &url).unwrap();
        assert!(!crawler.archive_retry);
    }

    #[test]
    fn automatic_selection_skips_foreign_lease() {
        let (_dir, mut ctx, mut crawler) = fixture();
        let tables = crawler.tables.clone();
        let first = add_url(&mut ctx, &tables, "/a");
        let second = add_url(&mut ctx, &tables, "/b");

        // another worker holds the first URL
        let mut other = Store::open(ctx.store.db_path()).unwrap();
        other
            .lock_url(&tables, ModuleKind::Crawler, first.id, Duration::from_secs(300))
            .unwrap()
            .unwrap();

        let selected = crawler.select_url(&mut ctx).unwrap().unwrap();
        assert_eq!(selected.id, second.id);
        // skip is visible in the module log
        let entries = ctx.store.count_log_entries("crawler").unwrap();
        assert!(entries > 0);
    }

    #[test]
    fn selection_goes_idle_when_list_is_exhausted() {
        let (_dir, mut ctx, mut crawler) = fixture();
        assert!(crawler.select_url(&mut ctx).unwrap().is_none());
        assert!(ctx.status().starts_with("IDLE"));
    }

    #[test]
    fn manual_mode_switch_logged_once() {
        let (_dir, mut ctx, mut crawler) = fixture();
        crawler.manual_off = false;
        crawler.start_crawled = true;
        let before = ctx.store.count_log_entries("crawler").unwrap();
        crawler.select_url(&mut ctx).unwrap();
        crawler.select_url(&mut ctx).unwrap();
        let after = ctx.store.count_log_entries("crawler").unwrap();
        // exactly one "switches to recoverable AUTOMATIC mode." entry
        assert_eq!(after - before, 1);
    }
}
