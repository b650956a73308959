//! Archive walk: enumerate Memento captures of a URL through each
//! configured archive's timemap, persist archived content, and follow
//! reference redirects ("found capture at …").

use std::time::Duration;

use scraper::Html;

use crate::fetcher::Fetcher;
use crate::models::UrlRef;
use crate::utils::datetime::{convert_sql_timestamp, convert_timestamp};
use crate::workers::{WorkerContext, WorkerError};

use super::config::ArchiveConfig;
use super::{mementos, Crawler, LOGGING_DEFAULT};

/// Prefix of a reference-redirect body pointing at the real capture.
const CAPTURE_REFERENCE: &str = "found capture at ";

impl Crawler {
    /// Walk every configured archive for one URL. Returns whether the worker
    /// may finalise the URL (false when an archive retry or skip was
    /// scheduled).
    pub(super) fn crawl_archives(
        &mut self,
        ctx: &mut WorkerContext,
        url: &UrlRef,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        if !self.config.archives {
            return Ok(ctx.is_running());
        }
        let Some(mut fetcher) = self.fetcher_archives.take() else {
            return Ok(ctx.is_running());
        };
        let result = self.archive_walk(ctx, &mut fetcher, url, checked, added);
        self.fetcher_archives = Some(fetcher);
        result
    }

    fn archive_walk(
        &mut self,
        ctx: &mut WorkerContext,
        fetcher: &mut Fetcher,
        url: &UrlRef,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        let mut success = true;
        let mut skip = false;

        for archive in self.config.archive_list.clone() {
            if archive.memento_prefix.is_empty() || archive.timemap_prefix.is_empty() {
                continue;
            }
            let mut timemap_url = format!("{}{}{}", archive.timemap_prefix, self.domain, url.url);

            while success && ctx.is_running() {
                match fetcher.fetch(&timemap_url, &self.config.retry_http) {
                    Ok(response) => {
                        if !self.check_response_code(ctx, &timemap_url, response.status) {
                            success = false;
                            skip = true;
                        } else if response.content_type != "application/link-format"
                            || response.body.is_empty()
                        {
                            break;
                        } else {
                            let document = mementos::parse(&response.body);
                            if self.logging >= LOGGING_DEFAULT {
                                for warning in &document.warnings {
                                    ctx.log(&format!(
                                        "Memento parsing WARNING: {warning} [{}]",
                                        url.url
                                    ));
                                }
                            }

                            success = self.walk_mementos(
                                ctx, fetcher, url, &archive, &document, checked, added,
                            )?;
                            timemap_url = document.next_page;
                            if timemap_url.is_empty() {
                                break;
                            }
                        }
                    }
                    Err(error) => {
                        if self.logging >= LOGGING_DEFAULT {
                            ctx.log(&format!("{error} [{timemap_url}]."));
                            ctx.log(&format!("resets connection to {}...", archive.name));
                        }
                        ctx.set_status(&format!("ERROR {error} [{}]", url.url))?;
                        if let Err(reset_error) =
                            fetcher.reset(Duration::from_millis(self.config.sleep_error))
                        {
                            ctx.log(&format!("could not reset connection: {reset_error}"));
                        }
                        success = false;
                    }
                }

                if !success {
                    if self.config.retry_archive {
                        if skip {
                            self.crawling_skip(ctx, url)?;
                        } else {
                            self.crawling_retry(ctx, url, true)?;
                        }
                        return Ok(false);
                    }
                    self.crawling_skip(ctx, url)?;
                }
            }
        }

        if success || !self.config.retry_archive {
            self.archive_retry = false;
        }
        Ok(ctx.is_running())
    }

    /// Visit every memento of one timemap page. Returns false when an
    /// archive-level retry is needed.
    #[allow(clippy::too_many_arguments)]
    fn walk_mementos(
        &mut self,
        ctx: &mut WorkerContext,
        fetcher: &mut Fetcher,
        url: &UrlRef,
        archive: &ArchiveConfig,
        document: &mementos::MementoDocument,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        let status_message = ctx.status();
        let total = document.mementos.len();
        let mut success = true;

        for (index, memento) in document.mementos.iter().enumerate() {
            // the interrupt flag is observed once per memento
            if !ctx.is_running() {
                break;
            }

            ctx.set_status(&format!(
                "[{}: {}/{}] {}",
                archive.name,
                index + 1,
                total,
                status_message
            ))?;

            // re-new the lease so no other worker writes duplicate captures
            match ctx.store.renew_url_lock(
                &self.tables,
                ctx.module(),
                url.id,
                self.lock_ttl(),
                &self.lock_expiry,
            )? {
                Some(expiry) => self.lock_expiry = expiry,
                None => continue,
            }

            if !self.visit_memento(ctx, fetcher, url, archive, memento, checked, added)? {
                success = false;
            }
        }

        if success {
            ctx.set_status(&status_message)?;
        }
        Ok(success)
    }

    /// Fetch one memento, following reference redirects. Returns false when
    /// the failure should schedule an archive retry.
    #[allow(clippy::too_many_arguments)]
    fn visit_memento(
        &mut self,
        ctx: &mut WorkerContext,
        fetcher: &mut Fetcher,
        url: &UrlRef,
        archive: &ArchiveConfig,
        memento: &crate::models::Memento,
        checked: &mut u64,
        added: &mut u64,
    ) -> Result<bool, WorkerError> {
        let mut timestamp = memento.timestamp.clone();
        let mut memento_url = memento.url.clone();

        loop {
            if !ctx.is_running() {
                return Ok(true);
            }
            if ctx
                .store
                .has_archived_content(&self.tables, url.id, &timestamp)?
            {
                return Ok(true);
            }

            let response = match fetcher.fetch(&memento_url, &self.config.retry_http) {
                Ok(response) => response,
                Err(error) => {
                    self.log_at(ctx, LOGGING_DEFAULT, &format!("{error} [{memento_url}]."));
                    return Ok(!self.config.retry_archive);
                }
            };
            if !self.check_response_code(ctx, &memento_url, response.status) {
                return Ok(true);
            }
            if !ctx.is_running() {
                return Ok(true);
            }

            if let Some(reference) = response.body.strip_prefix(CAPTURE_REFERENCE) {
                // reference redirect: rewrite the memento URL with the new
                // 14-digit timestamp and try again
                let Some(compact) = convert_sql_timestamp(&timestamp) else {
                    self.log_at(
                        ctx,
                        LOGGING_DEFAULT,
                        &format!("WARNING: Could not convert timestamp in {memento_url} [{}].", url.url),
                    );
                    return Ok(true);
                };
                let Some(position) = memento_url.find(&compact) else {
                    self.log_at(
                        ctx,
                        LOGGING_DEFAULT,
                        &format!("WARNING: Could not find timestamp in {memento_url} [{}].", url.url),
                    );
                    return Ok(true);
                };
                let sub_url = memento_url[position + compact.len()..].to_string();
                let new_compact: String = reference.chars().take(14).collect();
                match convert_timestamp(&new_compact) {
                    Some(sql_timestamp) => {
                        timestamp = sql_timestamp;
                        memento_url =
                            format!("{}{}{}", archive.memento_prefix, new_compact, sub_url);
                        continue;
                    }
                    None => {
                        self.log_at(
                            ctx,
                            LOGGING_DEFAULT,
                            &format!(
                                "WARNING: Invalid timestamp '{new_compact}' from {} [{}].",
                                archive.name, url.url
                            ),
                        );
                        return Ok(true);
                    }
                }
            }

            // a real capture: persist it and extract archived links
            let doc = Html::parse_document(&response.body);
            ctx.store.save_archived_content(
                &self.tables,
                url.id,
                &timestamp,
                response.status,
                &response.content_type,
                &response.body,
            )?;
            let raw_links = self.extract_links(ctx, url, &response.body, &doc);
            if !raw_links.is_empty() {
                *checked += raw_links.len() as u64;
                self.parse_and_add_urls(ctx, url, raw_links, added, true)?;
            }
            return Ok(true);
        }
    }
}
