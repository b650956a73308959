//! URL lifecycle: the lease protocol and batch URL/link insertion.
//!
//! The four lock columns of a URL table implement a cooperative lease: an
//! absolute expiry timestamp or NULL. Acquisition, renewal, release and
//! completion are all conditional single statements, so a worker can never
//! write against a URL whose lease it no longer holds.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use xxhash_rust::xxh3::xxh3_64;

use crate::models::{ModuleKind, UrlRef};
use crate::utils::datetime::SQL_FORMAT;

use super::{ListTables, RepositoryError, Result, Store};

/// Maximum URL length in bytes; longer URLs are dropped by the callers with
/// a warning.
pub const MAX_URL_LENGTH: usize = 2000;

/// Outcome of one batched link-insertion window.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkChunkOutcome {
    /// URLs that did not exist before this chunk.
    pub new_urls: u64,
    /// Whether any URL was dropped for exceeding [`MAX_URL_LENGTH`].
    pub long_urls: bool,
}

pub(crate) fn url_hash(url: &str) -> i64 {
    xxh3_64(url.as_bytes()) as i64
}

fn sql_now() -> String {
    Utc::now().format(SQL_FORMAT).to_string()
}

fn expiry_after(ttl: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)))
        .format(SQL_FORMAT)
        .to_string()
}

fn lookup_url_id(conn: &Connection, tables: &ListTables, url: &str) -> rusqlite::Result<Option<u64>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT id FROM {} WHERE hash = ?1 AND url = ?2",
        tables.urls
    ))?;
    match stmt.query_row(params![url_hash(url), url], |row| row.get::<_, i64>(0)) {
        Ok(id) => Ok(Some(id as u64)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

fn insert_url(
    conn: &Connection,
    tables: &ListTables,
    url: &str,
    manual: bool,
) -> rusqlite::Result<u64> {
    conn.prepare_cached(&format!(
        "INSERT INTO {} (manual, url, hash) VALUES (?1, ?2, ?3)",
        tables.urls
    ))?
    .execute(params![manual, url, url_hash(url)])?;
    Ok(conn.last_insert_rowid() as u64)
}

impl Store {
    /// The lowest URL id above `after` not yet processed by `module`.
    /// `include_processed` drops the completion filter (re-crawling).
    pub fn next_url(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        after: u64,
        include_processed: bool,
    ) -> Result<Option<UrlRef>> {
        let flag = module.finished_column();
        let sql = if include_processed {
            format!(
                "SELECT id, url FROM {} WHERE id > ?1 ORDER BY id LIMIT 1",
                tables.urls
            )
        } else {
            format!(
                "SELECT id, url FROM {} WHERE id > ?1 AND {flag} = 0 ORDER BY id LIMIT 1",
                tables.urls
            )
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            match stmt.query_row(params![after as i64], |row| {
                Ok(UrlRef::new(row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            }) {
                Ok(url) => Ok(Some(url)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Whether the module's lock on this URL is free or expired.
    pub fn is_url_lockable(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
    ) -> Result<bool> {
        let lock = module.lock_column();
        let sql = format!(
            "SELECT ({lock} IS NULL OR {lock} <= ?1) FROM {} WHERE id = ?2",
            tables.urls
        );
        self.with_conn(|conn| {
            match conn
                .prepare_cached(&sql)?
                .query_row(params![sql_now(), url_id as i64], |row| row.get(0))
            {
                Ok(lockable) => Ok(lockable),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Acquire the module's lease on a URL for `ttl`. Returns the exact
    /// expiry written; `None` if another worker holds a live lease.
    pub fn lock_url(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
        ttl: Duration,
    ) -> Result<Option<String>> {
        let lock = module.lock_column();
        let expiry = expiry_after(ttl);
        let sql = format!(
            "UPDATE {} SET {lock} = ?1 WHERE id = ?2 AND ({lock} IS NULL OR {lock} <= ?3)",
            tables.urls
        );
        let changed = self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute(params![expiry, url_id as i64, sql_now()])
        })?;
        Ok((changed > 0).then_some(expiry))
    }

    /// Whether the stored lock still equals the lease this worker remembers.
    pub fn check_url_lock(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
        expiry: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            match conn
                .prepare_cached(&format!(
                    "SELECT (COALESCE({lock}, '') = ?1) FROM {table} WHERE id = ?2",
                    lock = module.lock_column(),
                    table = tables.urls
                ))?
                .query_row(params![expiry, url_id as i64], |row| row.get(0))
            {
                Ok(held) => Ok(held),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Renew a held lease: check-then-extend in one statement. Returns the
    /// new expiry, or `None` if the lease was lost.
    pub fn renew_url_lock(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
        ttl: Duration,
        expiry: &str,
    ) -> Result<Option<String>> {
        let lock = module.lock_column();
        let new_expiry = expiry_after(ttl);
        // a NULL lock counts as the empty lease (fresh retry after release)
        let sql = format!(
            "UPDATE {} SET {lock} = ?1 WHERE id = ?2 AND COALESCE({lock}, '') = ?3",
            tables.urls
        );
        let changed = self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute(params![new_expiry, url_id as i64, expiry])
        })?;
        Ok((changed > 0).then_some(new_expiry))
    }

    /// Clear the module's lock iff this worker still holds it.
    pub fn release_url(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
        expiry: &str,
    ) -> Result<()> {
        let lock = module.lock_column();
        let sql = format!(
            "UPDATE {} SET {lock} = NULL WHERE id = ?1 AND COALESCE({lock}, '') = ?2",
            tables.urls
        );
        self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute(params![url_id as i64, expiry])
                .map(|_| ())
        })
    }

    /// Set the module's completion flag iff this worker still holds the
    /// lease. Returns whether the flag was written.
    pub fn finish_url(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
        expiry: &str,
    ) -> Result<bool> {
        let lock = module.lock_column();
        let flag = module.finished_column();
        let sql = format!(
            "UPDATE {} SET {flag} = 1 WHERE id = ?1 AND COALESCE({lock}, '') = ?2",
            tables.urls
        );
        let changed = self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute(params![url_id as i64, expiry])
        })?;
        Ok(changed > 0)
    }

    /// Whether the module has finished this URL.
    pub fn is_url_finished(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
    ) -> Result<bool> {
        let flag = module.finished_column();
        let sql = format!("SELECT {flag} != 0 FROM {} WHERE id = ?1", tables.urls);
        self.with_conn(|conn| {
            match conn
                .prepare_cached(&sql)?
                .query_row(params![url_id as i64], |row| row.get(0))
            {
                Ok(finished) => Ok(finished),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// The module's current lock value, if any.
    pub fn get_url_lock(
        &mut self,
        tables: &ListTables,
        module: ModuleKind,
        url_id: u64,
    ) -> Result<Option<String>> {
        let lock = module.lock_column();
        let sql = format!("SELECT {lock} FROM {} WHERE id = ?1", tables.urls);
        self.with_conn(|conn| {
            match conn
                .prepare_cached(&sql)?
                .query_row(params![url_id as i64], |row| row.get(0))
            {
                Ok(lock) => Ok(lock),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Find a URL's id via the hash index.
    pub fn url_id(&mut self, tables: &ListTables, url: &str) -> Result<Option<u64>> {
        self.with_conn(|conn| lookup_url_id(conn, tables, url))
    }

    /// Insert a URL, returning its id. Rejects URLs over [`MAX_URL_LENGTH`].
    pub fn add_url(&mut self, tables: &ListTables, url: &str, manual: bool) -> Result<u64> {
        if url.len() > MAX_URL_LENGTH {
            return Err(RepositoryError::Invalid(format!(
                "URL longer than {MAX_URL_LENGTH} bytes"
            )));
        }
        self.with_conn(|conn| insert_url(conn, tables, url, manual))
    }

    /// Find a URL's id, inserting it if missing, inside one short lock window.
    pub fn find_or_add_url(
        &mut self,
        tables: &ListTables,
        url: &str,
        manual: bool,
    ) -> Result<u64> {
        if url.len() > MAX_URL_LENGTH {
            return Err(RepositoryError::Invalid(format!(
                "URL longer than {MAX_URL_LENGTH} bytes"
            )));
        }
        let tx = self.lock_window()?;
        let id = match lookup_url_id(&tx, tables, url)? {
            Some(id) => id,
            None => insert_url(&tx, tables, url, manual)?,
        };
        tx.commit()?;
        Ok(id)
    }

    /// Number of URLs with a lower id (position of a URL in its list).
    pub fn url_position(&mut self, tables: &ListTables, url_id: u64) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id < ?1", tables.urls);
        self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row(params![url_id as i64], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    pub fn url_count(&mut self, tables: &ListTables) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", tables.urls);
        self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row([], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    /// Insert a chunk of extracted links under one short table-lock window:
    /// each unknown URL is added, then a link row from `from_id`. Oversize
    /// URLs are skipped and reported.
    pub fn insert_links_chunk(
        &mut self,
        tables: &ListTables,
        from_id: u64,
        urls: &[String],
        archived: bool,
    ) -> Result<LinkChunkOutcome> {
        let link_sql = format!(
            "INSERT OR IGNORE INTO {} (fromurl, tourl, archived) VALUES (?1, ?2, ?3)",
            tables.links
        );
        let mut outcome = LinkChunkOutcome::default();
        let tx = self.lock_window()?;
        for url in urls {
            if url.len() > MAX_URL_LENGTH {
                outcome.long_urls = true;
                continue;
            }
            let to_id = match lookup_url_id(&tx, tables, url)? {
                Some(id) => id,
                None => {
                    outcome.new_urls += 1;
                    insert_url(&tx, tables, url, false)?
                }
            };
            tx.prepare_cached(&link_sql)?
                .execute(params![from_id as i64, to_id as i64, archived])?;
        }
        tx.commit()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    fn list_fixture(store: &mut Store) -> ListTables {
        let website = store.add_website("News", "news", "example.com").unwrap();
        store.add_url_list(website, "Main", "main").unwrap();
        ListTables::new("news", "main")
    }

    #[test]
    fn lease_acquire_check_release() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let id = store.add_url(&tables, "/", true).unwrap();

        assert!(store
            .is_url_lockable(&tables, ModuleKind::Crawler, id)
            .unwrap());
        let expiry = store
            .lock_url(&tables, ModuleKind::Crawler, id, Duration::from_secs(300))
            .unwrap()
            .expect("lease acquired");
        assert!(!store
            .is_url_lockable(&tables, ModuleKind::Crawler, id)
            .unwrap());
        assert!(store
            .check_url_lock(&tables, ModuleKind::Crawler, id, &expiry)
            .unwrap());

        // a second acquisition attempt fails while the lease is live
        assert!(store
            .lock_url(&tables, ModuleKind::Crawler, id, Duration::from_secs(300))
            .unwrap()
            .is_none());

        store
            .release_url(&tables, ModuleKind::Crawler, id, &expiry)
            .unwrap();
        assert!(store
            .is_url_lockable(&tables, ModuleKind::Crawler, id)
            .unwrap());
        assert!(store
            .get_url_lock(&tables, ModuleKind::Crawler, id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let id = store.add_url(&tables, "/", true).unwrap();

        let stale = store
            .lock_url(&tables, ModuleKind::Crawler, id, Duration::from_secs(0))
            .unwrap()
            .expect("lease acquired");
        std::thread::sleep(Duration::from_millis(1100));

        // a second worker takes the expired lease over
        let fresh = store
            .lock_url(&tables, ModuleKind::Crawler, id, Duration::from_secs(300))
            .unwrap()
            .expect("expired lease overwritten");

        // the first holder's writes must now fail the check
        assert!(!store
            .check_url_lock(&tables, ModuleKind::Crawler, id, &stale)
            .unwrap());
        assert!(!store
            .finish_url(&tables, ModuleKind::Crawler, id, &stale)
            .unwrap());
        assert!(store
            .finish_url(&tables, ModuleKind::Crawler, id, &fresh)
            .unwrap());
    }

    #[test]
    fn locks_are_per_module() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let id = store.add_url(&tables, "/", true).unwrap();

        store
            .lock_url(&tables, ModuleKind::Crawler, id, Duration::from_secs(300))
            .unwrap()
            .unwrap();
        // the parser's lock column is independent
        assert!(store
            .is_url_lockable(&tables, ModuleKind::Parser, id)
            .unwrap());
    }

    #[test]
    fn next_url_skips_finished() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let first = store.add_url(&tables, "/a", false).unwrap();
        let second = store.add_url(&tables, "/b", false).unwrap();

        let expiry = store
            .lock_url(&tables, ModuleKind::Crawler, first, Duration::from_secs(300))
            .unwrap()
            .unwrap();
        store
            .finish_url(&tables, ModuleKind::Crawler, first, &expiry)
            .unwrap();

        let next = store
            .next_url(&tables, ModuleKind::Crawler, 0, false)
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second);
        assert!(store
            .next_url(&tables, ModuleKind::Crawler, second, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn url_length_boundary() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let exactly = format!("/{}", "a".repeat(MAX_URL_LENGTH - 1));
        let too_long = format!("/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(store.add_url(&tables, &exactly, false).is_ok());
        assert!(store.add_url(&tables, &too_long, false).is_err());

        let outcome = store
            .insert_links_chunk(&tables, 1, &[too_long], false)
            .unwrap();
        assert!(outcome.long_urls);
        assert_eq!(outcome.new_urls, 0);
    }

    #[test]
    fn links_unique_per_archived_flag() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let from = store.add_url(&tables, "/", true).unwrap();

        let urls = vec!["/a".to_string(), "/a".to_string()];
        let outcome = store.insert_links_chunk(&tables, from, &urls, false).unwrap();
        assert_eq!(outcome.new_urls, 1);

        // same link again, live: ignored; archived: a distinct row
        store.insert_links_chunk(&tables, from, &urls, false).unwrap();
        store.insert_links_chunk(&tables, from, &urls, true).unwrap();

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM news_main_links", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
