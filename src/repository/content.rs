//! Crawled content rows. Bodies are gzip-compressed row by row before they
//! reach the database and decompressed on read.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;

use super::{ListTables, Result, Store};

fn compress(content: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content.as_bytes())?;
    encoder.finish()
}

fn decompress(blob: &[u8]) -> std::io::Result<String> {
    let mut decoder = GzDecoder::new(blob);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

fn io_error(error: std::io::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(error))
}

impl Store {
    /// Write one live content row for a URL.
    pub fn save_content(
        &mut self,
        tables: &ListTables,
        url_id: u64,
        response: u16,
        content_type: &str,
        content: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (url, response, type, content) VALUES (?1, ?2, ?3, ?4)",
            tables.crawled
        );
        self.with_conn(|conn| {
            let blob = compress(content).map_err(io_error)?;
            conn.prepare_cached(&sql)?
                .execute(params![url_id as i64, response, content_type, blob])
                .map(|_| ())
        })
    }

    /// Write one archived content row carrying its memento timestamp.
    pub fn save_archived_content(
        &mut self,
        tables: &ListTables,
        url_id: u64,
        timestamp: &str,
        response: u16,
        content_type: &str,
        content: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (url, crawltime, archived, response, type, content) \
             VALUES (?1, ?2, 1, ?3, ?4, ?5)",
            tables.crawled
        );
        self.with_conn(|conn| {
            let blob = compress(content).map_err(io_error)?;
            conn.prepare_cached(&sql)?
                .execute(params![url_id as i64, timestamp, response, content_type, blob])
                .map(|_| ())
        })
    }

    /// Whether an archived capture of this URL at this timestamp exists.
    pub fn has_archived_content(
        &mut self,
        tables: &ListTables,
        url_id: u64,
        timestamp: &str,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE url = ?1 AND archived = 1 AND crawltime = ?2)",
            tables.crawled
        );
        self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row(params![url_id as i64, timestamp], |row| row.get(0))
        })
    }

    /// The most recent content row for a URL, decompressed.
    pub fn latest_content(
        &mut self,
        tables: &ListTables,
        url_id: u64,
    ) -> Result<Option<(u64, String)>> {
        let sql = format!(
            "SELECT id, content FROM {} WHERE url = ?1 ORDER BY crawltime DESC, id DESC LIMIT 1",
            tables.crawled
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            match stmt.query_row(params![url_id as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
            }) {
                Ok((id, blob)) => Ok(Some((id, decompress(&blob).map_err(io_error)?))),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    /// Every content row for a URL, oldest first, decompressed.
    pub fn all_contents(
        &mut self,
        tables: &ListTables,
        url_id: u64,
    ) -> Result<Vec<(u64, String)>> {
        let sql = format!(
            "SELECT id, content FROM {} WHERE url = ?1 ORDER BY crawltime, id",
            tables.crawled
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![url_id as i64], |row| {
                    Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(id, blob)| Ok((id, decompress(&blob).map_err(io_error)?)))
                .collect()
        })
    }

    /// Number of live (non-archived) content rows for a URL.
    pub fn count_live_content(&mut self, tables: &ListTables, url_id: u64) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE url = ?1 AND archived = 0",
            tables.crawled
        );
        self.with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row(params![url_id as i64], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
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
    fn content_round_trip_through_compression() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let id = store.add_url(&tables, "/", true).unwrap();

        let body = "<html><body>hello</body></html>".repeat(100);
        store
            .save_content(&tables, id, 200, "text/html", &body)
            .unwrap();

        let (_, read_back) = store.latest_content(&tables, id).unwrap().unwrap();
        assert_eq!(read_back, body);
        assert_eq!(store.count_live_content(&tables, id).unwrap(), 1);

        // stored blob is actually smaller than the repetitive body
        let stored: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT LENGTH(content) FROM news_main_crawled", [], |row| {
                    row.get(0)
                })
            })
            .unwrap();
        assert!((stored as usize) < body.len());
    }

    #[test]
    fn archived_content_keyed_by_timestamp() {
        let (_dir, mut store) = scratch_store();
        let tables = list_fixture(&mut store);
        let id = store.add_url(&tables, "/", true).unwrap();

        assert!(!store
            .has_archived_content(&tables, id, "2021-01-07 12:00:00")
            .unwrap());
        store
            .save_archived_content(&tables, id, "2021-01-07 12:00:00", 200, "text/html", "<html/>")
            .unwrap();
        assert!(store
            .has_archived_content(&tables, id, "2021-01-07 12:00:00")
            .unwrap());
        assert!(!store
            .has_archived_content(&tables, id, "2021-01-08 12:00:00")
            .unwrap());
        // archived rows do not count as live content
        assert_eq!(store.count_live_content(&tables, id).unwrap(), 0);
    }
}
