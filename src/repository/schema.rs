//! Global schema and per-URL-list table creation.
//!
//! Namespaces are validated against `[A-Za-z0-9$_]+` before they reach this
//! module, which makes direct interpolation into DDL safe.

use rusqlite::Connection;

use super::{Result, Store};

impl Store {
    /// Create the global tables. Called once by the supervisor at startup;
    /// idempotent.
    pub fn init_schema(&mut self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    module TEXT NOT NULL,
                    entry TEXT NOT NULL,
                    time TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                );

                CREATE TABLE IF NOT EXISTS websites (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    namespace TEXT NOT NULL UNIQUE,
                    domain TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS urllists (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL REFERENCES websites(id),
                    name TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    UNIQUE(website, namespace)
                );

                CREATE TABLE IF NOT EXISTS queries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL DEFAULT 0,
                    name TEXT NOT NULL,
                    query TEXT NOT NULL,
                    type TEXT NOT NULL,
                    resultbool INTEGER NOT NULL DEFAULT 0,
                    resultsingle INTEGER NOT NULL DEFAULT 0,
                    resultmulti INTEGER NOT NULL DEFAULT 0,
                    textonly INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS configs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL REFERENCES websites(id),
                    module TEXT NOT NULL,
                    name TEXT NOT NULL,
                    config TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS threads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    module TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT '',
                    paused INTEGER NOT NULL DEFAULT 0,
                    website INTEGER NOT NULL,
                    urllist INTEGER NOT NULL,
                    config INTEGER NOT NULL,
                    last INTEGER NOT NULL DEFAULT 0,
                    runtime INTEGER NOT NULL DEFAULT 0,
                    pausetime INTEGER NOT NULL DEFAULT 0,
                    progress REAL NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS parsedtables (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL,
                    urllist INTEGER NOT NULL,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS extractedtables (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL,
                    urllist INTEGER NOT NULL,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS analyzedtables (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    website INTEGER NOT NULL,
                    urllist INTEGER NOT NULL,
                    name TEXT NOT NULL
                );
            "#,
            )
        })
    }

    /// Create the three physical tables of a URL list.
    pub(crate) fn create_list_tables(
        conn: &Connection,
        website_ns: &str,
        list_ns: &str,
    ) -> rusqlite::Result<()> {
        let urls = format!("{website_ns}_{list_ns}");
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {urls} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                manual INTEGER NOT NULL DEFAULT 0,
                url TEXT NOT NULL,
                hash INTEGER NOT NULL DEFAULT 0,
                crawled INTEGER NOT NULL DEFAULT 0,
                parsed INTEGER NOT NULL DEFAULT 0,
                extracted INTEGER NOT NULL DEFAULT 0,
                analyzed INTEGER NOT NULL DEFAULT 0,
                crawllock TEXT DEFAULT NULL,
                parselock TEXT DEFAULT NULL,
                extractlock TEXT DEFAULT NULL,
                analyzelock TEXT DEFAULT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{urls}_hash ON {urls}(hash);

            CREATE TABLE IF NOT EXISTS {urls}_crawled (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url INTEGER NOT NULL REFERENCES {urls}(id) ON DELETE CASCADE,
                crawltime TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                archived INTEGER NOT NULL DEFAULT 0,
                response INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                content BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{urls}_crawled_time ON {urls}_crawled(crawltime);
            CREATE INDEX IF NOT EXISTS idx_{urls}_crawled_url ON {urls}_crawled(url);

            CREATE TABLE IF NOT EXISTS {urls}_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fromurl INTEGER NOT NULL REFERENCES {urls}(id) ON DELETE CASCADE,
                tourl INTEGER NOT NULL REFERENCES {urls}(id) ON DELETE CASCADE,
                archived INTEGER NOT NULL DEFAULT 0,
                UNIQUE(fromurl, tourl, archived)
            );
        "#
        ))
    }
}
