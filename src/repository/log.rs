//! Module log operations.

use rusqlite::params;

use super::{Result, Store};

impl Store {
    /// Append a log entry for a module.
    pub fn log(&mut self, module: &str, entry: &str) -> Result<()> {
        tracing::debug!(module, "{entry}");
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT INTO log (module, entry) VALUES (?1, ?2)")?
                .execute(params![module, entry])
                .map(|_| ())
        })
    }

    /// Number of log entries, optionally restricted to one module.
    pub fn count_log_entries(&mut self, module: &str) -> Result<u64> {
        self.with_conn(|conn| {
            if module.is_empty() {
                conn.query_row("SELECT COUNT(*) FROM log", [], |row| row.get::<_, i64>(0))
            } else {
                conn.query_row(
                    "SELECT COUNT(*) FROM log WHERE module = ?1",
                    [module],
                    |row| row.get::<_, i64>(0),
                )
            }
            .map(|n| n as u64)
        })
    }

    /// Remove log entries, optionally restricted to one module. Empty module
    /// clears everything.
    pub fn clear_logs(&mut self, module: &str) -> Result<()> {
        self.with_conn(|conn| {
            if module.is_empty() {
                conn.execute("DELETE FROM log", [])?;
            } else {
                conn.execute("DELETE FROM log WHERE module = ?1", [module])?;
            }
            Store::reset_auto_increment_if_empty(conn, "log")
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::test_support::scratch_store;

    #[test]
    fn log_write_count_clear() {
        let (_dir, mut store) = scratch_store();
        store.log("crawler", "first entry").unwrap();
        store.log("crawler", "second entry").unwrap();
        store.log("server", "other module").unwrap();

        assert_eq!(store.count_log_entries("crawler").unwrap(), 2);
        assert_eq!(store.count_log_entries("").unwrap(), 3);

        store.clear_logs("crawler").unwrap();
        assert_eq!(store.count_log_entries("crawler").unwrap(), 0);
        assert_eq!(store.count_log_entries("server").unwrap(), 1);

        store.clear_logs("").unwrap();
        assert_eq!(store.count_log_entries("").unwrap(), 0);
    }
}
