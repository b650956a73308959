//! Thread lifecycle records. The `threads` table is the single source of
//! truth for worker resurrection across process restarts.

use rusqlite::{params, Row};

use crate::models::{ModuleKind, ThreadOptions, ThreadRow};

use super::{Result, Store};

fn row_to_thread(row: &Row) -> rusqlite::Result<ThreadRow> {
    let module: String = row.get("module")?;
    Ok(ThreadRow {
        id: row.get::<_, i64>("id")? as u64,
        module: ModuleKind::parse(&module).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown thread module '{module}'").into(),
            )
        })?,
        status: row.get("status")?,
        paused: row.get::<_, i64>("paused")? != 0,
        options: ThreadOptions {
            website: row.get::<_, i64>("website")? as u64,
            url_list: row.get::<_, i64>("urllist")? as u64,
            config: row.get::<_, i64>("config")? as u64,
        },
        last: row.get::<_, i64>("last")? as u64,
        run_time: row.get::<_, i64>("runtime")? as u64,
        pause_time: row.get::<_, i64>("pausetime")? as u64,
        progress: row.get("progress")?,
    })
}

impl Store {
    /// All persisted worker records.
    pub fn get_threads(&mut self) -> Result<Vec<ThreadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM threads ORDER BY id")?;
            let threads = stmt
                .query_map([], row_to_thread)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(threads)
        })
    }

    /// Persist a new worker record and return its id.
    pub fn add_thread(&mut self, module: ModuleKind, options: ThreadOptions) -> Result<u64> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO threads (module, website, urllist, config) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                module.as_str(),
                options.website as i64,
                options.url_list as i64,
                options.config as i64,
            ])?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    /// Update status message and pause flag. A paused worker's message is
    /// stored with the `PAUSED` prefix.
    pub fn set_thread_status(&mut self, id: u64, paused: bool, status: &str) -> Result<()> {
        let message = if paused {
            if status.is_empty() {
                "PAUSED".to_string()
            } else {
                format!("PAUSED {status}")
            }
        } else {
            status.to_string()
        };
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE threads SET status = ?1, paused = ?2 WHERE id = ?3")?
                .execute(params![message, paused, id as i64])
                .map(|_| ())
        })
    }

    pub fn set_thread_progress(&mut self, id: u64, progress: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE threads SET progress = ?1 WHERE id = ?2")?
                .execute(params![progress, id as i64])
                .map(|_| ())
        })
    }

    pub fn set_thread_last(&mut self, id: u64, last: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE threads SET last = ?1 WHERE id = ?2")?
                .execute(params![last as i64, id as i64])
                .map(|_| ())
        })
    }

    pub fn set_thread_run_time(&mut self, id: u64, seconds: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE threads SET runtime = ?1 WHERE id = ?2")?
                .execute(params![seconds as i64, id as i64])
                .map(|_| ())
        })
    }

    pub fn set_thread_pause_time(&mut self, id: u64, seconds: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE threads SET pausetime = ?1 WHERE id = ?2")?
                .execute(params![seconds as i64, id as i64])
                .map(|_| ())
        })
    }

    pub fn get_thread_run_time(&mut self, id: u64) -> Result<u64> {
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT runtime FROM threads WHERE id = ?1")?
                .query_row(params![id as i64], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    pub fn get_thread_pause_time(&mut self, id: u64) -> Result<u64> {
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT pausetime FROM threads WHERE id = ?1")?
                .query_row(params![id as i64], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
    }

    /// Remove a worker record after a clean stop. Resets the auto-increment
    /// iff the table becomes empty.
    pub fn delete_thread(&mut self, id: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM threads WHERE id = ?1")?
                .execute(params![id as i64])?;
            Store::reset_auto_increment_if_empty(conn, "threads")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    #[test]
    fn thread_round_trip() {
        let (_dir, mut store) = scratch_store();
        let options = ThreadOptions {
            website: 1,
            url_list: 2,
            config: 3,
        };
        let id = store.add_thread(ModuleKind::Crawler, options).unwrap();

        store.set_thread_status(id, false, "crawling /").unwrap();
        store.set_thread_last(id, 17).unwrap();
        store.set_thread_run_time(id, 120).unwrap();
        store.set_thread_pause_time(id, 30).unwrap();
        store.set_thread_progress(id, 0.5).unwrap();

        let threads = store.get_threads().unwrap();
        assert_eq!(threads.len(), 1);
        let row = &threads[0];
        assert_eq!(row.id, id);
        assert_eq!(row.module, ModuleKind::Crawler);
        assert_eq!(row.options, options);
        assert_eq!(row.last, 17);
        assert_eq!(row.run_time, 120);
        assert_eq!(row.pause_time, 30);
        assert_eq!(row.status, "crawling /");
        assert!(!row.paused);
    }

    #[test]
    fn paused_status_gets_prefix() {
        let (_dir, mut store) = scratch_store();
        let id = store
            .add_thread(ModuleKind::Parser, ThreadOptions::default())
            .unwrap();
        store.set_thread_status(id, true, "waiting").unwrap();
        let row = store.get_threads().unwrap().remove(0);
        assert_eq!(row.status, "PAUSED waiting");
        assert!(row.paused);
    }

    #[test]
    fn delete_resets_auto_increment_when_empty() {
        let (_dir, mut store) = scratch_store();
        let first = store
            .add_thread(ModuleKind::Crawler, ThreadOptions::default())
            .unwrap();
        store.delete_thread(first).unwrap();
        let second = store
            .add_thread(ModuleKind::Crawler, ThreadOptions::default())
            .unwrap();
        // counter restarted because the table emptied
        assert_eq!(second, first);
    }
}
