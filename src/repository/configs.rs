//! Stored configurations: JSON arrays of `{cat, name, value}` triples,
//! parsed once per worker start.

use rusqlite::{params, Row};

use crate::models::{ConfigEntry, Configuration};

use super::{RepositoryError, Result, Store};

fn row_to_configuration(row: &Row) -> rusqlite::Result<Configuration> {
    Ok(Configuration {
        id: row.get::<_, i64>("id")? as u64,
        website: row.get::<_, i64>("website")? as u64,
        module: row.get("module")?,
        name: row.get("name")?,
        config: row.get("config")?,
    })
}

/// Parse a configuration body into its entries.
pub fn parse_config_entries(body: &str) -> Result<Vec<ConfigEntry>> {
    Ok(serde_json::from_str(body)?)
}

impl Store {
    pub fn add_configuration(
        &mut self,
        website: u64,
        module: &str,
        name: &str,
        config: &str,
    ) -> Result<u64> {
        // reject bodies that cannot be parsed later by a worker
        parse_config_entries(config)?;
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO configs (website, module, name, config) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![website as i64, module, name, config])?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    pub fn get_configuration(&mut self, id: u64) -> Result<Configuration> {
        let config = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM configs WHERE id = ?1")?;
            match stmt.query_row(params![id as i64], row_to_configuration) {
                Ok(c) => Ok(Some(c)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        config.ok_or_else(|| RepositoryError::NotFound(format!("configuration #{id}")))
    }

    pub fn get_configurations(&mut self, website: u64) -> Result<Vec<Configuration>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT * FROM configs WHERE website = ?1 ORDER BY id")?;
            let configs = stmt
                .query_map(params![website as i64], row_to_configuration)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(configs)
        })
    }

    pub fn is_configuration(&mut self, website: u64, id: u64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM configs WHERE id = ?1 AND website = ?2)",
            )?
            .query_row(params![id as i64, website as i64], |row| row.get(0))
        })
    }

    pub fn update_configuration(&mut self, id: u64, name: &str, config: &str) -> Result<()> {
        parse_config_entries(config)?;
        self.with_conn(|conn| {
            conn.prepare_cached("UPDATE configs SET name = ?1, config = ?2 WHERE id = ?3")?
                .execute(params![name, config, id as i64])
                .map(|_| ())
        })
    }

    pub fn delete_configuration(&mut self, id: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM configs WHERE id = ?1")?
                .execute(params![id as i64])?;
            Store::reset_auto_increment_if_empty(conn, "configs")
        })
    }

    pub fn duplicate_configuration(&mut self, id: u64) -> Result<u64> {
        let config = self.get_configuration(id)?;
        self.add_configuration(config.website, &config.module, &config.name, &config.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    #[test]
    fn configuration_round_trip() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        let body = r#"[{"cat":"crawler","name":"retries","value":2}]"#;
        let id = store
            .add_configuration(website, "crawler", "default", body)
            .unwrap();
        let config = store.get_configuration(id).unwrap();
        assert_eq!(config.module, "crawler");

        let entries = parse_config_entries(&config.config).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cat, "crawler");
        assert_eq!(entries[0].name, "retries");
        assert_eq!(entries[0].value, serde_json::json!(2));
    }

    #[test]
    fn rejects_malformed_body() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        assert!(store
            .add_configuration(website, "crawler", "bad", "{not json")
            .is_err());
    }
}
