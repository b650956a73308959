//! Registries of derived target tables (parsed / extracted / analyzed) and
//! their creation and deletion.

use rusqlite::params;

use crate::utils::urls::is_valid_namespace;

use super::{RepositoryError, Result, Store};

/// Kind of a derived target table, mapping to its registry and name infix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Parsed,
    Extracted,
    Analyzed,
}

impl TargetKind {
    pub fn registry(&self) -> &'static str {
        match self {
            TargetKind::Parsed => "parsedtables",
            TargetKind::Extracted => "extractedtables",
            TargetKind::Analyzed => "analyzedtables",
        }
    }

    pub fn infix(&self) -> &'static str {
        match self {
            TargetKind::Parsed => "parsed",
            TargetKind::Extracted => "extracted",
            TargetKind::Analyzed => "analyzed",
        }
    }
}

impl Store {
    /// Create a derived target table and register it. `fields` become TEXT
    /// columns after the fixed ones. Idempotent per (list, name).
    pub fn init_target_table(
        &mut self,
        kind: TargetKind,
        website: u64,
        url_list: u64,
        name: &str,
        fields: &[String],
    ) -> Result<String> {
        if !is_valid_namespace(name) {
            return Err(RepositoryError::Invalid(format!(
                "invalid target table namespace '{name}'"
            )));
        }
        let website_ns = self.get_website_namespace(website)?;
        let list_ns = self.get_url_list_namespace(url_list)?;
        let table = format!("{website_ns}_{list_ns}_{}_{name}", kind.infix());

        let mut columns = String::new();
        for field in fields {
            if !is_valid_namespace(field) {
                return Err(RepositoryError::Invalid(format!(
                    "invalid target field name '{field}'"
                )));
            }
            columns.push_str(&format!(", {}_{field} TEXT", kind.infix()));
        }

        let registry = kind.registry();
        let tx = self.lock_window()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content INTEGER NOT NULL,
                {infix}_id TEXT NOT NULL DEFAULT '',
                {infix}_datetime TEXT DEFAULT NULL{columns}
            )",
            infix = kind.infix(),
        ))?;
        let registered: bool = tx.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {registry} WHERE urllist = ?1 AND name = ?2)"
            ),
            params![url_list as i64, name],
            |row| row.get(0),
        )?;
        if !registered {
            tx.execute(
                &format!("INSERT INTO {registry} (website, urllist, name) VALUES (?1, ?2, ?3)"),
                params![website as i64, url_list as i64, name],
            )?;
        }
        tx.commit()?;
        Ok(table)
    }

    /// Registered target table names for one URL list.
    pub(crate) fn get_target_table_names(
        &mut self,
        registry: &'static str,
        url_list: u64,
    ) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT name FROM {registry} WHERE urllist = ?1 ORDER BY id"
            ))?;
            let names = stmt
                .query_map(params![url_list as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }

    pub fn get_target_tables(&mut self, kind: TargetKind, url_list: u64) -> Result<Vec<(u64, String)>> {
        let registry = kind.registry();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT id, name FROM {registry} WHERE urllist = ?1 ORDER BY id"
            ))?;
            let tables = stmt
                .query_map(params![url_list as i64], |row| {
                    Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tables)
        })
    }

    /// Write one row of a derived target table, replacing an existing row
    /// for the same content.
    pub fn upsert_target_row(
        &mut self,
        kind: TargetKind,
        table: &str,
        content_id: u64,
        parsed_id: &str,
        parsed_datetime: Option<&str>,
        fields: &[(String, String)],
    ) -> Result<()> {
        let infix = kind.infix();
        let mut columns = format!("content, {infix}_id, {infix}_datetime");
        let mut placeholders = "?1, ?2, ?3".to_string();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        let content_id = content_id as i64;
        values.push(&content_id);
        values.push(&parsed_id);
        values.push(&parsed_datetime);
        for (i, (name, value)) in fields.iter().enumerate() {
            columns.push_str(&format!(", {infix}_{name}"));
            placeholders.push_str(&format!(", ?{}", i + 4));
            values.push(value);
        }

        let tx = self.lock_window()?;
        tx.execute(
            &format!("DELETE FROM {table} WHERE content = ?1"),
            params![content_id],
        )?;
        tx.execute(
            &format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})"),
            values.as_slice(),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop a target table and deregister it, dispatching by its actual kind.
    pub fn delete_target_table(&mut self, kind: TargetKind, table_id: u64) -> Result<()> {
        let registry = kind.registry();
        let (website, url_list, name): (u64, u64, String) = {
            let row = self.with_conn(|conn| {
                match conn
                    .prepare_cached(&format!(
                        "SELECT website, urllist, name FROM {registry} WHERE id = ?1"
                    ))?
                    .query_row(params![table_id as i64], |row| {
                        Ok((
                            row.get::<_, i64>(0)? as u64,
                            row.get::<_, i64>(1)? as u64,
                            row.get::<_, String>(2)?,
                        ))
                    }) {
                    Ok(v) => Ok(Some(v)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })?;
            row.ok_or_else(|| {
                RepositoryError::NotFound(format!("{} #{table_id}", kind.registry()))
            })?
        };

        let website_ns = self.get_website_namespace(website)?;
        let list_ns = self.get_url_list_namespace(url_list)?;
        let table = format!("{website_ns}_{list_ns}_{}_{name}", kind.infix());

        let tx = self.lock_window()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
        tx.execute(
            &format!("DELETE FROM {registry} WHERE id = ?1"),
            params![table_id as i64],
        )?;
        Store::reset_auto_increment_if_empty(&tx, registry)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;
    use crate::repository::websites::table_exists;

    #[test]
    fn target_table_create_and_delete() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        let list = store.add_url_list(website, "Main", "main").unwrap();

        let table = store
            .init_target_table(
                TargetKind::Parsed,
                website,
                list,
                "articles",
                &["title".to_string(), "body".to_string()],
            )
            .unwrap();
        assert_eq!(table, "news_main_parsed_articles");
        store
            .with_conn(|conn| {
                assert!(table_exists(conn, "news_main_parsed_articles")?);
                Ok(())
            })
            .unwrap();

        let tables = store.get_target_tables(TargetKind::Parsed, list).unwrap();
        assert_eq!(tables.len(), 1);

        store
            .delete_target_table(TargetKind::Parsed, tables[0].0)
            .unwrap();
        store
            .with_conn(|conn| {
                assert!(!table_exists(conn, "news_main_parsed_articles")?);
                Ok(())
            })
            .unwrap();
        assert!(store
            .get_target_tables(TargetKind::Parsed, list)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn registration_is_idempotent() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        let list = store.add_url_list(website, "Main", "main").unwrap();
        store
            .init_target_table(TargetKind::Analyzed, website, list, "corpus", &[])
            .unwrap();
        store
            .init_target_table(TargetKind::Analyzed, website, list, "corpus", &[])
            .unwrap();
        assert_eq!(
            store.get_target_tables(TargetKind::Analyzed, list).unwrap().len(),
            1
        );
    }
}
