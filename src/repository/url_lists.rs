//! URL list CRUD. Creating a list materialises its URL, crawled-content and
//! link tables; deleting it drops them again.

use rusqlite::{params, Row};

use crate::models::UrlList;
use crate::utils::urls::is_valid_namespace;

use super::websites::table_exists;
use super::{RepositoryError, Result, Store};

fn row_to_url_list(row: &Row) -> rusqlite::Result<UrlList> {
    Ok(UrlList {
        id: row.get::<_, i64>("id")? as u64,
        website: row.get::<_, i64>("website")? as u64,
        name: row.get("name")?,
        namespace: row.get("namespace")?,
    })
}

impl Store {
    /// Add a URL list and create its three physical tables.
    pub fn add_url_list(&mut self, website: u64, name: &str, namespace: &str) -> Result<u64> {
        if !is_valid_namespace(namespace) {
            return Err(RepositoryError::Invalid(format!(
                "invalid URL list namespace '{namespace}'"
            )));
        }
        if namespace == "config" {
            return Err(RepositoryError::Invalid(
                "URL list namespace 'config' is reserved".to_string(),
            ));
        }
        if self.is_url_list_namespace(website, namespace)? {
            return Err(RepositoryError::Invalid(format!(
                "URL list namespace '{namespace}' already exists"
            )));
        }
        let website_ns = self.get_website_namespace(website)?;

        let tx = self.lock_window()?;
        tx.prepare_cached("INSERT INTO urllists (website, name, namespace) VALUES (?1, ?2, ?3)")?
            .execute(params![website as i64, name, namespace])?;
        let id = tx.last_insert_rowid() as u64;
        Store::create_list_tables(&tx, &website_ns, namespace)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_url_list(&mut self, id: u64) -> Result<Option<UrlList>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM urllists WHERE id = ?1")?;
            match stmt.query_row(params![id as i64], row_to_url_list) {
                Ok(list) => Ok(Some(list)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    pub fn get_url_lists(&mut self, website: u64) -> Result<Vec<UrlList>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT * FROM urllists WHERE website = ?1 ORDER BY id")?;
            let lists = stmt
                .query_map(params![website as i64], row_to_url_list)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(lists)
        })
    }

    pub fn is_url_list(&mut self, website: u64, id: u64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM urllists WHERE website = ?1 AND id = ?2)",
            )?
            .query_row(params![website as i64, id as i64], |row| row.get(0))
        })
    }

    pub fn is_url_list_namespace(&mut self, website: u64, namespace: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM urllists WHERE website = ?1 AND namespace = ?2)",
            )?
            .query_row(params![website as i64, namespace], |row| row.get(0))
        })
    }

    pub fn get_url_list_namespace(&mut self, id: u64) -> Result<String> {
        let namespace = self.with_conn(|conn| {
            match conn
                .prepare_cached("SELECT namespace FROM urllists WHERE id = ?1")?
                .query_row(params![id as i64], |row| row.get::<_, String>(0))
            {
                Ok(ns) => Ok(Some(ns)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        namespace.ok_or_else(|| RepositoryError::NotFound(format!("URL list #{id}")))
    }

    /// Update a URL list. A namespace change renames the list's physical
    /// tables (including derived target tables) in one transaction.
    pub fn update_url_list(&mut self, id: u64, name: &str, namespace: &str) -> Result<()> {
        let list = self
            .get_url_list(id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("URL list #{id}")))?;
        if namespace == list.namespace {
            return self.with_conn(|conn| {
                conn.prepare_cached("UPDATE urllists SET name = ?1 WHERE id = ?2")?
                    .execute(params![name, id as i64])
                    .map(|_| ())
            });
        }

        if !is_valid_namespace(namespace) || namespace == "config" {
            return Err(RepositoryError::Invalid(format!(
                "invalid URL list namespace '{namespace}'"
            )));
        }
        if self.is_url_list_namespace(list.website, namespace)? {
            return Err(RepositoryError::Invalid(format!(
                "URL list namespace '{namespace}' already exists"
            )));
        }

        let website_ns = self.get_website_namespace(list.website)?;
        let old_base = format!("{website_ns}_{}", list.namespace);
        let new_base = format!("{website_ns}_{namespace}");

        let mut renames = vec![
            (old_base.clone(), new_base.clone()),
            (format!("{old_base}_crawled"), format!("{new_base}_crawled")),
            (format!("{old_base}_links"), format!("{new_base}_links")),
        ];
        for (kind, registry) in [
            ("parsed", "parsedtables"),
            ("extracted", "extractedtables"),
            ("analyzed", "analyzedtables"),
        ] {
            for target in self.get_target_table_names(registry, id)? {
                renames.push((
                    format!("{old_base}_{kind}_{target}"),
                    format!("{new_base}_{kind}_{target}"),
                ));
            }
        }

        let tx = self.lock_window()?;
        for (from, to) in &renames {
            tx.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))?;
        }
        tx.prepare_cached("UPDATE urllists SET name = ?1, namespace = ?2 WHERE id = ?3")?
            .execute(params![name, namespace, id as i64])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a URL list: drop links, crawled content, derived target tables
    /// and the URL table itself, then the parent row.
    pub fn delete_url_list(&mut self, id: u64) -> Result<()> {
        let list = self
            .get_url_list(id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("URL list #{id}")))?;
        let website_ns = self.get_website_namespace(list.website)?;
        let base = format!("{website_ns}_{}", list.namespace);

        let mut drops = Vec::new();
        for (kind, registry) in [
            ("parsed", "parsedtables"),
            ("extracted", "extractedtables"),
            ("analyzed", "analyzedtables"),
        ] {
            for target in self.get_target_table_names(registry, id)? {
                drops.push(format!("{base}_{kind}_{target}"));
            }
        }
        drops.push(format!("{base}_links"));
        drops.push(format!("{base}_crawled"));
        drops.push(base);

        let tx = self.lock_window()?;
        for table in &drops {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
        }
        for registry in ["parsedtables", "extractedtables", "analyzedtables"] {
            tx.execute(
                &format!("DELETE FROM {registry} WHERE urllist = ?1"),
                params![id as i64],
            )?;
        }
        tx.prepare_cached("DELETE FROM urllists WHERE id = ?1")?
            .execute(params![id as i64])?;
        Store::reset_auto_increment_if_empty(&tx, "urllists")?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    #[test]
    fn creating_a_list_materialises_tables() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        store.add_url_list(website, "Main", "main").unwrap();
        store
            .with_conn(|conn| {
                assert!(table_exists(conn, "news_main")?);
                assert!(table_exists(conn, "news_main_crawled")?);
                assert!(table_exists(conn, "news_main_links")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn config_namespace_is_reserved() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        assert!(store.add_url_list(website, "x", "config").is_err());
    }

    #[test]
    fn list_rename_round_trip() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        let id = store.add_url_list(website, "Main", "main").unwrap();

        store.update_url_list(id, "Main", "other").unwrap();
        store.update_url_list(id, "Main", "main").unwrap();
        store
            .with_conn(|conn| {
                assert!(table_exists(conn, "news_main")?);
                assert!(!table_exists(conn, "news_other")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_drops_all_tables() {
        let (_dir, mut store) = scratch_store();
        let website = store.add_website("News", "news", "example.com").unwrap();
        let id = store.add_url_list(website, "Main", "main").unwrap();
        store.delete_url_list(id).unwrap();
        store
            .with_conn(|conn| {
                assert!(!table_exists(conn, "news_main")?);
                assert!(!table_exists(conn, "news_main_crawled")?);
                assert!(!table_exists(conn, "news_main_links")?);
                Ok(())
            })
            .unwrap();
        assert!(store.get_url_list(id).unwrap().is_none());
    }
}
