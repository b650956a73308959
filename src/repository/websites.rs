//! Website CRUD including the all-or-nothing namespace rename and the deep
//! duplicate used by the front-end.

use rusqlite::{params, Connection, Row};

use crate::models::Website;
use crate::utils::urls::{duplicate_namespace, is_valid_namespace};

use super::{RepositoryError, Result, Store};

fn row_to_website(row: &Row) -> rusqlite::Result<Website> {
    Ok(Website {
        id: row.get::<_, i64>("id")? as u64,
        name: row.get("name")?,
        namespace: row.get("namespace")?,
        domain: row.get("domain")?,
    })
}

/// Strip scheme and trailing slash; the domain is stored bare.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain
        .trim()
        .strip_prefix("https://")
        .or_else(|| domain.trim().strip_prefix("http://"))
        .unwrap_or(domain.trim());
    domain.trim_end_matches('/').to_string()
}

impl Store {
    pub fn add_website(&mut self, name: &str, namespace: &str, domain: &str) -> Result<u64> {
        if !is_valid_namespace(namespace) {
            return Err(RepositoryError::Invalid(format!(
                "invalid website namespace '{namespace}'"
            )));
        }
        if self.is_website_namespace(namespace)? {
            return Err(RepositoryError::Invalid(format!(
                "website namespace '{namespace}' already exists"
            )));
        }
        let domain = normalize_domain(domain);
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO websites (name, namespace, domain) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![name, namespace, domain])?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    pub fn get_website(&mut self, id: u64) -> Result<Option<Website>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM websites WHERE id = ?1")?;
            match stmt.query_row(params![id as i64], row_to_website) {
                Ok(website) => Ok(Some(website)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    pub fn get_websites(&mut self) -> Result<Vec<Website>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM websites ORDER BY id")?;
            let websites = stmt
                .query_map([], row_to_website)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(websites)
        })
    }

    pub fn is_website(&mut self, id: u64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT EXISTS(SELECT 1 FROM websites WHERE id = ?1)")?
                .query_row(params![id as i64], |row| row.get(0))
        })
    }

    pub fn is_website_namespace(&mut self, namespace: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached("SELECT EXISTS(SELECT 1 FROM websites WHERE namespace = ?1)")?
                .query_row(params![namespace], |row| row.get(0))
        })
    }

    pub fn get_website_namespace(&mut self, id: u64) -> Result<String> {
        let namespace = self.with_conn(|conn| {
            to_option_sql(
                conn.prepare_cached("SELECT namespace FROM websites WHERE id = ?1")?
                    .query_row(params![id as i64], |row| row.get::<_, String>(0)),
            )
        })?;
        namespace.ok_or_else(|| RepositoryError::NotFound(format!("website #{id}")))
    }

    pub fn get_website_domain(&mut self, id: u64) -> Result<String> {
        let domain = self.with_conn(|conn| {
            to_option_sql(
                conn.prepare_cached("SELECT domain FROM websites WHERE id = ?1")?
                    .query_row(params![id as i64], |row| row.get::<_, String>(0)),
            )
        })?;
        domain.ok_or_else(|| RepositoryError::NotFound(format!("website #{id}")))
    }

    /// Update a website. A namespace change renames every dependent physical
    /// table in one transaction; either all children are renamed or none is.
    pub fn update_website(
        &mut self,
        id: u64,
        name: &str,
        namespace: &str,
        domain: &str,
    ) -> Result<()> {
        let old_namespace = self.get_website_namespace(id)?;
        if namespace != old_namespace {
            if !is_valid_namespace(namespace) {
                return Err(RepositoryError::Invalid(format!(
                    "invalid website namespace '{namespace}'"
                )));
            }
            if self.is_website_namespace(namespace)? {
                return Err(RepositoryError::Invalid(format!(
                    "website namespace '{namespace}' already exists"
                )));
            }
        }
        let domain = normalize_domain(domain);

        if namespace == old_namespace {
            return self.with_conn(|conn| {
                conn.prepare_cached("UPDATE websites SET name = ?1, domain = ?2 WHERE id = ?3")?
                    .execute(params![name, domain, id as i64])
                    .map(|_| ())
            });
        }

        let renames = self.collect_website_tables(id, &old_namespace, namespace)?;
        let tx = self.lock_window()?;
        for (from, to) in &renames {
            tx.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))?;
        }
        tx.prepare_cached("UPDATE websites SET name = ?1, namespace = ?2, domain = ?3 WHERE id = ?4")?
            .execute(params![name, namespace, domain, id as i64])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a website and every child URL list. Resets the auto-increment
    /// iff the websites table becomes empty.
    pub fn delete_website(&mut self, id: u64) -> Result<()> {
        for list in self.get_url_lists(id)? {
            self.delete_url_list(list.id)?;
        }
        for query in self.get_queries(id)? {
            if query.website == id {
                self.delete_query(query.id)?;
            }
        }
        for config in self.get_configurations(id)? {
            self.delete_configuration(config.id)?;
        }
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM websites WHERE id = ?1")?
                .execute(params![id as i64])?;
            Store::reset_auto_increment_if_empty(conn, "websites")
        })
    }

    /// Duplicate a website: same name and domain, a freshly minted namespace,
    /// and deep copies of its URL-list namespaces, queries and configurations
    /// (no crawled data).
    pub fn duplicate_website(&mut self, id: u64) -> Result<u64> {
        let website = self
            .get_website(id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("website #{id}")))?;

        let mut taken = Vec::new();
        for existing in self.get_websites()? {
            taken.push(existing.namespace);
        }
        let new_namespace = duplicate_namespace(&website.namespace, |ns| {
            taken.iter().any(|t| t == ns)
        });

        let new_id = self.add_website(&website.name, &new_namespace, &website.domain)?;

        for list in self.get_url_lists(id)? {
            self.add_url_list(new_id, &list.name, &list.namespace)?;
        }
        for query in self.get_queries(id)? {
            if query.website == id {
                self.add_query(
                    new_id,
                    &query.name,
                    &query.text,
                    query.kind,
                    query.result_bool,
                    query.result_single,
                    query.result_multi,
                    query.text_only,
                )?;
            }
        }
        for config in self.get_configurations(id)? {
            self.add_configuration(new_id, &config.module, &config.name, &config.config)?;
        }

        Ok(new_id)
    }

    /// Every physical table belonging to a website, as (old, new) rename pairs.
    fn collect_website_tables(
        &mut self,
        id: u64,
        old_ns: &str,
        new_ns: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut renames = Vec::new();
        for list in self.get_url_lists(id)? {
            let base = format!("{old_ns}_{}", list.namespace);
            let target = format!("{new_ns}_{}", list.namespace);
            renames.push((base.clone(), target.clone()));
            renames.push((format!("{base}_crawled"), format!("{target}_crawled")));
            renames.push((format!("{base}_links"), format!("{target}_links")));
            for (kind, registry) in [
                ("parsed", "parsedtables"),
                ("extracted", "extractedtables"),
                ("analyzed", "analyzedtables"),
            ] {
                for name in self.get_target_table_names(registry, list.id)? {
                    renames.push((
                        format!("{base}_{kind}_{name}"),
                        format!("{target}_{kind}_{name}"),
                    ));
                }
            }
        }
        Ok(renames)
    }
}

fn to_option_sql<T>(result: rusqlite::Result<T>) -> rusqlite::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether a table exists (used by tests and the rename cascade).
pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryKind;
    use crate::repository::test_support::scratch_store;

    #[test]
    fn add_and_fetch_website() {
        let (_dir, mut store) = scratch_store();
        let id = store
            .add_website("News", "news", "https://example.com/")
            .unwrap();
        let website = store.get_website(id).unwrap().unwrap();
        assert_eq!(website.namespace, "news");
        // stored without scheme or trailing slash
        assert_eq!(website.domain, "example.com");
    }

    #[test]
    fn rejects_invalid_and_duplicate_namespaces() {
        let (_dir, mut store) = scratch_store();
        assert!(store.add_website("x", "ab", "example.com").is_err());
        assert!(store.add_website("x", "bad-ns", "example.com").is_err());
        store.add_website("x", "news", "example.com").unwrap();
        assert!(store.add_website("y", "news", "example.org").is_err());
    }

    #[test]
    fn namespace_rename_is_reversible() {
        let (_dir, mut store) = scratch_store();
        let id = store.add_website("News", "ns_a", "example.com").unwrap();
        store.add_url_list(id, "Main", "main").unwrap();

        store.update_website(id, "News", "ns_b", "example.com").unwrap();
        store
            .with_conn(|conn| {
                assert!(table_exists(conn, "ns_b_main")?);
                assert!(table_exists(conn, "ns_b_main_crawled")?);
                assert!(table_exists(conn, "ns_b_main_links")?);
                assert!(!table_exists(conn, "ns_a_main")?);
                Ok(())
            })
            .unwrap();

        // renaming back restores every physical table name
        store.update_website(id, "News", "ns_a", "example.com").unwrap();
        store
            .with_conn(|conn| {
                assert!(table_exists(conn, "ns_a_main")?);
                assert!(!table_exists(conn, "ns_b_main")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_website_copies_children() {
        let (_dir, mut store) = scratch_store();
        let id = store.add_website("News", "news", "example.com").unwrap();
        store.add_url_list(id, "Main", "main").unwrap();
        store
            .add_query(id, "links", "//a/@href", QueryKind::XPath, false, false, true, false)
            .unwrap();
        store
            .add_configuration(id, "crawler", "default", "[]")
            .unwrap();

        let copy = store.duplicate_website(id).unwrap();
        let copied = store.get_website(copy).unwrap().unwrap();
        assert_eq!(copied.namespace, "news2");
        assert_eq!(copied.name, "News");

        let lists = store.get_url_lists(copy).unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].namespace, "main");

        let queries: Vec<_> = store
            .get_queries(copy)
            .unwrap()
            .into_iter()
            .filter(|q| q.website == copy)
            .collect();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].text, "//a/@href");

        assert_eq!(store.get_configurations(copy).unwrap().len(), 1);
    }

    #[test]
    fn delete_website_cascades() {
        let (_dir, mut store) = scratch_store();
        let id = store.add_website("News", "news", "example.com").unwrap();
        store.add_url_list(id, "Main", "main").unwrap();
        store.delete_website(id).unwrap();

        assert!(store.get_website(id).unwrap().is_none());
        store
            .with_conn(|conn| {
                assert!(!table_exists(conn, "news_main")?);
                Ok(())
            })
            .unwrap();
    }
}
