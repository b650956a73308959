//! Stored query definitions.

use rusqlite::{params, Row};

use crate::models::{QueryKind, QueryProperties};

use super::{RepositoryError, Result, Store};

fn row_to_query(row: &Row) -> rusqlite::Result<QueryProperties> {
    let kind: String = row.get("type")?;
    Ok(QueryProperties {
        id: row.get::<_, i64>("id")? as u64,
        website: row.get::<_, i64>("website")? as u64,
        name: row.get("name")?,
        text: row.get("query")?,
        kind: QueryKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown query type '{kind}'").into(),
            )
        })?,
        result_bool: row.get::<_, i64>("resultbool")? != 0,
        result_single: row.get::<_, i64>("resultsingle")? != 0,
        result_multi: row.get::<_, i64>("resultmulti")? != 0,
        text_only: row.get::<_, i64>("textonly")? != 0,
    })
}

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn add_query(
        &mut self,
        website: u64,
        name: &str,
        text: &str,
        kind: QueryKind,
        result_bool: bool,
        result_single: bool,
        result_multi: bool,
        text_only: bool,
    ) -> Result<u64> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO queries (website, name, query, type, resultbool, resultsingle, resultmulti, textonly) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?
            .execute(params![
                website as i64,
                name,
                text,
                kind.as_str(),
                result_bool,
                result_single,
                result_multi,
                text_only,
            ])?;
            Ok(conn.last_insert_rowid() as u64)
        })
    }

    /// Properties of one query; referenced by numeric id from configurations.
    pub fn get_query_properties(&mut self, id: u64) -> Result<QueryProperties> {
        let query = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM queries WHERE id = ?1")?;
            match stmt.query_row(params![id as i64], row_to_query) {
                Ok(q) => Ok(Some(q)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        query.ok_or_else(|| RepositoryError::NotFound(format!("query #{id}")))
    }

    /// Queries of a website, plus the global ones (`website = 0`).
    pub fn get_queries(&mut self, website: u64) -> Result<Vec<QueryProperties>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM queries WHERE website = ?1 OR website = 0 ORDER BY id",
            )?;
            let queries = stmt
                .query_map(params![website as i64], row_to_query)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(queries)
        })
    }

    pub fn is_query(&mut self, website: u64, id: u64) -> Result<bool> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT EXISTS(SELECT 1 FROM queries WHERE id = ?1 AND (website = ?2 OR website = 0))",
            )?
            .query_row(params![id as i64, website as i64], |row| row.get(0))
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_query(
        &mut self,
        id: u64,
        name: &str,
        text: &str,
        kind: QueryKind,
        result_bool: bool,
        result_single: bool,
        result_multi: bool,
        text_only: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "UPDATE queries SET name = ?1, query = ?2, type = ?3, resultbool = ?4, \
                 resultsingle = ?5, resultmulti = ?6, textonly = ?7 WHERE id = ?8",
            )?
            .execute(params![
                name,
                text,
                kind.as_str(),
                result_bool,
                result_single,
                result_multi,
                text_only,
                id as i64,
            ])
            .map(|_| ())
        })
    }

    pub fn delete_query(&mut self, id: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM queries WHERE id = ?1")?
                .execute(params![id as i64])?;
            Store::reset_auto_increment_if_empty(conn, "queries")
        })
    }

    pub fn duplicate_query(&mut self, id: u64) -> Result<u64> {
        let query = self.get_query_properties(id)?;
        self.add_query(
            query.website,
            &query.name,
            &query.text,
            query.kind,
            query.result_bool,
            query.result_single,
            query.result_multi,
            query.text_only,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::scratch_store;

    #[test]
    fn query_round_trip() {
        let (_dir, mut store) = scratch_store();
        let id = store
            .add_query(1, "links", "//a/@href", QueryKind::XPath, false, false, true, false)
            .unwrap();
        let query = store.get_query_properties(id).unwrap();
        assert_eq!(query.kind, QueryKind::XPath);
        assert!(query.result_multi);
        assert!(!query.result_bool);
    }

    #[test]
    fn global_queries_visible_to_all_websites() {
        let (_dir, mut store) = scratch_store();
        store
            .add_query(0, "html", "text/html", QueryKind::Regex, true, false, false, false)
            .unwrap();
        store
            .add_query(7, "local", "x", QueryKind::Regex, true, false, false, false)
            .unwrap();
        assert_eq!(store.get_queries(7).unwrap().len(), 2);
        assert_eq!(store.get_queries(8).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_copies_flags() {
        let (_dir, mut store) = scratch_store();
        let id = store
            .add_query(1, "q", "a+", QueryKind::Regex, true, true, false, false)
            .unwrap();
        let copy = store.duplicate_query(id).unwrap();
        let q = store.get_query_properties(copy).unwrap();
        assert_eq!(q.text, "a+");
        assert!(q.result_bool && q.result_single);
    }
}
