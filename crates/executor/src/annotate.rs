//! Attaches provenance to result columns: the table/column a value came
//! from, and the foreign key constraining it, resolved from a lazily-filled
//! per-(connection, database) catalog cache.

use std::{
    collections::HashMap,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio_postgres::Client;

use crate::results::ResultColumn;

const RELATIONS_SQL: &str = r"
SELECT c.oid, n.nspname, c.relname
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE c.oid = ANY($1)";

const ATTRIBUTES_SQL: &str = r"
SELECT attrelid, attnum, attname
FROM pg_catalog.pg_attribute
WHERE attrelid = ANY($1) AND attnum > 0 AND NOT attisdropped";

const FOREIGN_KEYS_SQL: &str = r"
SELECT con.conname, con.conrelid, con.conkey, con.confrelid, con.confkey
FROM pg_catalog.pg_constraint con
WHERE con.contype = 'f' AND con.conrelid = ANY($1)";

#[derive(Clone, Debug, Default)]
struct Relation {
    schema: String,
    name: String,
    columns: HashMap<i16, String>,
}

#[derive(Clone, Debug)]
struct ForeignKey {
    constraint: String,
    referenced_oid: u32,
    referenced_attnum: i16,
}

/// Catalog slice for one (connection, database), keyed by relation OID.
#[derive(Default)]
struct DbCatalog {
    relations: HashMap<u32, Relation>,
    /// Constrained (relation, attnum) to its foreign key.
    foreign_keys: HashMap<(u32, i16), ForeignKey>,
    /// OIDs already fetched, including ones that turned out not to exist.
    fetched: std::collections::HashSet<u32>,
}

pub struct CatalogCache {
    inner: Mutex<HashMap<(String, String), Arc<Mutex<DbCatalog>>>>,
}

impl CatalogCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Invalidated together with the response cache on `modify-structure`.
    pub fn invalidate(&self, connection: &str, database: &str) {
        self.inner
            .lock()
            .remove(&(connection.to_string(), database.to_string()));
    }

    /// Drops every database's catalog slice for one connection.
    pub fn invalidate_connection(&self, connection: &str) {
        self.inner.lock().retain(|(c, _), _| c != connection);
    }

    fn catalog(&self, connection: &str, database: &str) -> Arc<Mutex<DbCatalog>> {
        self.inner
            .lock()
            .entry((connection.to_string(), database.to_string()))
            .or_default()
            .clone()
    }

    /// Fills `source_table`/`source_column` and foreign-key fields on every
    /// column the driver reported provenance for, fetching any relation OIDs
    /// this catalog hasn't seen yet.
    pub async fn annotate(
        &self,
        connection: &str,
        database: &str,
        client: &Client,
        columns: &mut [ResultColumn],
    ) -> anyhow::Result<()> {
        let needed: Vec<u32> = columns.iter().filter_map(|c| c.table_oid).collect();
        if needed.is_empty() {
            return Ok(());
        }
        let catalog = self.catalog(connection, database);

        let missing: Vec<u32> = {
            let catalog = catalog.lock();
            needed
                .iter()
                .copied()
                .filter(|oid| !catalog.fetched.contains(oid))
                .collect()
        };
        if !missing.is_empty() {
            let fetched = fetch(client, &missing).await?;
            let mut catalog = catalog.lock();
            catalog.fetched.extend(&missing);
            catalog.relations.extend(fetched.relations);
            catalog.foreign_keys.extend(fetched.foreign_keys);
        }

        let catalog = catalog.lock();
        for column in columns.iter_mut() {
            let (Some(oid), Some(attnum)) = (column.table_oid, column.column_id) else {
                continue;
            };
            let Some(relation) = catalog.relations.get(&oid) else {
                continue;
            };
            column.source_table = Some(format!("{}.{}", relation.schema, relation.name));
            column.source_column = relation.columns.get(&attnum).cloned();
            if let Some(fk) = catalog.foreign_keys.get(&(oid, attnum)) {
                column.fk_constraint = Some(fk.constraint.clone());
                if let Some(referenced) = catalog.relations.get(&fk.referenced_oid) {
                    column.fk_table = Some(format!("{}.{}", referenced.schema, referenced.name));
                    column.fk_column = referenced.columns.get(&fk.referenced_attnum).cloned();
                }
            }
        }
        Ok(())
    }
}

/// Fetches catalog rows for `oids` plus any relations their foreign keys
/// reference, so FK targets resolve to names in the same pass.
async fn fetch(client: &Client, oids: &[u32]) -> anyhow::Result<DbCatalog> {
    let mut catalog = DbCatalog::default();

    let oid_vec: Vec<u32> = oids.to_vec();
    for row in client.query(FOREIGN_KEYS_SQL, &[&oid_vec]).await? {
        let constraint: String = row.try_get(0)?;
        let conrelid: u32 = row.try_get(1)?;
        let conkey: Vec<i16> = row.try_get(2)?;
        let confrelid: u32 = row.try_get(3)?;
        let confkey: Vec<i16> = row.try_get(4)?;
        for (constrained, referenced) in conkey.iter().zip(&confkey) {
            catalog.foreign_keys.insert(
                (conrelid, *constrained),
                ForeignKey {
                    constraint: constraint.clone(),
                    referenced_oid: confrelid,
                    referenced_attnum: *referenced,
                },
            );
        }
    }

    let mut all_oids = oid_vec;
    all_oids.extend(catalog.foreign_keys.values().map(|fk| fk.referenced_oid));
    all_oids.sort_unstable();
    all_oids.dedup();

    for row in client.query(RELATIONS_SQL, &[&all_oids]).await? {
        let oid: u32 = row.try_get(0)?;
        let schema: String = row.try_get(1)?;
        let name: String = row.try_get(2)?;
        catalog.relations.insert(
            oid,
            Relation {
                schema,
                name,
                columns: HashMap::new(),
            },
        );
    }

    for row in client.query(ATTRIBUTES_SQL, &[&all_oids]).await? {
        let oid: u32 = row.try_get(0)?;
        let attnum: i16 = row.try_get(1)?;
        let attname: String = row.try_get(2)?;
        if let Some(relation) = catalog.relations.get_mut(&oid) {
            relation.columns.insert(attnum, attname);
        }
    }

    Ok(catalog)
}
