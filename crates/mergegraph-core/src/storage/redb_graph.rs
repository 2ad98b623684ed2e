//! # redb-backed Graph Storage
//!
//! A disk-backed graph store using the redb embedded database.
//!
//! Every node is one row of the `nodes` table: the key joins the identifier
//! and the node kind, the value is the postcard encoding of its
//! `NodeRecord` (properties, nested children and reference edges). The
//! `identities` table holds the identity reserved for each source pair. Each
//! `GraphStore` statement runs in its own write transaction, so a statement
//! is atomic and crash safe while a sequence of statements is not. The
//! database is embedded, so `reconnect` has nothing to re-establish.

use crate::graph::{
    GraphStore, NestedNode, NodeKey, NodeQuery, NodeRecord, NodeWrite, Slot, Upsert, missing_node,
};
use crate::types::{Identifier, Identity, NodeKind, StoreError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Table for nodes: "identifier\x1fKind" -> serialized NodeRecord bytes
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Table for reserved identities: source pair cache key -> serialized Identity
const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");

/// Separator between identifier and kind in a row key.
const ROW_KEY_SEPARATOR: char = '\u{1f}';

/// A disk-backed graph store using redb.
pub struct RedbGraph {
    /// The redb database handle.
    db: Database,
    /// Where the database lives.
    path: PathBuf,
}

impl std::fmt::Debug for RedbGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbGraph")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn io(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

fn row_key(key: &NodeKey) -> String {
    format!("{}{ROW_KEY_SEPARATOR}{}", key.identifier, key.kind)
}

fn encode<T: serde::Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl RedbGraph {
    /// Open or create a graph database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(io)?;

        // Initialize tables if they don't exist
        let write_txn = db.begin_write().map_err(io)?;
        {
            let _ = write_txn.open_table(NODES).map_err(io)?;
            let _ = write_txn.open_table(IDENTITIES).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;

        Ok(Self { db, path })
    }

    /// The database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored rows of every kind.
    pub fn len(&self) -> Result<u64, StoreError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(NODES).map_err(io)?;
        table.len().map_err(io)
    }

    /// Whether the database holds no rows.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Run one read-modify-write statement against an existing node.
    fn update<T>(
        &self,
        node: &NodeKey,
        apply: impl FnOnce(&mut NodeRecord) -> T,
    ) -> Result<T, StoreError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let outcome = {
            let mut table = write_txn.open_table(NODES).map_err(io)?;
            let key = row_key(node);
            let mut record = match table.get(key.as_str()).map_err(io)? {
                Some(bytes) => decode::<NodeRecord>(bytes.value())?,
                None => return Err(missing_node(node)),
            };
            let outcome = apply(&mut record);
            table
                .insert(key.as_str(), encode(&record)?.as_slice())
                .map_err(io)?;
            outcome
        };
        write_txn.commit().map_err(io)?;
        Ok(outcome)
    }

    /// Decode every row matching the query, in key order.
    fn scan(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, StoreError> {
        query.validate()?;
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(NODES).map_err(io)?;

        let mut rows = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let record = decode::<NodeRecord>(value.value())?;
            if query.matches(&record) {
                rows.push(record);
            }
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}

impl GraphStore for RedbGraph {
    fn upsert_node(&mut self, write: NodeWrite) -> Result<Upsert, StoreError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let outcome = {
            let mut table = write_txn.open_table(NODES).map_err(io)?;

            if write.key.kind != NodeKind::Merged {
                let anchor = row_key(&NodeKey::anchor(write.group.clone()));
                let exists = table.get(anchor.as_str()).map_err(io)?.is_some();
                if !exists {
                    let record = NodeRecord::anchor(write.group.clone(), write.stem.clone());
                    table
                        .insert(anchor.as_str(), encode(&record)?.as_slice())
                        .map_err(io)?;
                }
            }

            let key = row_key(&write.key);
            let existing = match table.get(key.as_str()).map_err(io)? {
                Some(bytes) => Some(decode::<NodeRecord>(bytes.value())?),
                None => None,
            };
            let (record, outcome) = NodeRecord::apply(existing, write);
            table
                .insert(key.as_str(), encode(&record)?.as_slice())
                .map_err(io)?;
            outcome
        };
        write_txn.commit().map_err(io)?;
        Ok(outcome)
    }

    fn upsert_nested(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        value: NestedNode,
    ) -> Result<(), StoreError> {
        self.update(node, |record| {
            record.nested.insert(slot, value);
        })
    }

    fn prune_nested(
        &mut self,
        node: &NodeKey,
        keep: &BTreeSet<Slot>,
    ) -> Result<usize, StoreError> {
        self.update(node, |record| record.retain_nested(keep))
    }

    fn upsert_edge(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        target: &Identifier,
    ) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let merged = {
            let mut table = write_txn.open_table(NODES).map_err(io)?;
            let anchor = row_key(&NodeKey::anchor(target.clone()));
            if table.get(anchor.as_str()).map_err(io)?.is_none() {
                false
            } else {
                let key = row_key(node);
                let mut record = match table.get(key.as_str()).map_err(io)? {
                    Some(bytes) => decode::<NodeRecord>(bytes.value())?,
                    None => return Err(missing_node(node)),
                };
                record.edges.insert(slot, target.clone());
                table
                    .insert(key.as_str(), encode(&record)?.as_slice())
                    .map_err(io)?;
                true
            }
        };
        write_txn.commit().map_err(io)?;
        Ok(merged)
    }

    fn prune_edges(&mut self, node: &NodeKey, keep: &BTreeSet<Slot>) -> Result<usize, StoreError> {
        self.update(node, |record| record.retain_edges(keep))
    }

    fn fetch(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(query.paginate(self.scan(query)?))
    }

    fn count(&self, query: &NodeQuery) -> Result<usize, StoreError> {
        Ok(self.scan(query)?.len())
    }

    fn reserve_identity(
        &mut self,
        key: &str,
        candidate: &Identity,
    ) -> Result<Identity, StoreError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let reserved = {
            let mut table = write_txn.open_table(IDENTITIES).map_err(io)?;
            let existing = match table.get(key).map_err(io)? {
                Some(bytes) => Some(decode::<Identity>(bytes.value())?),
                None => None,
            };
            match existing {
                Some(identity) => identity,
                None => {
                    table.insert(key, encode(candidate)?.as_slice()).map_err(io)?;
                    candidate.clone()
                }
            }
        };
        write_txn.commit().map_err(io)?;
        Ok(reserved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::codec::{FlatValue, Properties, Scalar};
    use crate::types::EntityType;
    use tempfile::tempdir;

    fn write(id: &str, group: &str, email: &str) -> NodeWrite {
        let mut properties = Properties::new();
        properties.insert(
            "email".to_string(),
            FlatValue::Many(vec![Scalar::text(email)]),
        );
        NodeWrite {
            key: NodeKey::new(Identifier::new(id), NodeKind::Extracted),
            stem: EntityType::new("Person"),
            group: Identifier::new(group),
            on_create: Properties::new(),
            properties,
        }
    }

    #[test]
    fn basic_operations() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let mut graph = RedbGraph::open(&db_path).expect("open db");

        assert!(graph.is_empty().expect("empty"));
        let outcome = graph.upsert_node(write("i1", "g1", "a@x")).expect("upsert");
        assert_eq!(outcome, Upsert::Created);
        assert_eq!(graph.len().expect("len"), 2);

        let outcome = graph.upsert_node(write("i1", "g1", "b@x")).expect("upsert");
        assert_eq!(outcome, Upsert::Updated);
        assert_eq!(graph.len().expect("len"), 2);
    }

    #[test]
    fn persistence_across_reopens() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let key = NodeKey::new(Identifier::new("i1"), NodeKind::Extracted);

        {
            let mut graph = RedbGraph::open(&db_path).expect("open db");
            graph.upsert_node(write("i1", "g1", "a@x")).expect("upsert");
            let nested = NestedNode {
                label: "Text".to_string(),
                properties: Properties::new(),
            };
            graph
                .upsert_nested(&key, Slot::new("title", 0), nested)
                .expect("nested");
            assert!(
                graph
                    .upsert_edge(&key, Slot::new("memberOf", 0), &Identifier::new("g1"))
                    .expect("edge")
            );
        }

        let graph = RedbGraph::open(&db_path).expect("reopen db");
        let rows = graph
            .fetch(&NodeQuery::new().identifier(Identifier::new("i1")))
            .expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].nested.len(), 1);
        assert_eq!(
            rows[0].edges.get(&Slot::new("memberOf", 0)),
            Some(&Identifier::new("g1"))
        );
    }

    #[test]
    fn missing_targets_and_nodes() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");
        graph.upsert_node(write("i1", "g1", "a@x")).expect("upsert");
        let key = NodeKey::new(Identifier::new("i1"), NodeKind::Extracted);

        let merged = graph
            .upsert_edge(&key, Slot::new("memberOf", 0), &Identifier::new("g9"))
            .expect("edge");
        assert!(!merged);

        let ghost = NodeKey::new(Identifier::new("ghost"), NodeKind::Extracted);
        assert!(matches!(
            graph.prune_nested(&ghost, &BTreeSet::new()),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn fetch_orders_by_key() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");
        for id in ["i3", "i1", "i2"] {
            graph.upsert_node(write(id, "g", "a@x")).expect("upsert");
        }

        let query = NodeQuery::new().kinds([NodeKind::Extracted]).page(0, 2);
        let ids: Vec<_> = graph
            .fetch(&query)
            .expect("fetch")
            .into_iter()
            .map(|r| r.key.identifier)
            .collect();
        assert_eq!(ids, vec![Identifier::new("i1"), Identifier::new("i2")]);
        assert_eq!(graph.count(&query).expect("count"), 3);
    }

    #[test]
    fn identity_reservations_survive_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let identity = |id: &str| Identity {
            identifier: Identifier::new(id),
            group_identity: Identifier::new(format!("{id}-group")),
            primary_source: Identifier::new("p1"),
            source_local_id: "ada".to_string(),
        };

        {
            let mut graph = RedbGraph::open(&db_path).expect("open db");
            let first = graph.reserve_identity("p1|ada", &identity("i1")).expect("reserve");
            assert_eq!(first, identity("i1"));
        }

        let mut graph = RedbGraph::open(&db_path).expect("reopen db");
        let again = graph.reserve_identity("p1|ada", &identity("i2")).expect("reserve");
        assert_eq!(again, identity("i1"));
        assert!(graph.is_empty().expect("empty"));
    }

    #[test]
    fn reconnect_keeps_data() {
        let temp = tempdir().expect("temp dir");
        let mut graph = RedbGraph::open(temp.path().join("test.redb")).expect("open db");
        graph.upsert_node(write("i1", "g1", "a@x")).expect("upsert");
        graph.reconnect().expect("reconnect");
        assert_eq!(graph.len().expect("len"), 2);
        assert!(graph.path().ends_with("test.redb"));
    }
}
