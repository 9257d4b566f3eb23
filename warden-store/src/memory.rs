use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};
use crate::kv_store::{KvStore, Sequence};
use crate::page::{FullScanRequest, Page, PageToken, ScanRequest};
use crate::predicate::Predicate;
use crate::schema::{Item, Table, LOCK_INDICES, TASK_INDICES};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RowKey {
    table: TableTag,
    pk: String,
    rk: Option<String>,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum TableTag {
    Tasks,
    Locks,
}

impl From<Table> for TableTag {
    fn from(t: Table) -> Self {
        match t {
            Table::Tasks => TableTag::Tasks,
            Table::Locks => TableTag::Locks,
        }
    }
}

/// A process-local backend for tests and single-node demos. Every table is
/// one flat map; secondary indices are materialized on read by a linear
/// filter-then-sort, which is exactly as much engineering as this deserves
/// for a backend nothing ever deploys at scale.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: DashMap<RowKey, Item>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore { rows: DashMap::new() }
    }

    fn index_def(table: Table, index: &str) -> Option<&'static crate::schema::IndexDef> {
        let defs = match table {
            Table::Tasks => TASK_INDICES,
            Table::Locks => LOCK_INDICES,
        };
        defs.iter().find(|d| d.name == index)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, table: Table, pk: &str, rk: Option<&str>) -> StoreResult<Option<Item>> {
        let key = RowKey { table: table.into(), pk: pk.to_string(), rk: rk.map(str::to_string) };
        Ok(self.rows.get(&key).map(|r| r.clone()))
    }

    async fn put(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        item: Item,
        guard: Predicate,
    ) -> StoreResult<()> {
        let key = RowKey { table: table.into(), pk: pk.to_string(), rk: rk.map(str::to_string) };
        // An absent row and a present-but-empty map are indistinguishable here;
        // real rows always carry at least a primary-key attribute, so an empty
        // map safely stands in for "no such row yet".
        let mut slot = self.rows.entry(key).or_insert(Item::new());
        if !guard.evaluate(if slot.is_empty() { None } else { Some(&slot) }) {
            return Err(StoreError::PreconditionFailed);
        }
        *slot = item;
        Ok(())
    }

    async fn conditional_delete(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        guard: Predicate,
    ) -> StoreResult<()> {
        let key = RowKey { table: table.into(), pk: pk.to_string(), rk: rk.map(str::to_string) };
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                if !guard.evaluate(Some(e.get())) {
                    return Err(StoreError::PreconditionFailed);
                }
                e.remove();
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(_) => {
                if !guard.evaluate(None) {
                    return Err(StoreError::PreconditionFailed);
                }
                Ok(())
            }
        }
    }

    async fn conditional_increment(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        attr: &str,
        delta: i64,
        guard: Predicate,
    ) -> StoreResult<i64> {
        let key = RowKey { table: table.into(), pk: pk.to_string(), rk: rk.map(str::to_string) };
        let mut slot = self.rows.entry(key).or_insert(Item::new());
        let exists = !slot.is_empty();
        if !guard.evaluate(if exists { Some(&slot) } else { None }) {
            return Err(StoreError::PreconditionFailed);
        }
        let current = slot
            .get(attr)
            .and_then(crate::schema::AttrValue::as_i64)
            .unwrap_or(0);
        let next = current + delta;
        slot.insert(attr.to_string(), crate::schema::AttrValue::N(next));
        Ok(next)
    }

    async fn conditional_merge(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        sets: Vec<(String, crate::schema::AttrValue)>,
        increments: Vec<(String, i64)>,
        guard: Predicate,
    ) -> StoreResult<Item> {
        let key = RowKey { table: table.into(), pk: pk.to_string(), rk: rk.map(str::to_string) };
        let mut slot = self.rows.entry(key).or_insert(Item::new());
        let exists = !slot.is_empty();
        if !guard.evaluate(if exists { Some(&slot) } else { None }) {
            return Err(StoreError::PreconditionFailed);
        }
        for (attr, value) in sets {
            slot.insert(attr, value);
        }
        for (attr, delta) in increments {
            let current = slot.get(&attr).and_then(crate::schema::AttrValue::as_i64).unwrap_or(0);
            slot.insert(attr, crate::schema::AttrValue::N(current + delta));
        }
        Ok(slot.clone())
    }

    async fn query_by_index(&self, table: Table, req: ScanRequest) -> StoreResult<Page<Item>> {
        let def = Self::index_def(table, req.index).ok_or_else(|| {
            StoreError::Transport(format!("no such index: {} on {:?}", req.index, table))
        })?;

        let tag: TableTag = table.into();
        let mut matches: Vec<Item> = self
            .rows
            .iter()
            .filter(|entry| entry.key().table == tag)
            .filter_map(|entry| {
                let item = entry.value();
                let hash_matches = item
                    .get(def.hash_attr)
                    .and_then(crate::schema::AttrValue::as_str)
                    .is_some_and(|v| v == req.hash_value);
                if !hash_matches {
                    return None;
                }
                if let Some(prefix) = &req.range_prefix {
                    let range_attr = def.range_attr?;
                    let matches_prefix = item
                        .get(range_attr)
                        .and_then(crate::schema::AttrValue::as_str)
                        .is_some_and(|v| v.starts_with(prefix.as_str()));
                    if !matches_prefix {
                        return None;
                    }
                }
                Some(item.clone())
            })
            .collect();

        if let Some(range_attr) = def.range_attr {
            matches.sort_by(|a, b| {
                let ka = a.get(range_attr).and_then(crate::schema::AttrValue::as_str).unwrap_or("");
                let kb = b.get(range_attr).and_then(crate::schema::AttrValue::as_str).unwrap_or("");
                ka.cmp(kb)
            });
        }

        let start = match &req.start_after {
            Some(token) => matches
                .iter()
                .position(|item| row_marker(item, def.range_attr) == token.0)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };

        let remaining = &matches[start.min(matches.len())..];
        let take = req.limit.min(remaining.len());
        let page_items: Vec<Item> = remaining[..take].to_vec();
        let next = if take < remaining.len() {
            Some(PageToken(row_marker(&page_items[take - 1], def.range_attr)))
        } else {
            None
        };

        Ok(Page::new(page_items, next))
    }

    async fn scan_by_index(&self, table: Table, req: FullScanRequest) -> StoreResult<Page<Item>> {
        let def = Self::index_def(table, req.index).ok_or_else(|| {
            StoreError::Transport(format!("no such index: {} on {:?}", req.index, table))
        })?;

        let tag: TableTag = table.into();
        let mut matches: Vec<Item> = self
            .rows
            .iter()
            .filter(|entry| entry.key().table == tag)
            .map(|entry| entry.value().clone())
            .collect();

        matches.sort_by(|a, b| {
            let ka = full_scan_marker(a, def);
            let kb = full_scan_marker(b, def);
            ka.cmp(&kb)
        });

        let start = match &req.start_after {
            Some(token) => matches
                .iter()
                .position(|item| full_scan_marker(item, def) == token.0)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };

        let remaining = &matches[start.min(matches.len())..];
        let take = req.limit.min(remaining.len());
        let page_items: Vec<Item> = remaining[..take].to_vec();
        let next = if take < remaining.len() {
            Some(PageToken(full_scan_marker(&page_items[take - 1], def)))
        } else {
            None
        };

        Ok(Page::new(page_items, next))
    }
}

/// Continuation marker for a full-table scan: hash value then range value,
/// so rows sort deterministically even across differing hash keys.
fn full_scan_marker(item: &Item, def: &crate::schema::IndexDef) -> String {
    let hash = item.get(def.hash_attr).and_then(crate::schema::AttrValue::as_str).unwrap_or("");
    let range = def
        .range_attr
        .and_then(|attr| item.get(attr))
        .and_then(crate::schema::AttrValue::as_str)
        .unwrap_or("");
    format!("{hash}\u{0}{range}")
}

fn row_marker(item: &Item, range_attr: Option<&'static str>) -> String {
    range_attr
        .and_then(|attr| item.get(attr))
        .and_then(crate::schema::AttrValue::as_str)
        .unwrap_or("")
        .to_string()
}

/// A process-local monotonic sequence (component C1), backed by an atomic
/// counter. Survives only as long as the process: fine for tests and the
/// in-memory demo path, not a durable backend.
#[derive(Debug)]
pub struct InMemorySequence {
    counter: Arc<AtomicI64>,
}

impl InMemorySequence {
    pub fn new() -> Self {
        InMemorySequence { counter: Arc::new(AtomicI64::new(0)) }
    }

    pub fn starting_at(start: i64) -> Self {
        InMemorySequence { counter: Arc::new(AtomicI64::new(start)) }
    }
}

impl Default for InMemorySequence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sequence for InMemorySequence {
    async fn next(&self) -> StoreResult<i64> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttrValue;

    fn item(pairs: &[(&str, AttrValue)]) -> Item {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStore::new();
        store
            .put(Table::Tasks, "t1", None, item(&[("mid", AttrValue::S("m1".into()))]), Predicate::Always)
            .await
            .unwrap();

        let got = store.get(Table::Tasks, "t1", None).await.unwrap().unwrap();
        assert_eq!(got.get("mid").unwrap().as_str(), Some("m1"));
    }

    #[tokio::test]
    async fn put_enforces_guard() {
        let store = InMemoryStore::new();
        store
            .put(Table::Tasks, "t1", None, item(&[("mid", AttrValue::S("m1".into()))]), Predicate::not_exists("mid"))
            .await
            .unwrap();

        let err = store
            .put(Table::Tasks, "t1", None, item(&[("mid", AttrValue::S("m2".into()))]), Predicate::not_exists("mid"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed));
    }

    #[tokio::test]
    async fn conditional_increment_creates_and_bumps() {
        let store = InMemoryStore::new();
        let v1 = store
            .conditional_increment(Table::Locks, "l1", None, "tasksQueued", 1, Predicate::Always)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = store
            .conditional_increment(Table::Locks, "l1", None, "tasksQueued", 1, Predicate::Always)
            .await
            .unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn query_by_index_filters_and_sorts() {
        let store = InMemoryStore::new();
        for (id, mid) in [("t3", "m1"), ("t1", "m1"), ("t2", "m2")] {
            store
                .put(
                    Table::Tasks,
                    id,
                    None,
                    item(&[("mid", AttrValue::S(mid.into())), ("id", AttrValue::S(id.into()))]),
                    Predicate::Always,
                )
                .await
                .unwrap();
        }

        let page = store
            .query_by_index(Table::Tasks, ScanRequest::new("by_monitor", "m1"))
            .await
            .unwrap();
        let ids: Vec<&str> = page.items.iter().map(|i| i.get("id").unwrap().as_str().unwrap()).collect();
        assert_eq!(ids, vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn query_by_index_paginates() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let id = format!("t{i}");
            store
                .put(
                    Table::Tasks,
                    &id,
                    None,
                    item(&[("mid", AttrValue::S("m1".into())), ("id", AttrValue::S(id.clone()))]),
                    Predicate::Always,
                )
                .await
                .unwrap();
        }

        let first = store
            .query_by_index(Table::Tasks, ScanRequest::new("by_monitor", "m1").with_limit(2))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more());

        let second = store
            .query_by_index(
                Table::Tasks,
                ScanRequest::new("by_monitor", "m1").with_limit(2).with_start_after(first.next),
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
    }

    #[tokio::test]
    async fn scan_by_index_ignores_hash_key() {
        let store = InMemoryStore::new();
        for (lid, tid) in [("L1", "#"), ("L2", "#"), ("L1", "0000001")] {
            store
                .put(
                    Table::Locks,
                    lid,
                    Some(tid),
                    item(&[("lid", AttrValue::S(lid.into())), ("tid", AttrValue::S(tid.into()))]),
                    Predicate::Always,
                )
                .await
                .unwrap();
        }

        let page = store
            .scan_by_index(Table::Locks, crate::page::FullScanRequest::new("by_lock"))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        let held: Vec<&str> = page
            .items
            .iter()
            .filter(|i| i.get("tid").unwrap().as_str() == Some("#"))
            .map(|i| i.get("lid").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(held, vec!["L1", "L2"]);
    }

    #[tokio::test]
    async fn conditional_merge_sets_and_increments_atomically() {
        let store = InMemoryStore::new();
        let result = store
            .conditional_merge(
                Table::Locks,
                "L",
                Some("#"),
                vec![("mid".to_string(), AttrValue::S("m1".into()))],
                vec![("agn".to_string(), 1)],
                Predicate::not_exists("mid"),
            )
            .await
            .unwrap();
        assert_eq!(result.get("mid").unwrap().as_str(), Some("m1"));
        assert_eq!(result.get("agn").unwrap().as_i64(), Some(1));

        let err = store
            .conditional_merge(
                Table::Locks,
                "L",
                Some("#"),
                vec![("mid".to_string(), AttrValue::S("m2".into()))],
                vec![("agn".to_string(), 1)],
                Predicate::not_exists("mid"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed));
    }

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let seq = InMemorySequence::new();
        let a = seq.next().await.unwrap();
        let b = seq.next().await.unwrap();
        assert_eq!(b, a + 1);
    }
}
