use async_trait::async_trait;

use crate::error::StoreResult;
use crate::page::{FullScanRequest, Page, ScanRequest};
use crate::predicate::Predicate;
use crate::schema::{Item, Table};

/// The transactional single-item KV facade spec.md §4.2 requires: every
/// mutation is guarded by a [`Predicate`] evaluated atomically against the
/// current row, and a failed guard is reported as
/// [`crate::error::StoreError::PreconditionFailed`] rather than folded into
/// ordinary transport errors.
///
/// Implementations own exactly one physical table/keyspace per [`Table`];
/// `warden-tasks` is responsible for mapping its domain records onto
/// `(Table, pk, rk)` triples and [`Item`] attribute maps.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a single row by primary key. `rk` is `None` for tables keyed by
    /// hash-only primary keys.
    async fn get(&self, table: Table, pk: &str, rk: Option<&str>) -> StoreResult<Option<Item>>;

    /// Replace (or create) a row if `guard` holds against the row as it
    /// currently stands.
    async fn put(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        item: Item,
        guard: Predicate,
    ) -> StoreResult<()>;

    /// Delete a row if `guard` holds.
    async fn conditional_delete(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        guard: Predicate,
    ) -> StoreResult<()>;

    /// Atomically add `delta` to an integer attribute, creating the row (and
    /// the attribute, starting from 0) if it is absent, but only if `guard`
    /// holds against the pre-increment row. Returns the post-increment
    /// value. This is the primitive the `tasksQueued`/`agn` fence and the
    /// `requeues` counter are built on.
    async fn conditional_increment(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        attr: &str,
        delta: i64,
        guard: Predicate,
    ) -> StoreResult<i64>;

    /// Scan a secondary index page by page. `req.index` must name one of
    /// the index definitions the table was declared with
    /// ([`crate::schema::TASK_INDICES`] / [`crate::schema::LOCK_INDICES`]).
    async fn query_by_index(&self, table: Table, req: ScanRequest) -> StoreResult<Page<Item>>;

    /// Scan every row of `table` indexed by `req.index`, irrespective of
    /// hash key (spec.md §4.2 `scanByIndex`). Used by the deep-cleanup sweep
    /// to classify every held lock in the system; ordinary dispatch code
    /// should prefer [`KvStore::query_by_index`], which is scoped to a
    /// single hash key and therefore cheaper on a real backend.
    async fn scan_by_index(&self, table: Table, req: FullScanRequest) -> StoreResult<Page<Item>>;

    /// Atomically apply a set of attribute assignments and a set of integer
    /// increments to one row, creating it if absent, guarded by a single
    /// [`Predicate`] evaluated against the pre-update row. Returns the
    /// resulting item. This is the primitive the lock coordinator's
    /// "set monitorId/runningTaskId and bump tasksQueued in one guarded
    /// write" step (spec.md §4.4) is built on; [`KvStore::conditional_increment`]
    /// is the special case of this with no `sets`.
    async fn conditional_merge(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        sets: Vec<(String, crate::schema::AttrValue)>,
        increments: Vec<(String, i64)>,
        guard: Predicate,
    ) -> StoreResult<Item>;
}

/// The monotonic id generator (spec.md §4.1, component C1): produces
/// strictly increasing `i64` task ids, one call per new task.
#[async_trait]
pub trait Sequence: Send + Sync {
    async fn next(&self) -> StoreResult<i64>;
}
