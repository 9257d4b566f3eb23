#![cfg(feature = "redis-backend")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use once_cell::sync::Lazy;
use redis::Commands;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::{StoreError, StoreResult};
use crate::kv_store::{KvStore, Sequence};
use crate::page::{FullScanRequest, Page, PageToken, ScanRequest};
use crate::predicate::Predicate;
use crate::schema::{AttrValue, Item, Table};

/// A Redis-backed store: every row is a JSON string at key
/// `{table}:{pk}:{rk}`, and every secondary index is a Redis set of row keys
/// that gets fetched and sorted client-side. This mirrors how little index
/// machinery the rest of this codebase's Redis backends lean on elsewhere;
/// nothing here is meant to stand in for a real distributed store under
/// serious load.
///
/// Every conditional mutator runs as a single Lua `EVAL` (guard-check,
/// mutation, and index bookkeeping all server-side), so two `RedisStore`s
/// sharing one Redis instance can never both pass the same guard: the
/// process-local `tokio::sync::Mutex` below only protects the one
/// `redis::Connection` handle from concurrent use within this process, it is
/// not what makes conditional writes atomic across processes.
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<Mutex<redis::Connection>>,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Transport(format!("invalid redis url: {e}")))?;
        let conn = Self::connect(&client)?;
        Ok(RedisStore { client, conn: Arc::new(Mutex::new(conn)) })
    }

    fn connect(client: &redis::Client) -> StoreResult<redis::Connection> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        backoff::retry(backoff, || match client.get_connection() {
            Ok(conn) => Ok(conn),
            Err(e) => {
                warn!("failed to connect to redis: {e}, retrying...");
                Err(backoff::Error::Transient { err: e, retry_after: None })
            }
        })
        .map_err(|e| match e {
            backoff::Error::Transient { err, .. } | backoff::Error::Permanent(err) => {
                error!("giving up connecting to redis: {err}");
                StoreError::Transport(err.to_string())
            }
        })
    }

    fn row_key(table: Table, pk: &str, rk: Option<&str>) -> String {
        format!("{}:{}:{}", table.name(), pk, rk.unwrap_or("-"))
    }

    fn index_key(table: Table, index: &str, hash_value: &str) -> String {
        format!("{}:idx:{}:{}", table.name(), index, hash_value)
    }

    /// The index defs for `table`, pre-rendered as `{hash_attr, prefix}`
    /// pairs so the Lua scripts never need to know a table's name or index
    /// layout — they just append the decoded hash value to `prefix`.
    fn index_defs_arg(table: Table) -> StoreResult<String> {
        let defs: Vec<serde_json::Value> = index_defs(table)
            .iter()
            .map(|d| serde_json::json!({"hash_attr": d.hash_attr, "prefix": Self::index_key(table, d.name, "")}))
            .collect();
        Ok(serde_json::to_string(&defs)?)
    }

    fn sets_arg(sets: &[(String, AttrValue)]) -> StoreResult<String> {
        let v: Vec<serde_json::Value> =
            sets.iter().map(|(attr, value)| serde_json::json!({"attr": attr, "value": value})).collect();
        Ok(serde_json::to_string(&v)?)
    }

    fn increments_arg(increments: &[(String, i64)]) -> StoreResult<String> {
        let v: Vec<serde_json::Value> =
            increments.iter().map(|(attr, delta)| serde_json::json!({"attr": attr, "delta": delta})).collect();
        Ok(serde_json::to_string(&v)?)
    }

    /// Maps a script-raised `redis.error_reply("PRECONDITION_FAILED")` back
    /// to [`StoreError::PreconditionFailed`]; every other Lua/connection
    /// error is a transport failure.
    fn map_script_error(e: redis::RedisError) -> StoreError {
        if e.to_string().contains(PRECONDITION_FAILED) {
            StoreError::PreconditionFailed
        } else {
            StoreError::Transport(e.to_string())
        }
    }
}

const PRECONDITION_FAILED: &str = "PRECONDITION_FAILED";

/// Shared by every script below: decodes the guard JSON emitted by
/// `Predicate::to_script_value` and walks it against the row's current,
/// `cjson`-decoded item (or `nil` if the row is absent) — mirroring
/// `Predicate::evaluate` exactly, just in Lua instead of Rust, so the guard
/// and the mutation it gates run as one atomic step on the server.
const LUA_PRELUDE: &str = r#"
local function attrs_equal(a, b)
  if a == nil or b == nil then
    return false
  end
  return cjson.encode(a) == cjson.encode(b)
end

local function eval_pred(pred, item)
  if type(pred) ~= 'table' then
    return false
  end
  local op = pred.op
  if op == 'always' then
    return true
  elseif op == 'eq' then
    local v = item and item[pred.attr] or nil
    return attrs_equal(v, pred.value)
  elseif op == 'exists' then
    return item ~= nil and item[pred.attr] ~= nil
  elseif op == 'begins_with' then
    local v = item and item[pred.attr] or nil
    if v == nil or v.s == nil then
      return false
    end
    return string.sub(v.s, 1, string.len(pred.prefix)) == pred.prefix
  elseif op == 'in' then
    local v = item and item[pred.attr] or nil
    if v == nil then
      return false
    end
    for _, candidate in ipairs(pred.values) do
      if attrs_equal(v, candidate) then
        return true
      end
    end
    return false
  elseif op == 'not' then
    return not eval_pred(pred.pred, item)
  elseif op == 'and' then
    for _, p in ipairs(pred.preds) do
      if not eval_pred(p, item) then
        return false
      end
    end
    return true
  elseif op == 'or' then
    for _, p in ipairs(pred.preds) do
      if eval_pred(p, item) then
        return true
      end
    end
    return false
  end
  return false
end

local function decode_item(raw)
  if raw == false or raw == nil then
    return nil
  end
  return cjson.decode(raw)
end

local function apply_indices(key, item, index_defs, add)
  for _, def in ipairs(index_defs) do
    local hv = item[def.hash_attr]
    if hv ~= nil and hv.s ~= nil then
      local idx_key = def.prefix .. hv.s
      if add then
        redis.call('SADD', idx_key, key)
      else
        redis.call('SREM', idx_key, key)
      end
    end
  end
end
"#;

/// `KEYS[1]` = row key. `ARGV[1]` = guard JSON, `ARGV[2]` = new item JSON,
/// `ARGV[3]` = index defs JSON. Unindexes the row under its old value for
/// each indexed attribute before reindexing under the new one, so an
/// attribute that changes or disappears (`mid` on claim/release, `ntty`/
/// `ntid` on reaching a terminal state) doesn't leave the row visible under
/// a stale index bucket forever.
const PUT_BODY: &str = r#"
local key = KEYS[1]
local guard = cjson.decode(ARGV[1])
local index_defs = cjson.decode(ARGV[3])

local current = decode_item(redis.call('GET', key))
if not eval_pred(guard, current) then
  return redis.error_reply('PRECONDITION_FAILED')
end

if current ~= nil then
  apply_indices(key, current, index_defs, false)
end
redis.call('SET', key, ARGV[2])
apply_indices(key, cjson.decode(ARGV[2]), index_defs, true)
return 'OK'
"#;

/// `KEYS[1]` = row key. `ARGV[1]` = guard JSON, `ARGV[2]` = index defs JSON.
const DELETE_BODY: &str = r#"
local key = KEYS[1]
local guard = cjson.decode(ARGV[1])
local index_defs = cjson.decode(ARGV[2])

local current = decode_item(redis.call('GET', key))
if not eval_pred(guard, current) then
  return redis.error_reply('PRECONDITION_FAILED')
end

if current ~= nil then
  apply_indices(key, current, index_defs, false)
end
redis.call('DEL', key)
return 'OK'
"#;

/// `KEYS[1]` = row key. `ARGV[1]` = guard JSON, `ARGV[2]` = attribute name,
/// `ARGV[3]` = delta. Returns the post-increment value.
const INCREMENT_BODY: &str = r#"
local key = KEYS[1]
local guard = cjson.decode(ARGV[1])
local attr = ARGV[2]
local delta = tonumber(ARGV[3])

local current = decode_item(redis.call('GET', key))
if not eval_pred(guard, current) then
  return redis.error_reply('PRECONDITION_FAILED')
end

local item = current or {}
local existing = 0
if item[attr] ~= nil and item[attr].n ~= nil then
  existing = item[attr].n
end
local total = existing + delta
item[attr] = {n = total}
redis.call('SET', key, cjson.encode(item))
return total
"#;

/// `KEYS[1]` = row key. `ARGV[1]` = guard JSON, `ARGV[2]` = sets JSON
/// (`[{attr, value}]`), `ARGV[3]` = increments JSON (`[{attr, delta}]`),
/// `ARGV[4]` = index defs JSON. Returns the merged item JSON. Reindexes the
/// same way `PUT_BODY` does: unindex the pre-merge item, then index the
/// merged one.
const MERGE_BODY: &str = r#"
local key = KEYS[1]
local guard = cjson.decode(ARGV[1])
local sets = cjson.decode(ARGV[2])
local increments = cjson.decode(ARGV[3])
local index_defs = cjson.decode(ARGV[4])

local current = decode_item(redis.call('GET', key))
if not eval_pred(guard, current) then
  return redis.error_reply('PRECONDITION_FAILED')
end

local item = current or {}
for _, pair in ipairs(sets) do
  item[pair.attr] = pair.value
end
for _, pair in ipairs(increments) do
  local existing = 0
  if item[pair.attr] ~= nil and item[pair.attr].n ~= nil then
    existing = item[pair.attr].n
  end
  item[pair.attr] = {n = existing + pair.delta}
end

if current ~= nil then
  apply_indices(key, current, index_defs, false)
end
local payload = cjson.encode(item)
redis.call('SET', key, payload)
apply_indices(key, item, index_defs, true)
return payload
"#;

static PUT_SCRIPT: Lazy<redis::Script> = Lazy::new(|| redis::Script::new(&format!("{LUA_PRELUDE}\n{PUT_BODY}")));
static DELETE_SCRIPT: Lazy<redis::Script> =
    Lazy::new(|| redis::Script::new(&format!("{LUA_PRELUDE}\n{DELETE_BODY}")));
static INCREMENT_SCRIPT: Lazy<redis::Script> =
    Lazy::new(|| redis::Script::new(&format!("{LUA_PRELUDE}\n{INCREMENT_BODY}")));
static MERGE_SCRIPT: Lazy<redis::Script> =
    Lazy::new(|| redis::Script::new(&format!("{LUA_PRELUDE}\n{MERGE_BODY}")));

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, table: Table, pk: &str, rk: Option<&str>) -> StoreResult<Option<Item>> {
        let key = Self::row_key(table, pk, rk);
        let mut conn = self.conn.lock().await;
        let raw: Option<String> =
            conn.get(&key).map_err(|e| StoreError::Transport(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from)).transpose()
    }

    async fn put(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        item: Item,
        guard: Predicate,
    ) -> StoreResult<()> {
        let key = Self::row_key(table, pk, rk);
        let guard_json = serde_json::to_string(&guard.to_script_value())?;
        let item_json = serde_json::to_string(&item)?;
        let index_json = Self::index_defs_arg(table)?;

        let mut conn = self.conn.lock().await;
        let result: Result<String, redis::RedisError> =
            PUT_SCRIPT.key(&key).arg(&guard_json).arg(&item_json).arg(&index_json).invoke(&mut *conn);
        result.map(|_| ()).map_err(Self::map_script_error)
    }

    async fn conditional_delete(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        guard: Predicate,
    ) -> StoreResult<()> {
        let key = Self::row_key(table, pk, rk);
        let guard_json = serde_json::to_string(&guard.to_script_value())?;
        let index_json = Self::index_defs_arg(table)?;

        let mut conn = self.conn.lock().await;
        let result: Result<String, redis::RedisError> =
            DELETE_SCRIPT.key(&key).arg(&guard_json).arg(&index_json).invoke(&mut *conn);
        result.map(|_| ()).map_err(Self::map_script_error)
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
        let key = Self::row_key(table, pk, rk);
        let guard_json = serde_json::to_string(&guard.to_script_value())?;

        let mut conn = self.conn.lock().await;
        let result: Result<i64, redis::RedisError> =
            INCREMENT_SCRIPT.key(&key).arg(&guard_json).arg(attr).arg(delta).invoke(&mut *conn);
        result.map_err(Self::map_script_error)
    }

    async fn conditional_merge(
        &self,
        table: Table,
        pk: &str,
        rk: Option<&str>,
        sets: Vec<(String, AttrValue)>,
        increments: Vec<(String, i64)>,
        guard: Predicate,
    ) -> StoreResult<Item> {
        let key = Self::row_key(table, pk, rk);
        let guard_json = serde_json::to_string(&guard.to_script_value())?;
        let sets_json = Self::sets_arg(&sets)?;
        let increments_json = Self::increments_arg(&increments)?;
        let index_json = Self::index_defs_arg(table)?;

        let mut conn = self.conn.lock().await;
        let result: Result<String, redis::RedisError> = MERGE_SCRIPT
            .key(&key)
            .arg(&guard_json)
            .arg(&sets_json)
            .arg(&increments_json)
            .arg(&index_json)
            .invoke(&mut *conn);
        let payload = result.map_err(Self::map_script_error)?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn query_by_index(&self, table: Table, req: ScanRequest) -> StoreResult<Page<Item>> {
        let def = index_defs(table)
            .iter()
            .find(|d| d.name == req.index)
            .ok_or_else(|| StoreError::Transport(format!("no such index: {}", req.index)))?;

        let idx_key = Self::index_key(table, def.name, &req.hash_value);
        let mut conn = self.conn.lock().await;
        let row_keys: Vec<String> =
            conn.smembers(&idx_key).map_err(|e| StoreError::Transport(e.to_string()))?;

        let mut items: Vec<Item> = Vec::with_capacity(row_keys.len());
        for rk in &row_keys {
            let raw: Option<String> =
                conn.get(rk).map_err(|e| StoreError::Transport(e.to_string()))?;
            if let Some(raw) = raw {
                items.push(serde_json::from_str(&raw)?);
            }
        }
        drop(conn);

        if let Some(prefix) = &req.range_prefix {
            if let Some(range_attr) = def.range_attr {
                items.retain(|item| {
                    item.get(range_attr)
                        .and_then(AttrValue::as_str)
                        .is_some_and(|v| v.starts_with(prefix.as_str()))
                });
            }
        }

        if let Some(range_attr) = def.range_attr {
            items.sort_by(|a, b| {
                let ka = a.get(range_attr).and_then(AttrValue::as_str).unwrap_or("");
                let kb = b.get(range_attr).and_then(AttrValue::as_str).unwrap_or("");
                ka.cmp(kb)
            });
        }

        let marker = |item: &Item| -> String {
            def.range_attr
                .and_then(|attr| item.get(attr))
                .and_then(AttrValue::as_str)
                .unwrap_or("")
                .to_string()
        };

        let start = match &req.start_after {
            Some(token) => {
                items.iter().position(|i| marker(i) == token.0).map(|i| i + 1).unwrap_or(0)
            }
            None => 0,
        };
        let remaining = &items[start.min(items.len())..];
        let take = req.limit.min(remaining.len());
        let page_items = remaining[..take].to_vec();
        let next =
            if take < remaining.len() { Some(PageToken(marker(&page_items[take - 1]))) } else { None };

        Ok(Page::new(page_items, next))
    }

    /// Full-table scan (spec.md §4.2 `scanByIndex`): no secondary-index set
    /// carries "every row regardless of hash", so this walks the row-key
    /// namespace directly with `KEYS {table}:*` rather than through an
    /// index set. Fine for the deep-cleanup sweep's cadence; not meant to
    /// stand in for a real cursor-based `SCAN` under load.
    async fn scan_by_index(&self, table: Table, req: FullScanRequest) -> StoreResult<Page<Item>> {
        let def = index_defs(table)
            .iter()
            .find(|d| d.name == req.index)
            .ok_or_else(|| StoreError::Transport(format!("no such index: {}", req.index)))?;

        let pattern = format!("{}:*", table.name());
        let mut conn = self.conn.lock().await;
        let row_keys: Vec<String> =
            conn.keys(&pattern).map_err(|e| StoreError::Transport(e.to_string()))?;

        let mut items: Vec<Item> = Vec::with_capacity(row_keys.len());
        for rk in &row_keys {
            if rk.contains(":idx:") {
                continue;
            }
            let raw: Option<String> =
                conn.get(rk).map_err(|e| StoreError::Transport(e.to_string()))?;
            if let Some(raw) = raw {
                items.push(serde_json::from_str(&raw)?);
            }
        }
        drop(conn);

        let marker = |item: &Item| -> String {
            let hash = item.get(def.hash_attr).and_then(AttrValue::as_str).unwrap_or("");
            let range = def
                .range_attr
                .and_then(|attr| item.get(attr))
                .and_then(AttrValue::as_str)
                .unwrap_or("");
            format!("{hash}\u{0}{range}")
        };

        items.sort_by_key(marker);

        let start = match &req.start_after {
            Some(token) => {
                items.iter().position(|i| marker(i) == token.0).map(|i| i + 1).unwrap_or(0)
            }
            None => 0,
        };
        let remaining = &items[start.min(items.len())..];
        let take = req.limit.min(remaining.len());
        let page_items = remaining[..take].to_vec();
        let next =
            if take < remaining.len() { Some(PageToken(marker(&page_items[take - 1]))) } else { None };

        Ok(Page::new(page_items, next))
    }
}

fn index_defs(table: Table) -> &'static [crate::schema::IndexDef] {
    match table {
        Table::Tasks => crate::schema::TASK_INDICES,
        Table::Locks => crate::schema::LOCK_INDICES,
    }
}

/// A Redis-backed sequence using `INCR` on a well-known key. `INCR` is
/// atomic server-side, so no watch/retry loop is needed here.
pub struct RedisSequence {
    conn: Arc<Mutex<redis::Connection>>,
    key: String,
}

impl RedisSequence {
    pub fn new(store: &RedisStore, key: impl Into<String>) -> Self {
        RedisSequence { conn: store.conn.clone(), key: key.into() }
    }
}

#[async_trait]
impl Sequence for RedisSequence {
    async fn next(&self) -> StoreResult<i64> {
        let mut conn = self.conn.lock().await;
        conn.incr(&self.key, 1).map_err(|e| StoreError::Transport(e.to_string()))
    }
}
