//! Maps [`crate::model::TaskInfo`] and lock rows onto the attribute maps the
//! KV façade stores (spec.md §4.3, §6). Attribute short names follow §6
//! verbatim; nothing here should ever dispatch reflectively — every field
//! has an explicit, typed mapping both ways.

use warden_lib::{TaskId, TaskState, QUEUED_SENTINEL, TASK_ID_NONE};
use warden_store::{AttrValue, Item};

use crate::error::{TaskError, TaskResult};
use crate::model::{MonitorSlot, TaskInfo};

/// Width of a `sortKey(i64)` string — see `warden_lib::task_id::sort_key`.
const SORT_KEY_WIDTH: usize = 20;

pub fn task_to_item(task: &TaskInfo) -> Item {
    let mut item = Item::new();
    item.insert("id".into(), AttrValue::N(task.task_id.get()));
    item.insert("ety".into(), AttrValue::S(task.entity_type.clone()));
    item.insert("eid".into(), AttrValue::S(task.entity_range_key()));
    if let Some(ntty) = task.non_terminal_type() {
        item.insert("ntty".into(), AttrValue::S(ntty.to_string()));
    }
    if let Some(ntid) = task.non_terminal_range_key() {
        item.insert("ntid".into(), AttrValue::S(ntid));
    }
    item.insert("stat".into(), AttrValue::S(task.task_state.to_code().to_string()));
    item.insert("lids".into(), AttrValue::SS(task.lock_ids.clone()));
    item.insert(
        "preq".into(),
        AttrValue::SS(task.prerequisite_task_ids.iter().map(|id| id.get().to_string()).collect()),
    );
    item.insert("any".into(), AttrValue::Bool(task.any_prerequisite));
    if let Some(mid) = task.monitor_id.as_str() {
        item.insert("mid".into(), AttrValue::S(mid.to_string()));
    }
    if let Some(upd) = &task.update_data {
        item.insert("upd".into(), AttrValue::B(upd.clone()));
    }
    item.insert("st8".into(), AttrValue::B(task.checkpoint_data.clone()));
    if let Some(err) = &task.error_message {
        item.insert("err".into(), AttrValue::S(err.clone()));
    }
    if let Some(err_t) = &task.error_stack_trace {
        item.insert("errT".into(), AttrValue::S(err_t.clone()));
    }
    if let Some(err_id) = &task.error_id {
        item.insert("errId".into(), AttrValue::S(err_id.clone()));
    }
    if let Some(ts) = task.start_time {
        item.insert("ts".into(), AttrValue::N(ts));
    }
    if let Some(tf) = task.end_time {
        item.insert("tf".into(), AttrValue::N(tf));
    }
    item.insert("cnt".into(), AttrValue::N(task.run_count));
    item.insert("agn".into(), AttrValue::N(task.requeues));
    if let Some(tic) = task.milliseconds_remaining {
        item.insert("tic".into(), AttrValue::N(tic));
    }
    if let Some(cancel) = &task.canceled_by {
        item.insert("cancel".into(), AttrValue::S(cancel.clone()));
    }
    item
}

pub fn item_to_task(item: &Item) -> TaskResult<TaskInfo> {
    let task_id = item
        .get("id")
        .and_then(AttrValue::as_i64)
        .map(TaskId::from)
        .ok_or_else(|| TaskError::Handler("task item missing id".into()))?;
    let entity_type = item
        .get("ety")
        .and_then(AttrValue::as_str)
        .ok_or_else(|| TaskError::Handler("task item missing ety".into()))?
        .to_string();
    let eid = item
        .get("eid")
        .and_then(AttrValue::as_str)
        .ok_or_else(|| TaskError::Handler("task item missing eid".into()))?;
    let entity_id = recover_entity_id(eid)?;
    let task_state = item
        .get("stat")
        .and_then(AttrValue::as_str)
        .and_then(|s| s.chars().next())
        .and_then(TaskState::from_code)
        .ok_or_else(|| TaskError::Handler("task item missing/invalid stat".into()))?;
    let lock_ids = item.get("lids").and_then(AttrValue::as_string_set).map(<[_]>::to_vec).unwrap_or_default();
    let prerequisite_task_ids = item
        .get("preq")
        .and_then(AttrValue::as_string_set)
        .map(|ss| ss.iter().filter_map(|s| s.parse::<i64>().ok()).map(TaskId::from).collect())
        .unwrap_or_default();
    let any_prerequisite = item.get("any").and_then(AttrValue::as_bool).unwrap_or(false);
    let monitor_id = MonitorSlot::from_str_opt(item.get("mid").and_then(AttrValue::as_str));
    let update_data = item.get("upd").and_then(AttrValue::as_bytes).map(<[_]>::to_vec);
    let checkpoint_data =
        item.get("st8").and_then(AttrValue::as_bytes).map(<[_]>::to_vec).unwrap_or_default();
    let error_message = item.get("err").and_then(AttrValue::as_str).map(str::to_string);
    let error_stack_trace = item.get("errT").and_then(AttrValue::as_str).map(str::to_string);
    let error_id = item.get("errId").and_then(AttrValue::as_str).map(str::to_string);
    let start_time = item.get("ts").and_then(AttrValue::as_i64);
    let end_time = item.get("tf").and_then(AttrValue::as_i64);
    let run_count = item.get("cnt").and_then(AttrValue::as_i64).unwrap_or(0);
    let requeues = item.get("agn").and_then(AttrValue::as_i64).unwrap_or(0);
    let milliseconds_remaining = item.get("tic").and_then(AttrValue::as_i64);
    let canceled_by = item.get("cancel").and_then(AttrValue::as_str).map(str::to_string);

    Ok(TaskInfo {
        task_id,
        entity_type,
        entity_id,
        task_state,
        monitor_id,
        lock_ids,
        prerequisite_task_ids,
        any_prerequisite,
        checkpoint_data,
        update_data,
        start_time,
        end_time,
        run_count,
        requeues,
        milliseconds_remaining,
        canceled_by,
        error_message,
        error_stack_trace,
        error_id,
    })
}

/// `eid` is `entityId + "@" + sortKey(taskId)`; the suffix is always exactly
/// `"@"` plus 20 digits, so stripping it back off is exact regardless of
/// what characters `entityId` itself contains.
fn recover_entity_id(eid: &str) -> TaskResult<String> {
    let suffix_len = SORT_KEY_WIDTH + 1;
    if eid.len() < suffix_len {
        return Err(TaskError::Handler(format!("malformed eid: {eid}")));
    }
    Ok(eid[..eid.len() - suffix_len].to_string())
}

/// A row in the lock table (spec.md §3's polymorphic lock record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRow {
    /// `(lockId, TASK_ID_NONE)`: the currently-held lock.
    Held { lock_id: String, monitor_id: String, running_task_id: TaskId, tasks_queued: i64 },
    /// `(lockId, sortKey(waitingTaskId))`: a blocked waiter.
    Waiter { lock_id: String, waiting_task_id: TaskId },
}

impl LockRow {
    pub fn lock_id(&self) -> &str {
        match self {
            LockRow::Held { lock_id, .. } => lock_id,
            LockRow::Waiter { lock_id, .. } => lock_id,
        }
    }

    pub fn range_key(&self) -> String {
        match self {
            LockRow::Held { .. } => TASK_ID_NONE.to_string(),
            LockRow::Waiter { waiting_task_id, .. } => waiting_task_id.sort_key(),
        }
    }
}

pub fn lock_row_to_item(row: &LockRow) -> Item {
    let mut item = Item::new();
    match row {
        LockRow::Held { lock_id, monitor_id, running_task_id, tasks_queued } => {
            item.insert("lid".into(), AttrValue::S(lock_id.clone()));
            item.insert("tid".into(), AttrValue::S(TASK_ID_NONE.to_string()));
            item.insert("mid".into(), AttrValue::S(monitor_id.clone()));
            item.insert("rtid".into(), AttrValue::S(running_task_id.get().to_string()));
            item.insert("agn".into(), AttrValue::N(*tasks_queued));
        }
        LockRow::Waiter { lock_id, waiting_task_id } => {
            item.insert("lid".into(), AttrValue::S(lock_id.clone()));
            item.insert("tid".into(), AttrValue::S(waiting_task_id.sort_key()));
        }
    }
    item
}

pub fn item_to_lock_row(item: &Item) -> TaskResult<LockRow> {
    let lock_id = item
        .get("lid")
        .and_then(AttrValue::as_str)
        .ok_or_else(|| TaskError::Handler("lock item missing lid".into()))?
        .to_string();
    let tid = item
        .get("tid")
        .and_then(AttrValue::as_str)
        .ok_or_else(|| TaskError::Handler("lock item missing tid".into()))?;

    if tid == TASK_ID_NONE {
        let monitor_id = item
            .get("mid")
            .and_then(AttrValue::as_str)
            .ok_or_else(|| TaskError::Handler("held lock missing mid".into()))?
            .to_string();
        let running_task_id = item
            .get("rtid")
            .and_then(AttrValue::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .map(TaskId::from)
            .ok_or_else(|| TaskError::Handler("held lock missing rtid".into()))?;
        let tasks_queued = item.get("agn").and_then(AttrValue::as_i64).unwrap_or(0);
        Ok(LockRow::Held { lock_id, monitor_id, running_task_id, tasks_queued })
    } else {
        let waiting_task_id = TaskId::from(warden_lib::sort_key_to_i64(tid));
        Ok(LockRow::Waiter { lock_id, waiting_task_id })
    }
}

/// Guarded by `QUEUED_SENTINEL` equality: the claim precondition (§4.5).
pub fn is_queued_sentinel(value: Option<&str>) -> bool {
    value == Some(QUEUED_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MonitorSlot;
    use warden_lib::TaskState;

    fn sample_task() -> TaskInfo {
        TaskInfo {
            task_id: TaskId::from(42),
            entity_type: "echo".into(),
            entity_id: "order-7".into(),
            task_state: TaskState::Queued,
            monitor_id: MonitorSlot::Queued,
            lock_ids: vec!["L".into()],
            prerequisite_task_ids: vec![TaskId::from(1)],
            any_prerequisite: false,
            checkpoint_data: vec![1, 2, 3],
            update_data: Some(vec![9]),
            start_time: Some(1000),
            end_time: None,
            run_count: 1,
            requeues: 0,
            milliseconds_remaining: None,
            canceled_by: None,
            error_message: None,
            error_stack_trace: None,
            error_id: None,
        }
    }

    #[test]
    fn task_round_trips() {
        let task = sample_task();
        let item = task_to_item(&task);
        let back = item_to_task(&item).unwrap();
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.entity_id, task.entity_id);
        assert_eq!(back.entity_type, task.entity_type);
        assert_eq!(back.task_state, task.task_state);
        assert_eq!(back.lock_ids, task.lock_ids);
        assert_eq!(back.prerequisite_task_ids, task.prerequisite_task_ids);
        assert_eq!(back.checkpoint_data, task.checkpoint_data);
        assert_eq!(back.update_data, task.update_data);
        assert_eq!(back.run_count, task.run_count);
    }

    #[test]
    fn terminal_task_drops_non_terminal_mirror() {
        let mut task = sample_task();
        task.task_state = TaskState::Success;
        task.monitor_id = MonitorSlot::None;
        let item = task_to_item(&task);
        assert!(!item.contains_key("ntty"));
        assert!(!item.contains_key("ntid"));
        assert!(!item.contains_key("mid"));
    }

    #[test]
    fn held_lock_round_trips() {
        let row = LockRow::Held {
            lock_id: "L".into(),
            monitor_id: "m1".into(),
            running_task_id: TaskId::from(7),
            tasks_queued: 3,
        };
        let item = lock_row_to_item(&row);
        assert_eq!(item_to_lock_row(&item).unwrap(), row);
    }

    #[test]
    fn waiter_round_trips() {
        let row = LockRow::Waiter { lock_id: "L".into(), waiting_task_id: TaskId::from(9) };
        let item = lock_row_to_item(&row);
        assert_eq!(item_to_lock_row(&item).unwrap(), row);
    }

    #[test]
    fn recovers_entity_id_containing_at_signs() {
        let task = TaskInfo { entity_id: "a@b@c".into(), ..sample_task() };
        let item = task_to_item(&task);
        let back = item_to_task(&item).unwrap();
        assert_eq!(back.entity_id, "a@b@c");
    }
}
