//! The work-item store: the only shared mutable resource in the engine.
//!
//! Status changes go exclusively through [`update_status`], a compare-and-swap
//! on the status column guarded by [`Status::can_transition_to`]. Every
//! mutation runs in one transaction and appends to `item_events`.

use std::collections::HashMap;
use std::str::FromStr;

use log::debug;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};

use crate::db::write_txn;
use crate::error::{EngineError, Result};
use crate::ids;
use crate::model::{
    Event, Intervention, NewItem, Note, Priority, RootCause, Status, TestMode, Tier, WorkItem,
};
use crate::resolver;
use crate::validate::{validate_category, validate_title};

const ITEM_COLUMNS: &str = "seq, id, kind, title, objective, acceptance, status, category, \
    complexity, priority, mode, retry_count, max_retries, failure_signature, \
    previous_signatures, signature_repeat_count, tier_floor, halted, claimed_by, \
    status_changed_at, created_at, updated_at";

const INSERT_ITEM: &str = "
INSERT INTO items (id, kind, title, objective, acceptance, category, complexity, priority,
                   mode, max_retries)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
";

const CAS_STATUS: &str = "
UPDATE items
SET status = ?1,
    halted = (?1 = 'halted'),
    claimed_by = CASE WHEN ?1 = 'in_progress' THEN ?4 ELSE NULL END,
    status_changed_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
    updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
WHERE id = ?2 AND status = ?3 AND (?5 IS NULL OR claimed_by = ?5)
";

const SET_FAILURE_STATE: &str = "
UPDATE items
SET failure_signature = ?1,
    previous_signatures = ?2,
    signature_repeat_count = ?3,
    updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
WHERE id = ?4
";

const SET_RETRY_STATE: &str = "
UPDATE items
SET retry_count = ?1,
    priority = ?2,
    tier_floor = ?3,
    updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
WHERE id = ?4
";

const SET_PRIORITY: &str = "
UPDATE items
SET priority = ?1,
    updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
WHERE id = ?2
";

const INSERT_INTERVENTION: &str = "
INSERT INTO interventions (item, signature, root_cause, error_message, evidence,
                           suggested_remediation)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
";

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_col<T: FromStr<Err = EngineError>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn read_item_row(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    let mode: Option<String> = row.get(10)?;
    let mode = mode
        .map(|m| m.parse::<TestMode>().map_err(|e| conversion_error(10, e)))
        .transpose()?;
    Ok(WorkItem {
        seq: row.get(0)?,
        id: row.get(1)?,
        kind: parse_col(row, 2)?,
        title: row.get(3)?,
        objective: row.get(4)?,
        acceptance: json_col(row, 5)?,
        status: parse_col(row, 6)?,
        category: row.get(7)?,
        complexity: parse_col(row, 8)?,
        priority: parse_col(row, 9)?,
        mode,
        dependencies: Vec::new(),
        tests: Vec::new(),
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        failure_signature: row.get(13)?,
        previous_signatures: json_col(row, 14)?,
        signature_repeat_count: row.get(15)?,
        tier_floor: parse_col(row, 16)?,
        halted: row.get(17)?,
        claimed_by: row.get(18)?,
        status_changed_at: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn item_exists(conn: &Connection, id: &str) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM items WHERE id = ?1", [id], |row| {
        row.get(0)
    })?;
    Ok(count > 0)
}

fn require_item(conn: &Connection, id: &str) -> Result<()> {
    if !item_exists(conn, id)? {
        return Err(EngineError::NotFound(id.to_string()));
    }
    Ok(())
}

pub fn current_status(conn: &Connection, id: &str) -> Result<Status> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM items WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    match status {
        Some(s) => s.parse(),
        None => Err(EngineError::NotFound(id.to_string())),
    }
}

pub fn record_event(conn: &Connection, id: &str, kind: &str, detail: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO item_events (item, kind, detail) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, kind, detail],
    )?;
    Ok(())
}

/// Record an event unless an identical one is already on file. Returns
/// whether a row was written.
pub fn record_event_once(conn: &Connection, id: &str, kind: &str, detail: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM item_events WHERE item = ?1 AND kind = ?2 AND detail = ?3)",
        rusqlite::params![id, kind, detail],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(false);
    }
    record_event(conn, id, kind, detail)?;
    Ok(true)
}

/// Insert a new item and return its allocated id.
pub fn put(conn: &Connection, item: &NewItem) -> Result<String> {
    validate_title(&item.title)?;
    validate_category(&item.category)?;
    let is_testing = item.category == crate::model::TESTING_CATEGORY;
    if item.mode.is_some() && !is_testing {
        return Err(EngineError::InvalidValue(format!(
            "'{}': mode is only valid for the testing category",
            item.title
        )));
    }
    write_txn(conn, || {
        let id = ids::next_id(conn, item.kind, ids::today())?;
        conn.execute(
            INSERT_ITEM,
            rusqlite::params![
                id,
                item.kind.as_str(),
                item.title,
                item.objective,
                serde_json::to_string(&item.acceptance)?,
                item.category,
                item.complexity.as_str(),
                item.priority.as_str(),
                item.mode.map(|m| m.as_str()),
                item.max_retries,
            ],
        )?;
        for test_id in &item.tests {
            conn.execute(
                "INSERT OR IGNORE INTO item_tests (item, test_id) VALUES (?1, ?2)",
                rusqlite::params![id, test_id],
            )?;
        }
        record_event(conn, &id, "created", &item.title)?;
        if !item.dependencies.is_empty() {
            // One snapshot for all edges; each accepted edge is mirrored into
            // it so later checks see the earlier ones.
            let mut items = snapshot(conn)?;
            for dep in &item.dependencies {
                check_dependency(&items, &id, dep)?;
                insert_dependency(conn, &id, dep)?;
                if let Some(stored) = items.iter_mut().find(|i| i.id == id) {
                    stored.dependencies.push(dep.clone());
                }
            }
        }
        debug!("stored {id} ({})", item.title);
        Ok(id)
    })
}

pub fn get(conn: &Connection, id: &str) -> Result<WorkItem> {
    let query = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1");
    let mut item = conn
        .query_row(&query, [id], read_item_row)
        .optional()?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    item.dependencies = dependencies_of(conn, id)?;
    item.tests = tests_of(conn, id)?;
    Ok(item)
}

fn query_items(conn: &Connection, filter: Option<Status>) -> Result<Vec<WorkItem>> {
    let mut items: Vec<WorkItem> = match filter {
        Some(status) => {
            let query = format!("SELECT {ITEM_COLUMNS} FROM items WHERE status = ?1 ORDER BY seq");
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map([status.as_str()], read_item_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        }
        None => {
            let query = format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY seq");
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map([], read_item_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        }
    };

    let mut deps = all_dependencies(conn)?;
    let mut tests = all_tests(conn)?;
    for item in &mut items {
        item.dependencies = deps.remove(&item.id).unwrap_or_default();
        item.tests = tests.remove(&item.id).unwrap_or_default();
    }
    Ok(items)
}

pub fn list_by_status(conn: &Connection, status: Status) -> Result<Vec<WorkItem>> {
    query_items(conn, Some(status))
}

/// Every item with dependencies and coverage filled in, in creation order.
pub fn snapshot(conn: &Connection) -> Result<Vec<WorkItem>> {
    query_items(conn, None)
}

/// Compare-and-swap the status of `id` from `from` to `to`.
///
/// Fails with `InvalidTransition` if the lifecycle forbids the edge and with
/// `ClaimConflict` if the stored status is no longer `from`. `claimer` is
/// recorded when moving to `in_progress` and cleared otherwise. When moving
/// out of `in_progress`, a `Some` claimer must still own the claim; `None`
/// acts regardless of owner.
pub fn update_status(
    conn: &Connection,
    id: &str,
    from: Status,
    to: Status,
    claimer: Option<&str>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(EngineError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }
    let owner = if from == Status::InProgress { claimer } else { None };
    write_txn(conn, || {
        let rows = conn.execute(
            CAS_STATUS,
            rusqlite::params![to.as_str(), id, from.as_str(), claimer, owner],
        )?;
        if rows == 0 {
            require_item(conn, id)?;
            return Err(EngineError::ClaimConflict { id: id.to_string() });
        }
        record_event(conn, id, "status", &format!("{from} -> {to}"))?;
        Ok(())
    })
}

pub fn claim(conn: &Connection, id: &str, claimer: &str) -> Result<()> {
    update_status(conn, id, Status::Pending, Status::InProgress, Some(claimer))
}

/// `claimer` is the worker reporting; `None` completes whoever holds it.
pub fn complete(conn: &Connection, id: &str, claimer: Option<&str>) -> Result<()> {
    update_status(conn, id, Status::InProgress, Status::Completed, claimer)
}

pub fn mark_failed(conn: &Connection, id: &str, claimer: Option<&str>) -> Result<()> {
    update_status(conn, id, Status::InProgress, Status::Failed, claimer)
}

/// Return an in-flight item to the queue without charging its retry budget.
pub fn cancel(conn: &Connection, id: &str, reason: &str) -> Result<()> {
    write_txn(conn, || {
        update_status(conn, id, Status::InProgress, Status::Pending, None)?;
        record_event(conn, id, "cancelled", reason)
    })
}

/// Persist loop-detection state after a failure.
pub fn set_failure_state(
    conn: &Connection,
    id: &str,
    signature: &str,
    previous: &[String],
    repeat_count: u32,
) -> Result<()> {
    write_txn(conn, || {
        let rows = conn.execute(
            SET_FAILURE_STATE,
            rusqlite::params![signature, serde_json::to_string(previous)?, repeat_count, id],
        )?;
        if rows == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        record_event(conn, id, "failure", signature)
    })
}

/// Re-arm a failed item: `failed -> pending` with updated retry bookkeeping.
pub fn rearm(
    conn: &Connection,
    id: &str,
    retry_count: u32,
    priority: Priority,
    tier_floor: Tier,
) -> Result<()> {
    write_txn(conn, || {
        let item = get(conn, id)?;
        if retry_count > item.max_retries {
            return Err(EngineError::BudgetExhausted { id: id.to_string() });
        }
        conn.execute(
            SET_RETRY_STATE,
            rusqlite::params![retry_count, priority.as_str(), tier_floor.as_str(), id],
        )?;
        update_status(conn, id, Status::Failed, Status::Pending, None)?;
        record_event(
            conn,
            id,
            "rearmed",
            &format!("retry {retry_count}/{} at {tier_floor}", item.max_retries),
        )
    })
}

/// Halt a failed item and file its manual-intervention record.
pub fn halt(conn: &Connection, intervention: &Intervention) -> Result<()> {
    let id = intervention.item.as_str();
    write_txn(conn, || {
        update_status(conn, id, Status::Failed, Status::Halted, None)?;
        conn.execute(
            INSERT_INTERVENTION,
            rusqlite::params![
                id,
                intervention.signature,
                intervention.root_cause.as_str(),
                intervention.error_message,
                serde_json::to_string(&intervention.evidence)?,
                intervention.suggested_remediation,
            ],
        )?;
        record_event(conn, id, "halted", &intervention.suggested_remediation)
    })
}

pub fn set_priority(conn: &Connection, id: &str, priority: Priority) -> Result<()> {
    write_txn(conn, || {
        let rows = conn.execute(SET_PRIORITY, rusqlite::params![priority.as_str(), id])?;
        if rows == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        record_event(conn, id, "priority", priority.as_str())
    })
}

/// Would `item -> depends_on` be a legal edge in `items`?
///
/// Test writers may only wait on other testing items, and the edge may not
/// close a cycle once implicit coverage edges are counted.
fn check_dependency(items: &[WorkItem], item: &str, depends_on: &str) -> Result<()> {
    let find = |id: &str| {
        items
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    };
    let from = find(item)?;
    let to = find(depends_on)?;
    if from.is_test_writer() && !to.is_testing() {
        return Err(EngineError::InvalidValue(format!(
            "test-writing item '{item}' may not depend on non-testing item '{depends_on}'"
        )));
    }
    if let Some(path) = resolver::dependency_path(items, depends_on, item) {
        let mut chain = vec![item.to_string()];
        chain.extend(path);
        return Err(EngineError::DependencyCycle { chain });
    }
    Ok(())
}

fn insert_dependency(conn: &Connection, item: &str, depends_on: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO item_deps (item, depends_on) VALUES (?1, ?2)",
        rusqlite::params![item, depends_on],
    )?;
    Ok(())
}

pub fn add_dependency(conn: &Connection, item: &str, depends_on: &str) -> Result<()> {
    write_txn(conn, || {
        let items = snapshot(conn)?;
        check_dependency(&items, item, depends_on)?;
        insert_dependency(conn, item, depends_on)
    })
}

pub fn remove_dependency(conn: &Connection, item: &str, depends_on: &str) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM item_deps WHERE item = ?1 AND depends_on = ?2",
        rusqlite::params![item, depends_on],
    )?;
    if changed == 0 {
        return Err(EngineError::InvalidValue(format!(
            "'{item}' does not depend on '{depends_on}'"
        )));
    }
    Ok(())
}

pub fn dependencies_of(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT depends_on FROM item_deps WHERE item = ?1 ORDER BY depends_on")?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn dependents_of(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT item FROM item_deps WHERE depends_on = ?1 ORDER BY item")?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Dependencies that have not reached `completed`.
pub fn unmet_dependencies(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT d.depends_on FROM item_deps d \
         INNER JOIN items i ON i.id = d.depends_on AND i.status != 'completed' \
         WHERE d.item = ?1 ORDER BY d.depends_on",
    )?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn tests_of(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT test_id FROM item_tests WHERE item = ?1 ORDER BY test_id")?;
    let rows = stmt.query_map([id], |row| row.get(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn all_dependencies(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT item, depends_on FROM item_deps ORDER BY item, depends_on")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (item, dep) = row?;
        map.entry(item).or_default().push(dep);
    }
    Ok(map)
}

fn all_tests(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT item, test_id FROM item_tests ORDER BY item, test_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (item, test_id) = row?;
        map.entry(item).or_default().push(test_id);
    }
    Ok(map)
}

pub fn add_note(conn: &Connection, id: &str, content: &str) -> Result<()> {
    require_item(conn, id)?;
    conn.execute(
        "INSERT INTO notes (item, content) VALUES (?1, ?2)",
        rusqlite::params![id, content],
    )?;
    Ok(())
}

pub fn list_notes(conn: &Connection, id: &str) -> Result<Vec<Note>> {
    require_item(conn, id)?;
    let mut stmt =
        conn.prepare("SELECT id, item, content, created_at FROM notes WHERE item = ?1 ORDER BY id")?;
    let rows = stmt.query_map([id], |row| {
        Ok(Note {
            id: row.get(0)?,
            item: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn events_for(conn: &Connection, id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, item, kind, detail, created_at FROM item_events WHERE item = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([id], |row| {
        Ok(Event {
            id: row.get(0)?,
            item: row.get(1)?,
            kind: row.get(2)?,
            detail: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn read_intervention_row(row: &rusqlite::Row) -> rusqlite::Result<Intervention> {
    Ok(Intervention {
        item: row.get(0)?,
        signature: row.get(1)?,
        root_cause: parse_col::<RootCause>(row, 2)?,
        error_message: row.get(3)?,
        evidence: json_col(row, 4)?,
        suggested_remediation: row.get(5)?,
    })
}

const INTERVENTION_COLUMNS: &str =
    "item, signature, root_cause, error_message, evidence, suggested_remediation";

pub fn get_intervention(conn: &Connection, id: &str) -> Result<Option<Intervention>> {
    let query = format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE item = ?1");
    conn.query_row(&query, [id], read_intervention_row)
        .optional()
        .map_err(Into::into)
}

pub fn list_interventions(conn: &Connection) -> Result<Vec<Intervention>> {
    let query = format!("SELECT {INTERVENTION_COLUMNS} FROM interventions ORDER BY id");
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map([], read_intervention_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub fn count_by_status(conn: &Connection) -> Result<HashMap<Status, usize>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM items GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((parse_col::<Status>(row, 0)?, row.get::<_, i64>(1)?)))?;
    let mut counts = HashMap::new();
    for row in rows {
        let (status, n) = row?;
        counts.insert(status, n as usize);
    }
    Ok(counts)
}
