//! Picks and claims the next ready item.

use std::collections::HashMap;

use log::{debug, info, warn};
use rusqlite::Connection;

use crate::db::write_txn;
use crate::error::Result;
use crate::model::WorkItem;
use crate::resolver;
use crate::store;

/// Lost races are retried this many times before `next` reports nothing.
pub const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Claim the best ready item for `claimer`, or `None` when nothing is ready.
///
/// Snapshot, selection and claim share one write transaction, so two callers
/// can never both come away with the same item.
pub fn next(conn: &Connection, claimer: &str) -> Result<Option<WorkItem>> {
    for attempt in 1..=MAX_CLAIM_ATTEMPTS {
        match try_claim(conn, claimer) {
            Err(e) if e.is_transient() => {
                debug!("{claimer}: claim attempt {attempt} lost: {e}");
            }
            other => return other,
        }
    }
    Ok(None)
}

fn try_claim(conn: &Connection, claimer: &str) -> Result<Option<WorkItem>> {
    write_txn(conn, || {
        let items = store::snapshot(conn)?;
        report_cycle(conn, &items)?;
        let Some(id) = resolver::ready_items(&items).into_iter().next() else {
            return Ok(None);
        };
        store::claim(conn, &id, claimer)?;
        let item = store::get(conn, &id)?;
        info!(
            "{claimer}: claimed {id} ({}, {}, retry {}/{})",
            item.priority, item.category, item.retry_count, item.max_retries
        );
        Ok(Some(item))
    })
}

/// A cycle can only get into the store by editing it behind the engine's
/// back. Its items and their dependents are held out of the ready set; the
/// chain is logged and filed as a `cycle` event on its first item once.
fn report_cycle(conn: &Connection, items: &[WorkItem]) -> Result<()> {
    let Some(chain) = resolver::detect_cycle(items) else {
        return Ok(());
    };
    let Some(first) = chain.first() else {
        return Ok(());
    };
    let detail = chain.join(" -> ");
    if store::record_event_once(conn, first, "cycle", &detail)? {
        warn!("dependency cycle {detail}: holding back its items and their dependents");
    } else {
        debug!("dependency cycle {detail} still present");
    }
    Ok(())
}

/// The ready set without claiming anything, best first.
pub fn peek(conn: &Connection) -> Result<Vec<WorkItem>> {
    let items = store::snapshot(conn)?;
    let ready = resolver::ready_items(&items);
    let mut by_id: HashMap<String, WorkItem> =
        items.into_iter().map(|i| (i.id.clone(), i)).collect();
    Ok(ready.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}
