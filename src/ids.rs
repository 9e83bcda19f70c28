//! Day-scoped, human-sortable item ids: `TASK-20261019-0001`, `ISSUE-20261019-0002`.
//!
//! The sequence is zero-padded to [`SEQUENCE_WIDTH`] digits and capped at
//! [`MAX_SEQUENCE`] per prefix and day, so string order is allocation order.
//!
//! Sequences live in the `id_sequences` table and are bumped with a single
//! upsert, so allocation is atomic with the surrounding insert transaction.

use chrono::NaiveDate;
use rusqlite::Connection;

use crate::error::{EngineError, Result};
use crate::model::Kind;

const NEXT_SEQUENCE: &str = "
INSERT INTO id_sequences (prefix, day, next) VALUES (?1, ?2, 2)
ON CONFLICT(prefix, day) DO UPDATE SET next = next + 1
RETURNING next - 1
";

pub const SEQUENCE_WIDTH: usize = 4;
pub const MAX_SEQUENCE: u32 = 9999;

pub fn prefix(kind: Kind) -> &'static str {
    match kind {
        Kind::Task => "TASK",
        Kind::Issue => "ISSUE",
    }
}

pub fn format_id(kind: Kind, day: NaiveDate, seq: u32) -> String {
    format!(
        "{}-{}-{seq:0width$}",
        prefix(kind),
        day.format("%Y%m%d"),
        width = SEQUENCE_WIDTH
    )
}

pub fn next_id(conn: &Connection, kind: Kind, day: NaiveDate) -> Result<String> {
    let day_key = day.format("%Y%m%d").to_string();
    let seq: u32 = conn.query_row(
        NEXT_SEQUENCE,
        rusqlite::params![prefix(kind), day_key],
        |row| row.get(0),
    )?;
    if seq > MAX_SEQUENCE {
        return Err(EngineError::InvalidValue(format!(
            "{} ids for {day_key} exhausted ({MAX_SEQUENCE} per day)",
            prefix(kind)
        )));
    }
    Ok(format_id(kind, day, seq))
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Validate an externally supplied id: `PREFIX-YYYYMMDD-NNNN`.
pub fn validate_id(id: &str) -> Result<()> {
    let parts: Vec<&str> = id.splitn(3, '-').collect();
    let valid = match parts.as_slice() {
        [p, day, seq] => {
            (*p == "TASK" || *p == "ISSUE")
                && NaiveDate::parse_from_str(day, "%Y%m%d").is_ok()
                && !seq.is_empty()
                && seq.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    };
    if !valid {
        return Err(EngineError::InvalidValue(format!(
            "invalid item id '{id}': expected TASK-YYYYMMDD-NNNN or ISSUE-YYYYMMDD-NNNN"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sequences_are_per_kind_and_day() {
        let conn = db::open_memory().unwrap();
        let d1 = day(2026, 10, 19);
        let d2 = day(2026, 10, 20);
        assert_eq!(next_id(&conn, Kind::Task, d1).unwrap(), "TASK-20261019-0001");
        assert_eq!(next_id(&conn, Kind::Task, d1).unwrap(), "TASK-20261019-0002");
        assert_eq!(next_id(&conn, Kind::Issue, d1).unwrap(), "ISSUE-20261019-0001");
        assert_eq!(next_id(&conn, Kind::Task, d2).unwrap(), "TASK-20261020-0001");
        assert_eq!(next_id(&conn, Kind::Task, d1).unwrap(), "TASK-20261019-0003");
    }

    #[test]
    fn ids_sort_by_day_then_sequence() {
        let mut ids = vec![
            format_id(Kind::Task, day(2026, 10, 20), 1),
            format_id(Kind::Task, day(2026, 10, 19), 12),
            format_id(Kind::Task, day(2026, 10, 19), 3),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec!["TASK-20261019-0003", "TASK-20261019-0012", "TASK-20261020-0001"]
        );
    }

    #[test]
    fn ids_past_a_thousand_still_sort_numerically() {
        let d = day(2026, 10, 19);
        let mut ids: Vec<String> = [1000, 999, 1, 9999, 10]
            .iter()
            .map(|&n| format_id(Kind::Issue, d, n))
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "ISSUE-20261019-0001",
                "ISSUE-20261019-0010",
                "ISSUE-20261019-0999",
                "ISSUE-20261019-1000",
                "ISSUE-20261019-9999",
            ]
        );
    }

    #[test]
    fn exhausted_day_is_an_error_not_an_unsortable_id() {
        let conn = db::open_memory().unwrap();
        conn.execute(
            "INSERT INTO id_sequences (prefix, day, next) VALUES ('TASK', '20261019', ?1)",
            [MAX_SEQUENCE],
        )
        .unwrap();
        assert_eq!(
            next_id(&conn, Kind::Task, day(2026, 10, 19)).unwrap(),
            "TASK-20261019-9999"
        );
        let err = next_id(&conn, Kind::Task, day(2026, 10, 19)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidValue(_)), "{err}");
        // Other kinds and days are unaffected.
        assert_eq!(
            next_id(&conn, Kind::Issue, day(2026, 10, 19)).unwrap(),
            "ISSUE-20261019-0001"
        );
    }

    #[test]
    fn validate_accepts_generated_ids() {
        assert!(validate_id("TASK-20261019-0001").is_ok());
        assert!(validate_id("ISSUE-20261019-1234").is_ok());
    }

    #[test]
    fn validate_rejects_malformed_ids() {
        assert!(validate_id("").is_err());
        assert!(validate_id("TASK-001").is_err());
        assert!(validate_id("BUG-20261019-001").is_err());
        assert!(validate_id("TASK-20261399-001").is_err());
        assert!(validate_id("TASK-20261019-abc").is_err());
    }
}
