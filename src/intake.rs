//! Turning external input into work items: specification batches and issues.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::info;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::write_txn;
use crate::error::{EngineError, Result};
use crate::model::{
    Complexity, Kind, NewItem, Priority, Status, TestMode, WorkItem, DEFAULT_MAX_RETRIES,
    TESTING_CATEGORY,
};
use crate::resolver::find_cycle;
use crate::store;

/// Minimum token overlap for two issues to count as the same report.
pub const DUPLICATE_THRESHOLD: f64 = 0.5;

/// One candidate work item from a specification batch. `depends_on` names
/// other candidates by their batch-local `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateItem {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub mode: Option<TestMode>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CandidateItem {
    fn is_testing(&self) -> bool {
        self.category == TESTING_CATEGORY
    }

    /// Testing candidates without an explicit mode author tests.
    fn effective_mode(&self) -> Option<TestMode> {
        if self.is_testing() {
            Some(self.mode.unwrap_or(TestMode::Write))
        } else {
            self.mode
        }
    }

    fn is_test_writer(&self) -> bool {
        self.effective_mode() == Some(TestMode::Write) && self.is_testing()
    }
}

/// A decomposition batch: the candidates plus every test id the source
/// specification defines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecBatch {
    #[serde(default)]
    pub test_ids: Vec<String>,
    pub items: Vec<CandidateItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub key: String,
    pub id: String,
}

/// Each declared test id must be authored by exactly one test-writing
/// candidate. Ids referenced anywhere in the batch must be declared.
pub fn check_coverage(batch: &SpecBatch) -> Result<()> {
    let declared: HashSet<&str> = batch.test_ids.iter().map(String::as_str).collect();
    for item in &batch.items {
        if let Some(unknown) = item.tests.iter().find(|t| !declared.contains(t.as_str())) {
            return Err(EngineError::InvalidBatch(format!(
                "'{}' references undeclared test id '{unknown}'",
                item.key
            )));
        }
    }

    let mut owners: HashMap<&str, usize> = HashMap::new();
    for item in batch.items.iter().filter(|i| i.is_test_writer()) {
        for test_id in item.tests.iter().collect::<BTreeSet<_>>() {
            *owners.entry(test_id.as_str()).or_default() += 1;
        }
    }

    let mut missing = Vec::new();
    let mut duplicated = Vec::new();
    let mut seen = HashSet::new();
    for test_id in &batch.test_ids {
        if !seen.insert(test_id.as_str()) {
            continue;
        }
        match owners.get(test_id.as_str()).copied().unwrap_or(0) {
            0 => missing.push(test_id.clone()),
            1 => {}
            _ => duplicated.push(test_id.clone()),
        }
    }
    if !missing.is_empty() || !duplicated.is_empty() {
        return Err(EngineError::CoverageGap {
            missing,
            duplicated,
        });
    }
    Ok(())
}

fn validate_candidates(batch: &SpecBatch) -> Result<()> {
    let mut keys = HashSet::new();
    for item in &batch.items {
        if item.key.trim().is_empty() {
            return Err(EngineError::InvalidBatch(format!(
                "'{}' has an empty key",
                item.title
            )));
        }
        if !keys.insert(item.key.as_str()) {
            return Err(EngineError::InvalidBatch(format!(
                "duplicate key '{}'",
                item.key
            )));
        }
        if item.mode.is_some() && !item.is_testing() {
            return Err(EngineError::InvalidBatch(format!(
                "'{}': mode is only valid for the testing category",
                item.key
            )));
        }
    }
    for item in &batch.items {
        if let Some(unknown) = item.depends_on.iter().find(|d| !keys.contains(d.as_str())) {
            return Err(EngineError::InvalidBatch(format!(
                "'{}' depends on unknown key '{unknown}'",
                item.key
            )));
        }
    }
    Ok(())
}

/// Explicit dependencies plus the test-first wiring: every implementation
/// candidate depends on the writer that authors each of its tests.
fn wire_dependencies(batch: &SpecBatch) -> Result<Vec<(String, Vec<String>)>> {
    let by_key: HashMap<&str, &CandidateItem> =
        batch.items.iter().map(|i| (i.key.as_str(), i)).collect();
    let mut writer_of: HashMap<&str, &str> = HashMap::new();
    for item in batch.items.iter().filter(|i| i.is_test_writer()) {
        for test_id in &item.tests {
            writer_of.insert(test_id.as_str(), item.key.as_str());
        }
    }

    let mut wired = Vec::with_capacity(batch.items.len());
    for item in &batch.items {
        let mut deps: Vec<String> = Vec::new();
        for dep in &item.depends_on {
            if item.is_test_writer() && !by_key[dep.as_str()].is_testing() {
                return Err(EngineError::InvalidBatch(format!(
                    "test-writing item '{}' may not depend on non-testing item '{dep}'",
                    item.key
                )));
            }
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        if !item.is_testing() {
            for test_id in &item.tests {
                if let Some(writer) = writer_of.get(test_id.as_str()) {
                    if !deps.iter().any(|d| d == writer) {
                        deps.push(writer.to_string());
                    }
                }
            }
        }
        wired.push((item.key.clone(), deps));
    }
    Ok(wired)
}

/// Kahn's algorithm over batch keys; ties keep batch order.
fn insertion_order(wired: &[(String, Vec<String>)]) -> Vec<usize> {
    let index: HashMap<&str, usize> = wired
        .iter()
        .enumerate()
        .map(|(n, (key, _))| (key.as_str(), n))
        .collect();
    let mut remaining: Vec<usize> = wired.iter().map(|(_, deps)| deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); wired.len()];
    for (n, (_, deps)) in wired.iter().enumerate() {
        for dep in deps {
            dependents[index[dep.as_str()]].push(n);
        }
    }

    let mut queue: VecDeque<usize> = (0..wired.len()).filter(|n| remaining[*n] == 0).collect();
    let mut order = Vec::with_capacity(wired.len());
    while let Some(n) = queue.pop_front() {
        order.push(n);
        let mut unlocked: Vec<usize> = Vec::new();
        for &d in &dependents[n] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                unlocked.push(d);
            }
        }
        unlocked.sort_unstable();
        queue.extend(unlocked);
    }
    order
}

/// Validate a specification batch and insert it as pending tasks.
///
/// All or nothing: coverage gaps, bad wiring and cycles reject the whole
/// batch, and the inserts share one transaction. Returns the allocated id for
/// every candidate, in batch order.
pub fn decompose(conn: &Connection, batch: &SpecBatch) -> Result<Vec<Accepted>> {
    validate_candidates(batch)?;
    check_coverage(batch)?;
    let wired = wire_dependencies(batch)?;

    let graph: Vec<(&str, Vec<&str>)> = wired
        .iter()
        .map(|(key, deps)| (key.as_str(), deps.iter().map(String::as_str).collect()))
        .collect();
    if let Some(chain) = find_cycle(&graph) {
        return Err(EngineError::DependencyCycle { chain });
    }

    let ids = write_txn(conn, || {
        let mut ids: HashMap<&str, String> = HashMap::new();
        for n in insertion_order(&wired) {
            let candidate = &batch.items[n];
            let (key, deps) = &wired[n];
            let new = NewItem {
                kind: Kind::Task,
                title: candidate.title.clone(),
                objective: candidate.objective.clone(),
                acceptance: candidate.acceptance.clone(),
                category: candidate.category.clone(),
                complexity: candidate.complexity,
                priority: candidate.priority,
                mode: candidate.effective_mode(),
                dependencies: deps.iter().map(|d| ids[d.as_str()].clone()).collect(),
                tests: candidate.tests.clone(),
                max_retries: candidate.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            };
            let id = store::put(conn, &new)?;
            ids.insert(key.as_str(), id);
        }
        Ok(ids)
    })?;

    info!(
        "decomposed batch: {} items, {} test ids covered",
        batch.items.len(),
        batch.test_ids.len()
    );
    Ok(batch
        .items
        .iter()
        .map(|c| Accepted {
            key: c.key.clone(),
            id: ids[c.key.as_str()].clone(),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum IssueOutcome {
    Created(String),
    Folded(String),
}

impl IssueOutcome {
    pub fn id(&self) -> &str {
        match self {
            IssueOutcome::Created(id) | IssueOutcome::Folded(id) => id,
        }
    }
}

/// Lowercase alphanumeric words of three or more characters.
pub fn summary_tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

pub fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn summary(title: &str, objective: &str) -> HashSet<String> {
    summary_tokens(&format!("{title} {objective}"))
}

/// Earliest pending issue in the same category whose summary overlaps enough.
fn find_duplicate<'a>(pending: &'a [WorkItem], issue: &NewItem) -> Option<&'a WorkItem> {
    let tokens = summary(&issue.title, &issue.objective);
    let mut best: Option<(&WorkItem, f64)> = None;
    for candidate in pending
        .iter()
        .filter(|i| i.kind == Kind::Issue && i.category == issue.category)
    {
        let score = similarity(&tokens, &summary(&candidate.title, &candidate.objective));
        if score < DUPLICATE_THRESHOLD {
            continue;
        }
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }
    best.map(|(item, _)| item)
}

/// Submit an issue report, folding it into a pending near-duplicate if one
/// exists. A folded report never lowers the existing item's priority, and its
/// complexity is kept in the fold note. Reports that carry dependencies are
/// always created: folding would drop the ordering they ask for.
pub fn submit_issue(conn: &Connection, issue: &NewItem) -> Result<IssueOutcome> {
    let mut issue = issue.clone();
    issue.kind = Kind::Issue;
    write_txn(conn, || {
        let pending = if issue.dependencies.is_empty() {
            store::list_by_status(conn, Status::Pending)?
        } else {
            Vec::new()
        };
        if let Some(existing) = find_duplicate(&pending, &issue) {
            let id = existing.id.clone();
            let mut note = format!(
                "duplicate report: {} ({} complexity)",
                issue.title, issue.complexity
            );
            if !issue.objective.trim().is_empty() {
                note.push_str("\n\n");
                note.push_str(issue.objective.trim());
            }
            store::add_note(conn, &id, &note)?;
            let priority = existing.priority.most_urgent(issue.priority);
            if priority != existing.priority {
                store::set_priority(conn, &id, priority)?;
            }
            store::record_event(conn, &id, "folded", &issue.title)?;
            info!("folded issue '{}' into {id} ({priority})", issue.title);
            return Ok(IssueOutcome::Folded(id));
        }
        let id = store::put(conn, &issue)?;
        info!("created issue {id} ({})", issue.priority);
        Ok(IssueOutcome::Created(id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn candidate(key: &str, category: &str, tests: &[&str], deps: &[&str]) -> CandidateItem {
        CandidateItem {
            key: key.into(),
            title: format!("{key} title"),
            objective: String::new(),
            acceptance: Vec::new(),
            category: category.into(),
            complexity: Complexity::Normal,
            priority: Priority::Medium,
            mode: None,
            tests: tests.iter().map(|t| t.to_string()).collect(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            max_retries: None,
        }
    }

    fn batch(test_ids: &[&str], items: Vec<CandidateItem>) -> SpecBatch {
        SpecBatch {
            test_ids: test_ids.iter().map(|t| t.to_string()).collect(),
            items,
        }
    }

    fn id_of<'a>(accepted: &'a [Accepted], key: &str) -> &'a str {
        &accepted.iter().find(|a| a.key == key).unwrap().id
    }

    #[test]
    fn accepts_fully_covered_batch_and_wires_tests_first() {
        let conn = db::open_memory().unwrap();
        let b = batch(
            &["T-1", "T-2"],
            vec![
                candidate("impl", "backend", &["T-1", "T-2"], &[]),
                candidate("tests", "testing", &["T-1", "T-2"], &[]),
            ],
        );
        let accepted = decompose(&conn, &b).unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].key, "impl");

        let imp = store::get(&conn, id_of(&accepted, "impl")).unwrap();
        let tests = store::get(&conn, id_of(&accepted, "tests")).unwrap();
        assert_eq!(imp.dependencies, vec![tests.id.clone()]);
        assert_eq!(tests.mode, Some(TestMode::Write));
        assert!(tests.dependencies.is_empty());
        // Writers are inserted first so dependency ids exist.
        assert!(tests.seq < imp.seq);
    }

    #[test]
    fn unmapped_test_rejects_whole_batch() {
        let conn = db::open_memory().unwrap();
        let b = batch(
            &["T-1", "T-2"],
            vec![
                candidate("tests", "testing", &["T-1"], &[]),
                candidate("impl", "backend", &["T-1"], &[]),
            ],
        );
        match decompose(&conn, &b) {
            Err(EngineError::CoverageGap {
                missing,
                duplicated,
            }) => {
                assert_eq!(missing, vec!["T-2"]);
                assert!(duplicated.is_empty());
            }
            other => panic!("expected coverage gap, got {other:?}"),
        }
        assert!(store::snapshot(&conn).unwrap().is_empty());
    }

    #[test]
    fn doubly_covered_test_is_rejected() {
        let b = batch(
            &["T-1"],
            vec![
                candidate("a", "testing", &["T-1"], &[]),
                candidate("b", "testing", &["T-1"], &[]),
            ],
        );
        match check_coverage(&b) {
            Err(EngineError::CoverageGap { duplicated, .. }) => assert_eq!(duplicated, vec!["T-1"]),
            other => panic!("expected coverage gap, got {other:?}"),
        }
    }

    #[test]
    fn verify_items_do_not_own_coverage() {
        let mut verify = candidate("verify", "testing", &["T-1"], &[]);
        verify.mode = Some(TestMode::Verify);
        let b = batch(&["T-1"], vec![candidate("write", "testing", &["T-1"], &[]), verify]);
        assert!(check_coverage(&b).is_ok());
    }

    #[test]
    fn undeclared_test_id_is_invalid() {
        let b = batch(&["T-1"], vec![candidate("a", "testing", &["T-1", "T-9"], &[])]);
        assert!(matches!(check_coverage(&b), Err(EngineError::InvalidBatch(_))));
    }

    #[test]
    fn writer_may_not_depend_on_implementation() {
        let conn = db::open_memory().unwrap();
        let b = batch(
            &["T-1"],
            vec![
                candidate("setup", "backend", &[], &[]),
                candidate("tests", "testing", &["T-1"], &["setup"]),
            ],
        );
        assert!(matches!(decompose(&conn, &b), Err(EngineError::InvalidBatch(_))));
    }

    #[test]
    fn batch_cycle_is_reported_by_key() {
        let conn = db::open_memory().unwrap();
        let b = batch(
            &[],
            vec![
                candidate("a", "backend", &[], &["b"]),
                candidate("b", "backend", &[], &["a"]),
            ],
        );
        match decompose(&conn, &b) {
            Err(EngineError::DependencyCycle { chain }) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(store::snapshot(&conn).unwrap().is_empty());
    }

    #[test]
    fn unknown_key_and_duplicate_key_rejected() {
        let conn = db::open_memory().unwrap();
        let b = batch(&[], vec![candidate("a", "backend", &[], &["ghost"])]);
        assert!(matches!(decompose(&conn, &b), Err(EngineError::InvalidBatch(_))));
        let b = batch(
            &[],
            vec![candidate("a", "backend", &[], &[]), candidate("a", "frontend", &[], &[])],
        );
        assert!(matches!(decompose(&conn, &b), Err(EngineError::InvalidBatch(_))));
    }

    #[test]
    fn batch_parses_from_json() {
        let b: SpecBatch = serde_json::from_str(
            r#"{
                "test_ids": ["T-1"],
                "items": [
                    {"key": "t", "title": "Write login tests", "category": "testing", "tests": ["T-1"]},
                    {"key": "i", "title": "Implement login", "category": "backend",
                     "complexity": "complex", "tests": ["T-1"], "depends_on": []}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(b.items[1].complexity, Complexity::Complex);
        assert!(check_coverage(&b).is_ok());
    }

    #[test]
    fn tokens_and_similarity() {
        let a = summary_tokens("Login fails: 500 on /api/login!");
        assert!(a.contains("login"));
        assert!(a.contains("500"));
        assert!(!a.contains("on"));
        let b = summary_tokens("login fails with 500");
        assert!(similarity(&a, &b) >= DUPLICATE_THRESHOLD);
        assert_eq!(similarity(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn duplicate_issue_is_folded_and_escalated() {
        let conn = db::open_memory().unwrap();
        let first = submit_issue(&conn, &NewItem::issue("Login page returns 500", "backend", Priority::Low))
            .unwrap();
        let IssueOutcome::Created(id) = first else {
            panic!("expected a new issue");
        };

        let second =
            submit_issue(&conn, &NewItem::issue("login page returns 500 error", "backend", Priority::High))
                .unwrap();
        assert_eq!(second, IssueOutcome::Folded(id.clone()));

        let item = store::get(&conn, &id).unwrap();
        assert_eq!(item.priority, Priority::High);
        let notes = store::list_notes(&conn, &id).unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].content.contains("500 error"));
        assert_eq!(store::snapshot(&conn).unwrap().len(), 1);
    }

    #[test]
    fn folded_report_keeps_its_complexity_in_the_note() {
        let conn = db::open_memory().unwrap();
        let first = submit_issue(&conn, &NewItem::issue("session token expires early", "auth", Priority::Low))
            .unwrap();
        let mut again = NewItem::issue("session token expires too early", "auth", Priority::Low);
        again.complexity = Complexity::Complex;
        let folded = submit_issue(&conn, &again).unwrap();
        assert_eq!(folded, IssueOutcome::Folded(first.id().to_string()));

        let notes = store::list_notes(&conn, first.id()).unwrap();
        assert!(notes[0].content.contains("complex complexity"), "{}", notes[0].content);
        assert_eq!(store::get(&conn, first.id()).unwrap().complexity, Complexity::Normal);
    }

    #[test]
    fn report_with_dependencies_is_never_folded() {
        let conn = db::open_memory().unwrap();
        let first = submit_issue(&conn, &NewItem::issue("session token expires early", "auth", Priority::Low))
            .unwrap();
        let migration = store::put(&conn, &NewItem::task("migrate session table", "auth")).unwrap();
        let mut again = NewItem::issue("session token expires too early", "auth", Priority::Low);
        again.dependencies = vec![migration.clone()];

        let outcome = submit_issue(&conn, &again).unwrap();
        let IssueOutcome::Created(id) = outcome else {
            panic!("expected a new issue, got {outcome:?}");
        };
        assert_ne!(id, first.id());
        assert_eq!(store::get(&conn, &id).unwrap().dependencies, vec![migration]);
        assert!(store::list_notes(&conn, first.id()).unwrap().is_empty());
    }

    #[test]
    fn folding_never_lowers_priority() {
        let conn = db::open_memory().unwrap();
        let id = submit_issue(&conn, &NewItem::issue("cache eviction broken", "storage", Priority::Critical))
            .unwrap();
        let folded =
            submit_issue(&conn, &NewItem::issue("cache eviction broken again", "storage", Priority::Low))
                .unwrap();
        assert_eq!(folded.id(), id.id());
        assert_eq!(store::get(&conn, id.id()).unwrap().priority, Priority::Critical);
    }

    #[test]
    fn different_category_or_claimed_issue_is_not_folded() {
        let conn = db::open_memory().unwrap();
        let a = submit_issue(&conn, &NewItem::issue("Login page returns 500", "backend", Priority::Low))
            .unwrap();
        let b = submit_issue(&conn, &NewItem::issue("Login page returns 500", "frontend", Priority::Low))
            .unwrap();
        assert!(matches!(b, IssueOutcome::Created(_)));

        store::claim(&conn, a.id(), "w").unwrap();
        let c = submit_issue(&conn, &NewItem::issue("Login page returns 500", "backend", Priority::Low))
            .unwrap();
        assert!(matches!(c, IssueOutcome::Created(_)));
        assert_ne!(c.id(), a.id());
    }

    #[test]
    fn tasks_are_not_fold_targets() {
        let conn = db::open_memory().unwrap();
        store::put(&conn, &NewItem::task("Login page returns 500", "backend")).unwrap();
        let outcome = submit_issue(&conn, &NewItem::issue("Login page returns 500", "backend", Priority::Low))
            .unwrap();
        assert!(matches!(outcome, IssueOutcome::Created(_)));
    }
}
