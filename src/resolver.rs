//! Dependency resolution over a store snapshot.
//!
//! Pure functions: nothing here touches the database. An item is ready when
//! it is `pending`, every explicit dependency is `completed`, and (for
//! implementation items) every test-writing item covering one of its test ids
//! is `completed` too.
//!
//! Cycles are checked over that effective graph. A cycle that slipped into the
//! store only takes its members and their dependents out of the ready set;
//! everything else keeps flowing.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Status, WorkItem};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// `(id, effective dependencies)` for every item, in snapshot order.
fn effective_graph(items: &[WorkItem]) -> Vec<(&str, Vec<String>)> {
    let writers = coverage_writers(items);
    items
        .iter()
        .map(|i| (i.id.as_str(), effective_with(i, &writers)))
        .collect()
}

/// Find a dependency cycle, if any, as an id chain whose first and last
/// entries are the same item. Implicit coverage edges count; dependencies on
/// unknown ids are ignored.
pub fn detect_cycle(items: &[WorkItem]) -> Option<Vec<String>> {
    let effective = effective_graph(items);
    let graph: Vec<(&str, Vec<&str>)> = effective
        .iter()
        .map(|(id, deps)| (*id, deps.iter().map(String::as_str).collect()))
        .collect();
    find_cycle(&graph)
}

/// Shortest chain `from -> ... -> to` along effective dependencies.
/// `from == to` yields the one-element chain.
pub fn dependency_path(items: &[WorkItem], from: &str, to: &str) -> Option<Vec<String>> {
    let effective = effective_graph(items);
    let deps_of: HashMap<&str, &Vec<String>> = effective.iter().map(|(id, d)| (*id, d)).collect();

    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::from([from]);
    let mut seen: HashSet<&str> = HashSet::from([from]);
    while let Some(node) = queue.pop_front() {
        if node == to {
            let mut chain = vec![node.to_string()];
            let mut cur = node;
            while let Some(&prev) = parent.get(cur) {
                chain.push(prev.to_string());
                cur = prev;
            }
            chain.reverse();
            return Some(chain);
        }
        for dep in deps_of.get(node).into_iter().flat_map(|d| d.iter()) {
            if seen.insert(dep.as_str()) {
                parent.insert(dep.as_str(), node);
                queue.push_back(dep.as_str());
            }
        }
    }
    None
}

/// Items on a cycle plus everything that transitively depends on one. These
/// can never run, so they are kept out of the ready set.
pub fn cycle_blocked(items: &[WorkItem]) -> HashSet<String> {
    let effective = effective_graph(items);
    let known: HashSet<&str> = effective.iter().map(|(id, _)| *id).collect();

    // Peel off items whose known dependencies are all peeled; whatever is
    // left sits on or behind a cycle.
    let mut open: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, deps) in &effective {
        let id: &str = id;
        let deps: HashSet<&str> = deps
            .iter()
            .map(String::as_str)
            .filter(|d| known.contains(d))
            .collect();
        open.insert(id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }
    let mut queue: VecDeque<&str> = open.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
    while let Some(id) = queue.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(n) = open.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }
    open.into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(id, _)| id.to_string())
        .collect()
}

/// Cycle search over a plain adjacency list of `(node, dependencies)`.
/// Roots are visited in list order, so the reported chain is deterministic.
pub fn find_cycle(graph: &[(&str, Vec<&str>)]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &Vec<&str>> = graph.iter().map(|(id, deps)| (*id, deps)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for &(root, _) in graph {
        if marks.contains_key(root) {
            continue;
        }
        // Explicit stack of (node, next dependency index); `path` mirrors the
        // grey nodes so a back edge can be turned into a chain.
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        let mut path: Vec<&str> = vec![root];
        marks.insert(root, Mark::Visiting);

        while let Some((node, idx)) = stack.pop() {
            let deps = by_id[node];
            if idx >= deps.len() {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            }
            stack.push((node, idx + 1));
            let dep = deps[idx];
            if !by_id.contains_key(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut chain: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    chain.push(dep.to_string());
                    return Some(chain);
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(dep, Mark::Visiting);
                    path.push(dep);
                    stack.push((dep, 0));
                }
            }
        }
    }
    None
}

/// test id -> test-writing items that cover it.
fn coverage_writers(items: &[WorkItem]) -> HashMap<&str, Vec<&str>> {
    let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
    for item in items.iter().filter(|i| i.is_test_writer()) {
        for test_id in &item.tests {
            map.entry(test_id.as_str()).or_default().push(item.id.as_str());
        }
    }
    map
}

/// Explicit dependencies plus the implicit ones an implementation item has on
/// the test writers covering its tests.
pub fn effective_dependencies(item: &WorkItem, items: &[WorkItem]) -> Vec<String> {
    let writers = coverage_writers(items);
    effective_with(item, &writers)
}

fn effective_with(item: &WorkItem, writers: &HashMap<&str, Vec<&str>>) -> Vec<String> {
    let mut deps: Vec<String> = item.dependencies.clone();
    if !item.is_testing() {
        for test_id in &item.tests {
            for writer in writers.get(test_id.as_str()).into_iter().flatten() {
                if *writer != item.id && !deps.iter().any(|d| d == writer) {
                    deps.push(writer.to_string());
                }
            }
        }
    }
    deps
}

/// Sort key: test writers first, then urgency, then creation order.
fn rank(item: &WorkItem) -> (u8, Reverse<u8>, i64) {
    let class = if item.is_test_writer() { 0 } else { 1 };
    (class, Reverse(item.priority.urgency()), item.seq)
}

fn ready_from(
    items: &[WorkItem],
    status_of: &HashMap<&str, Status>,
    blocked: &HashSet<String>,
) -> Vec<String> {
    let writers = coverage_writers(items);
    let mut ready: Vec<&WorkItem> = items
        .iter()
        .filter(|i| status_of.get(i.id.as_str()) == Some(&Status::Pending) && !i.halted)
        .filter(|i| !blocked.contains(&i.id))
        .filter(|i| {
            effective_with(i, &writers)
                .iter()
                .all(|dep| status_of.get(dep.as_str()) == Some(&Status::Completed))
        })
        .collect();
    ready.sort_by_key(|i| rank(i));
    ready.into_iter().map(|i| i.id.clone()).collect()
}

/// Ids eligible for dispatch, best first. Deterministic for a given snapshot.
pub fn ready_items(items: &[WorkItem]) -> Vec<String> {
    let status_of: HashMap<&str, Status> = items.iter().map(|i| (i.id.as_str(), i.status)).collect();
    ready_from(items, &status_of, &cycle_blocked(items))
}

/// The order a single serial worker would dispatch the pending backlog in,
/// assuming every dispatch succeeds. Items that can never become ready
/// (blocked behind halted, failed, missing or cyclic dependencies) are left
/// out.
pub fn schedule_order(items: &[WorkItem]) -> Vec<String> {
    let blocked = cycle_blocked(items);
    let mut status_of: HashMap<&str, Status> = items
        .iter()
        .map(|i| {
            let status = match i.status {
                Status::InProgress => Status::Completed,
                other => other,
            };
            (i.id.as_str(), status)
        })
        .collect();

    let mut order = Vec::new();
    let mut seen = HashSet::new();
    loop {
        let ready = ready_from(items, &status_of, &blocked);
        let Some(next) = ready.into_iter().find(|id| !seen.contains(id)) else {
            break;
        };
        seen.insert(next.clone());
        if let Some(item) = items.iter().find(|i| i.id == next) {
            status_of.insert(item.id.as_str(), Status::Completed);
        }
        order.push(next);
    }
    order
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Complexity, Kind, Priority, TestMode, Tier, TESTING_CATEGORY};

    pub(crate) fn item(id: &str, seq: i64, deps: &[&str]) -> WorkItem {
        WorkItem {
            seq,
            id: id.to_string(),
            kind: Kind::Task,
            title: id.to_string(),
            objective: String::new(),
            acceptance: Vec::new(),
            status: Status::Pending,
            category: "backend".to_string(),
            complexity: Complexity::Normal,
            priority: Priority::Medium,
            mode: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            tests: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            failure_signature: None,
            previous_signatures: Vec::new(),
            signature_repeat_count: 0,
            tier_floor: Tier::Tier1,
            halted: false,
            claimed_by: None,
            status_changed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn writer(id: &str, seq: i64, tests: &[&str]) -> WorkItem {
        let mut i = item(id, seq, &[]);
        i.category = TESTING_CATEGORY.to_string();
        i.mode = Some(TestMode::Write);
        i.tests = tests.iter().map(|t| t.to_string()).collect();
        i
    }

    fn with_status(mut i: WorkItem, status: Status) -> WorkItem {
        i.status = status;
        i.halted = status == Status::Halted;
        i
    }

    #[test]
    fn empty_snapshot_has_nothing_ready() {
        assert!(ready_items(&[]).is_empty());
    }

    #[test]
    fn unmet_dependency_blocks() {
        let items = vec![item("a", 1, &[]), item("b", 2, &["a"])];
        assert_eq!(ready_items(&items), vec!["a"]);
    }

    #[test]
    fn completed_dependency_unblocks() {
        let items = vec![
            with_status(item("a", 1, &[]), Status::Completed),
            item("b", 2, &["a"]),
        ];
        assert_eq!(ready_items(&items), vec!["b"]);
    }

    #[test]
    fn in_progress_and_failed_dependencies_block() {
        let items = vec![
            with_status(item("a", 1, &[]), Status::InProgress),
            with_status(item("b", 2, &[]), Status::Failed),
            item("c", 3, &["a"]),
            item("d", 4, &["b"]),
        ];
        assert!(ready_items(&items).is_empty());
    }

    #[test]
    fn missing_dependency_is_unmet() {
        let items = vec![item("b", 2, &["ghost"])];
        assert!(ready_items(&items).is_empty());
    }

    #[test]
    fn priority_then_creation_order() {
        let mut low = item("low", 1, &[]);
        low.priority = Priority::Low;
        let mut crit = item("crit", 4, &[]);
        crit.priority = Priority::Critical;
        let med_early = item("med-early", 2, &[]);
        let med_late = item("med-late", 3, &[]);
        let items = vec![low, med_late, crit, med_early];
        assert_eq!(
            ready_items(&items),
            vec!["crit", "med-early", "med-late", "low"]
        );
    }

    #[test]
    fn test_writers_rank_first() {
        let mut urgent_impl = item("impl", 1, &[]);
        urgent_impl.priority = Priority::Critical;
        let mut tests = writer("tests", 2, &["T-9"]);
        tests.priority = Priority::Low;
        let items = vec![urgent_impl, tests];
        assert_eq!(ready_items(&items), vec!["tests", "impl"]);
    }

    #[test]
    fn implicit_coverage_dependency_blocks_implementation() {
        let mut imp = item("impl", 1, &[]);
        imp.tests = vec!["T-1".into()];
        let items = vec![imp.clone(), writer("tests", 2, &["T-1"])];
        assert_eq!(ready_items(&items), vec!["tests"]);
        assert_eq!(effective_dependencies(&imp, &items), vec!["tests"]);

        let items = vec![imp, with_status(writer("tests", 2, &["T-1"]), Status::Completed)];
        assert_eq!(ready_items(&items), vec!["impl"]);
    }

    #[test]
    fn halted_items_never_ready() {
        let items = vec![with_status(item("a", 1, &[]), Status::Halted), item("b", 2, &["a"])];
        assert!(ready_items(&items).is_empty());
    }

    #[test]
    fn cycle_reported_with_chain() {
        let items = vec![
            item("a", 1, &["b"]),
            item("b", 2, &["c"]),
            item("c", 3, &["a"]),
            item("d", 4, &[]),
        ];
        assert_eq!(detect_cycle(&items).unwrap(), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn cycle_only_blocks_its_members_and_dependents() {
        let items = vec![
            item("a", 1, &["b"]),
            item("b", 2, &["a"]),
            item("behind", 3, &["a"]),
            item("free", 4, &[]),
            item("after-free", 5, &["free"]),
        ];
        let blocked = cycle_blocked(&items);
        let mut blocked: Vec<&str> = blocked.iter().map(String::as_str).collect();
        blocked.sort();
        assert_eq!(blocked, vec!["a", "b", "behind"]);
        assert_eq!(ready_items(&items), vec!["free"]);
        assert_eq!(schedule_order(&items), vec!["free", "after-free"]);
    }

    #[test]
    fn coverage_edges_close_cycles() {
        // impl waits on the writer covering T-1; the writer explicitly
        // waits on impl.
        let mut imp = item("impl", 1, &[]);
        imp.tests = vec!["T-1".into()];
        let mut tests = writer("tests", 2, &["T-1"]);
        tests.dependencies = vec!["impl".into()];
        let items = vec![imp, tests, item("other", 3, &[])];

        let chain = detect_cycle(&items).unwrap();
        assert_eq!(chain.first(), chain.last());
        assert!(chain.contains(&"impl".to_string()) && chain.contains(&"tests".to_string()));
        assert_eq!(ready_items(&items), vec!["other"]);
    }

    #[test]
    fn dependency_path_follows_coverage_edges() {
        let mut imp = item("impl", 1, &[]);
        imp.tests = vec!["T-1".into()];
        let verify = item("verify", 2, &["impl"]);
        let items = vec![imp, verify, writer("tests", 3, &["T-1"])];
        assert_eq!(
            dependency_path(&items, "verify", "tests").unwrap(),
            vec!["verify", "impl", "tests"]
        );
        assert!(dependency_path(&items, "tests", "verify").is_none());
        assert_eq!(dependency_path(&items, "impl", "impl").unwrap(), vec!["impl"]);
    }

    #[test]
    fn diamond_is_acyclic() {
        let items = vec![
            item("a", 1, &["b", "c"]),
            item("b", 2, &["d"]),
            item("c", 3, &["d"]),
            item("d", 4, &[]),
        ];
        assert!(detect_cycle(&items).is_none());
    }

    #[test]
    fn schedule_order_respects_dependencies() {
        let items = vec![
            item("a", 1, &["c"]),
            item("b", 2, &[]),
            item("c", 3, &["b"]),
            with_status(item("x", 4, &[]), Status::Halted),
            item("y", 5, &["x"]),
        ];
        assert_eq!(schedule_order(&items), vec!["b", "c", "a"]);
    }

    #[test]
    fn schedule_is_deterministic() {
        let items: Vec<WorkItem> = (0..20)
            .map(|n| {
                let deps: Vec<String> = if n > 2 { vec![format!("i{}", n / 2)] } else { vec![] };
                let mut i = item(&format!("i{n}"), n, &[]);
                i.dependencies = deps;
                i
            })
            .collect();
        assert_eq!(schedule_order(&items), schedule_order(&items));
    }
}
