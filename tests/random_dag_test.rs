use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;

use workq::error::EngineError;
use workq::model::{FailureReport, NewItem, Priority, RootCause, Status};
use workq::recovery::{self, RecoveryPolicy};
use workq::{db, resolver, scheduler, store};

/// Items where each one depends on a random subset of the items created
/// before it, so the graph is acyclic by construction.
fn random_dag(conn: &Connection, rng: &mut StdRng, size: usize) -> Vec<String> {
    let priorities = [Priority::Critical, Priority::High, Priority::Medium, Priority::Low];
    let mut ids: Vec<String> = Vec::new();
    for n in 0..size {
        let mut item = NewItem::task(&format!("node {n}"), "backend");
        item.priority = priorities[rng.random_range(0..priorities.len())];
        for earlier in &ids {
            if rng.random_bool(0.2) {
                item.dependencies.push(earlier.clone());
            }
        }
        ids.push(store::put(conn, &item).unwrap());
    }
    ids
}

fn assert_ready_respects_dependencies(conn: &Connection) -> Vec<String> {
    let items = store::snapshot(conn).unwrap();
    let status_of: HashMap<&str, Status> = items.iter().map(|i| (i.id.as_str(), i.status)).collect();
    let ready = resolver::ready_items(&items);
    for id in &ready {
        let item = items.iter().find(|i| &i.id == id).unwrap();
        assert_eq!(item.status, Status::Pending, "{id} is not pending");
        for dep in &item.dependencies {
            assert_eq!(
                status_of[dep.as_str()],
                Status::Completed,
                "{id} is ready but {dep} is not completed"
            );
        }
    }
    ready
}

#[test]
fn ready_set_never_includes_items_with_open_dependencies() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let conn = db::open_initialized(":memory:").unwrap();
        let ids = random_dag(&conn, &mut rng, 25);

        let mut dispatched = 0;
        while let Some(item) = scheduler::next(&conn, "worker").unwrap() {
            dispatched += 1;
            assert_ready_respects_dependencies(&conn);
            store::complete(&conn, &item.id, Some("worker")).unwrap();
            assert!(dispatched <= ids.len(), "seed {seed}: dispatched more than exist");
        }
        assert_eq!(dispatched, ids.len(), "seed {seed}: backlog did not drain");
        assert_eq!(
            store::list_by_status(&conn, Status::Completed).unwrap().len(),
            ids.len()
        );
    }
}

#[test]
fn halted_items_block_their_dependents_forever() {
    let policy = RecoveryPolicy::default();
    for seed in 100..106u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let conn = db::open_initialized(":memory:").unwrap();
        let ids = random_dag(&conn, &mut rng, 20);

        let mut steps = 0;
        while let Some(item) = scheduler::next(&conn, "worker").unwrap() {
            steps += 1;
            assert!(steps < 500, "seed {seed}: scheduler did not terminate");
            assert_ready_respects_dependencies(&conn);
            if rng.random_bool(0.3) {
                let report = FailureReport::new(RootCause::ImplementationBug, "boom", "", "");
                recovery::record_failure(&conn, &item.id, Some("worker"), &report, &policy).unwrap();
            } else {
                store::complete(&conn, &item.id, Some("worker")).unwrap();
            }
        }

        let items = store::snapshot(&conn).unwrap();
        let status_of: HashMap<&str, Status> =
            items.iter().map(|i| (i.id.as_str(), i.status)).collect();
        for item in &items {
            match item.status {
                Status::Completed | Status::Halted => {}
                Status::Pending => assert!(
                    item.dependencies
                        .iter()
                        .any(|d| status_of[d.as_str()] != Status::Completed),
                    "seed {seed}: {} was left pending with all dependencies done",
                    item.id
                ),
                other => panic!("seed {seed}: {} left {other}", item.id),
            }
        }
        assert_eq!(items.len(), ids.len());
    }
}

#[test]
fn back_edges_are_rejected_as_cycles() {
    let mut rng = StdRng::seed_from_u64(7);
    let conn = db::open_initialized(":memory:").unwrap();
    let ids = random_dag(&conn, &mut rng, 15);

    for _ in 0..20 {
        let item = store::get(&conn, &ids[rng.random_range(0..ids.len())]).unwrap();
        let Some(dep) = item.dependencies.first() else {
            continue;
        };
        // `item` depends on `dep`; the reverse edge would close a loop.
        let err = store::add_dependency(&conn, dep, &item.id).unwrap_err();
        match err {
            EngineError::DependencyCycle { chain } => {
                assert_eq!(chain.first(), chain.last());
                assert!(chain.contains(&item.id));
            }
            other => panic!("expected cycle, got {other}"),
        }
    }
    assert!(resolver::detect_cycle(&store::snapshot(&conn).unwrap()).is_none());
}

#[test]
fn schedule_order_is_a_topological_order() {
    for seed in 200..205u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let conn = db::open_initialized(":memory:").unwrap();
        random_dag(&conn, &mut rng, 30);
        let items = store::snapshot(&conn).unwrap();

        let order = resolver::schedule_order(&items);
        assert_eq!(order.len(), items.len());
        let pos: HashMap<&str, usize> = order.iter().enumerate().map(|(n, id)| (id.as_str(), n)).collect();
        for item in &items {
            for dep in &item.dependencies {
                assert!(pos[dep.as_str()] < pos[item.id.as_str()], "seed {seed}");
            }
        }
        // Same snapshot, same answer.
        assert_eq!(resolver::schedule_order(&items), order);
    }
}
