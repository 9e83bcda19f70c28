mod cli;

use std::fs::OpenOptions;
use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use rusqlite::Connection;

use cli::{Cli, Command};
use workq::config::Config;
use workq::engine::{Engine, EngineOptions};
use workq::intake::{self, IssueOutcome, SpecBatch};
use workq::model::{FailureReport, NewItem, Status};
use workq::recovery::{self, RecoveryDecision};
use workq::{db, marker, output, paths, resolver, scheduler, store, watch};

fn resolve_db_path(cli_db: Option<String>) -> String {
    cli_db.unwrap_or_else(paths::db_path)
}

fn ensure_db_dir(db_path: &str) -> Result<()> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn open_db(db_path: &str) -> Result<Connection> {
    Ok(db::open_initialized(db_path)?)
}

/// `RUST_LOG` wins; otherwise `run` logs at info and one-shot commands
/// only surface warnings.
fn setup_logging(to_file: bool, default_level: log::LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level).format_timestamp_secs();
    builder.parse_default_env();

    if to_file {
        let dir = paths::state_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::log_path())
            .context("failed to open log file")?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read {file}"))
}

fn write_marker(id: &str, status: Status) -> Result<()> {
    marker::write_once(&paths::marker_dir(), id, status)
        .with_context(|| format!("failed to write completion marker for {id}"))?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Command::Run { .. } => log::LevelFilter::Info,
        _ => log::LevelFilter::Warn,
    };
    setup_logging(cli.log_file, default_level)?;

    let db_path = resolve_db_path(cli.db);
    ensure_db_dir(&db_path)?;

    match cli.command {
        Command::Init => {
            open_db(&db_path)?;
            eprintln!("Initialized {db_path}");
        }

        Command::Intake { file, json } => {
            let config = Config::load()?;
            let mut batch: SpecBatch = serde_json::from_str(&read_input(&file)?)
                .with_context(|| format!("failed to parse batch {file}"))?;
            for candidate in &mut batch.items {
                candidate.max_retries.get_or_insert(config.max_retries());
            }
            let conn = open_db(&db_path)?;
            let accepted = intake::decompose(&conn, &batch)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&accepted)?);
            } else {
                for a in &accepted {
                    println!("{}\t{}", a.id, a.key);
                }
                eprintln!("Accepted {} items", accepted.len());
            }
        }

        Command::Issue {
            title,
            category,
            priority,
            objective,
            complexity,
            json,
        } => {
            let config = Config::load()?;
            let mut issue = NewItem::issue(&title, &category, priority.parse()?);
            issue.objective = objective;
            issue.complexity = complexity.parse()?;
            issue.max_retries = config.max_retries();
            let conn = open_db(&db_path)?;
            let outcome = intake::submit_issue(&conn, &issue)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.id());
                match &outcome {
                    IssueOutcome::Created(id) => eprintln!("Created issue '{id}'"),
                    IssueOutcome::Folded(id) => eprintln!("Folded into existing issue '{id}'"),
                }
            }
        }

        Command::Next { worker, json } => {
            let conn = open_db(&db_path)?;
            match scheduler::next(&conn, &worker)? {
                Some(item) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&item)?);
                    } else {
                        println!("{}", item.id);
                    }
                    eprintln!("Claimed '{}' for '{worker}'", item.id);
                }
                None => {
                    eprintln!("No items ready");
                    std::process::exit(1);
                }
            }
        }

        Command::Complete { id, worker } => {
            let conn = open_db(&db_path)?;
            store::complete(&conn, &id, worker.as_deref())?;
            write_marker(&id, Status::Completed)?;
            eprintln!("Completed '{id}'");
        }

        Command::Fail {
            id,
            root_cause,
            message,
            test,
            artifact,
            worker,
            json,
        } => {
            let config = Config::load()?;
            let report = FailureReport::new(root_cause.parse()?, &message, &test, &artifact);
            let conn = open_db(&db_path)?;
            let decision = recovery::record_failure(
                &conn,
                &id,
                worker.as_deref(),
                &report,
                &config.recovery_policy(),
            )?;
            if decision.is_halt() {
                write_marker(&id, Status::Halted)?;
            }
            if json {
                let item = store::get(&conn, &id)?;
                println!("{}", serde_json::to_string_pretty(&item)?);
            }
            match &decision {
                RecoveryDecision::Retry {
                    retry_count,
                    tier_floor,
                    ..
                } => eprintln!(
                    "Re-armed '{id}' (retry {retry_count}, signature {}, {tier_floor})",
                    decision.state().signature
                ),
                RecoveryDecision::Halt { intervention, .. } => {
                    eprint!("Halted '{id}'\n{}", output::format_intervention(intervention))
                }
            }
        }

        Command::Cancel { id, reason } => {
            let conn = open_db(&db_path)?;
            store::cancel(&conn, &id, &reason)?;
            eprintln!("Cancelled '{id}'");
        }

        Command::Show { id, json } => {
            let conn = open_db(&db_path)?;
            let item = store::get(&conn, &id)?;
            let notes = store::list_notes(&conn, &id)?;
            let blockers = store::unmet_dependencies(&conn, &id)?;
            let dependents = store::dependents_of(&conn, &id)?;
            let intervention = store::get_intervention(&conn, &id)?;
            if json {
                let detail = output::ItemDetail {
                    item: &item,
                    notes: &notes,
                    blocked_by: &blockers,
                    blocks: &dependents,
                    intervention: intervention.as_ref(),
                };
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print!(
                    "{}",
                    output::format_item_detail(&item, &notes, &blockers, &dependents, intervention.as_ref())
                );
            }
        }

        Command::List {
            status,
            ready,
            json,
        } => {
            let conn = open_db(&db_path)?;
            let items = if ready {
                scheduler::peek(&conn)?
            } else if let Some(status) = status {
                store::list_by_status(&conn, status.parse()?)?
            } else {
                store::snapshot(&conn)?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print!("{}", output::format_item_list(&items));
            }
        }

        Command::Status { json } => {
            let conn = open_db(&db_path)?;
            let counts = store::count_by_status(&conn)?;
            let ready = scheduler::peek(&conn)?;
            let interventions = store::list_interventions(&conn)?;
            if json {
                let counts: std::collections::BTreeMap<&str, usize> =
                    counts.iter().map(|(s, n)| (s.as_str(), *n)).collect();
                let report = serde_json::json!({
                    "counts": counts,
                    "ready": ready,
                    "needs_attention": interventions,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", output::format_status_report(&counts, &ready, &interventions));
            }
        }

        Command::Note { id, content } => {
            let conn = open_db(&db_path)?;
            store::add_note(&conn, &id, &content)?;
            eprintln!("Added note to '{id}'");
        }

        Command::Notes { id, json } => {
            let conn = open_db(&db_path)?;
            let notes = store::list_notes(&conn, &id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&notes)?);
            } else {
                print!("{}", output::format_notes(&notes));
            }
        }

        Command::Events { id, json } => {
            let conn = open_db(&db_path)?;
            let events = store::events_for(&conn, &id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                print!("{}", output::format_events(&events));
            }
        }

        Command::Deps { id, add, remove } => {
            let conn = open_db(&db_path)?;
            if let Some(dep) = add {
                store::add_dependency(&conn, &id, &dep)?;
                eprintln!("'{id}' now depends on '{dep}'");
            } else if let Some(dep) = remove {
                store::remove_dependency(&conn, &id, &dep)?;
                eprintln!("'{id}' no longer depends on '{dep}'");
            } else {
                let items = store::snapshot(&conn)?;
                if !items.iter().any(|i| i.id == id) {
                    bail!("item not found: {id}");
                }
                if let Some(chain) = resolver::detect_cycle(&items) {
                    bail!("dependency cycle: {}", chain.join(" -> "));
                }
                print!("{}", output::format_dependency_tree(&id, &items));
            }
        }

        Command::Run {
            workers,
            until_idle,
            json,
        } => {
            let config = Config::load()?;
            let Some(executor) = config.command_executor() else {
                bail!(
                    "no executor configured: set [executor] command in {}",
                    paths::config_path().display()
                );
            };
            open_db(&db_path)?;

            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            ctrlc::set_handler(move || {
                r.store(false, Ordering::SeqCst);
            })
            .context("failed to set signal handler")?;

            let options = EngineOptions {
                exit_when_idle: until_idle,
                ..EngineOptions::from_config(&config)
            };
            let workers = workers.unwrap_or_else(|| config.workers());
            info!("Starting (workers={workers}, db={db_path})");
            let engine = Engine::new(&db_path, executor, options, running);
            let summary = engine.run_workers(workers)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                eprintln!(
                    "Completed {}, retried {}, halted {}, cancelled {}",
                    summary.completed, summary.retried, summary.halted, summary.cancelled
                );
            }
        }

        Command::Wait { id, timeout, json } => {
            let conn = open_db(&db_path)?;
            // Fails fast on unknown ids instead of waiting forever.
            let item = store::get(&conn, &id)?;
            drop(conn);
            if item.status.is_terminal() && marker::read(&paths::marker_dir(), &id)?.is_none() {
                // Finished without a marker (markers disabled or removed).
                println!("{} {}", item.id, item.status);
                return Ok(());
            }
            let found =
                watch::wait_for_marker(&paths::marker_dir(), &id, timeout.map(Duration::from_secs))?;
            match found {
                Some(m) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&m)?);
                    } else {
                        println!("{} {}", m.id, m.status);
                    }
                }
                None => {
                    eprintln!("Timed out waiting for '{id}'");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
