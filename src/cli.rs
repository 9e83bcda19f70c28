use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "workq", about = "Dependency-aware work queue for AI coding agents")]
pub struct Cli {
    /// Path to the SQLite database [default: ~/.workq/workq.db]
    #[arg(long, env = "WORKQ_DB", global = true)]
    pub db: Option<String>,

    /// Append logs to ~/.workq/workq.log instead of stderr
    #[arg(long, global = true)]
    pub log_file: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create database and tables (idempotent)
    Init,

    /// Accept a batch of candidate tasks from a JSON file ("-" for stdin)
    Intake {
        /// Path to the batch file
        file: String,
        /// Output accepted ids as JSON
        #[arg(long)]
        json: bool,
    },

    /// Report an issue, folding it into a similar pending one if present
    Issue {
        /// One-line summary
        title: String,
        /// Category label
        #[arg(short, long)]
        category: String,
        /// Priority (critical, high, medium, low)
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Longer description
        #[arg(short, long, default_value = "")]
        objective: String,
        /// Complexity (easy, normal, complex)
        #[arg(long, default_value = "normal")]
        complexity: String,
        /// Output the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Claim the next ready item
    Next {
        /// Claimer name recorded on the item
        #[arg(short, long, default_value = "cli")]
        worker: String,
        /// Output the claimed item as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark a claimed item as completed
    Complete {
        /// Item id
        id: String,
        /// Only complete while this claimer still holds the item
        #[arg(short, long)]
        worker: Option<String>,
    },

    /// Report a failure for a claimed item and apply recovery
    Fail {
        /// Item id
        id: String,
        /// Root cause classification
        #[arg(short, long)]
        root_cause: String,
        /// Normalized error message
        #[arg(short, long, default_value = "")]
        message: String,
        /// Failing test identifier
        #[arg(short, long, default_value = "")]
        test: String,
        /// Artifact path involved in the failure
        #[arg(short, long, default_value = "")]
        artifact: String,
        /// Only record while this claimer still holds the item
        #[arg(short, long)]
        worker: Option<String>,
        /// Output the updated item as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return an in-flight item to the queue without charging a retry
    Cancel {
        /// Item id
        id: String,
        /// Reason recorded in the item's event history
        #[arg(short, long, default_value = "cancelled")]
        reason: String,
    },

    /// Show item details
    Show {
        /// Item id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List items
    List {
        /// Filter by status (pending, in_progress, completed, failed, halted)
        #[arg(short, long)]
        status: Option<String>,
        /// Only items the scheduler would hand out, in dispatch order
        #[arg(long, conflicts_with = "status")]
        ready: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Counts per status, the ready set, and halted items needing attention
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a note to an item
    Note {
        /// Item id
        id: String,
        /// Note content
        content: String,
    },

    /// List notes for an item
    Notes {
        /// Item id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show an item's event history
    Events {
        /// Item id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or edit an item's dependencies
    Deps {
        /// Item id
        id: String,
        /// Add a dependency on this item
        #[arg(long, conflicts_with = "remove")]
        add: Option<String>,
        /// Remove a dependency on this item
        #[arg(long)]
        remove: Option<String>,
    },

    /// Dispatch ready items to the configured executor
    Run {
        /// Concurrent workers [default: from config]
        #[arg(short, long)]
        workers: Option<usize>,
        /// Exit once nothing is ready and nothing is in flight
        #[arg(long)]
        until_idle: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Block until an item reaches a terminal outcome
    Wait {
        /// Item id
        id: String,
        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Output the marker as JSON
        #[arg(long)]
        json: bool,
    },
}
