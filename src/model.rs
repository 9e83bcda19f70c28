use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Category label with scheduling semantics; every other label is opaque.
pub const TESTING_CATEGORY: &str = "testing";

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Closed string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => {
                        let allowed: Vec<&str> = $name::ALL.iter().map(|v| v.as_str()).collect();
                        Err(EngineError::InvalidValue(format!(
                            "unknown {} '{s}': must be one of {}",
                            stringify!($name).to_lowercase(),
                            allowed.join(", ")
                        )))
                    }
                }
            }
        }
    };
}

string_enum!(Status {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Halted => "halted",
});

string_enum!(Kind {
    Task => "task",
    Issue => "issue",
});

string_enum!(Complexity {
    Easy => "easy",
    Normal => "normal",
    Complex => "complex",
});

string_enum!(
    /// Declared most-urgent first.
    Priority {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
    }
);

string_enum!(TestMode {
    Write => "write",
    Verify => "verify",
});

string_enum!(Tier {
    Tier1 => "tier1",
    Tier2 => "tier2",
    Tier3 => "tier3",
});

string_enum!(RootCause {
    ImplementationBug => "implementation_bug",
    TestDefect => "test_defect",
    MissingDependency => "missing_dependency",
    ConfigurationError => "configuration_error",
    ArchitectureConflict => "architecture_conflict",
    ScopeTooLarge => "scope_too_large",
    MissingPrerequisite => "missing_prerequisite",
});

impl Status {
    /// Terminal states are never re-dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Halted)
    }

    /// The lifecycle graph. Every status write goes through this check.
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::{Completed, Failed, Halted, InProgress, Pending};
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Failed, Halted)
        )
    }

    /// Display icon: x=completed, *=in progress, !=failed, #=halted, .=pending
    pub fn icon(&self) -> &'static str {
        match self {
            Status::Completed => "x",
            Status::InProgress => "*",
            Status::Failed => "!",
            Status::Halted => "#",
            Status::Pending => ".",
        }
    }
}

impl Priority {
    /// Higher is more urgent.
    pub fn urgency(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    pub fn most_urgent(self, other: Priority) -> Priority {
        if other.urgency() > self.urgency() {
            other
        } else {
            self
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Normal
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Task
    }
}

impl Tier {
    /// The next more capable tier, if any.
    pub fn escalate(&self) -> Option<Tier> {
        match self {
            Tier::Tier1 => Some(Tier::Tier2),
            Tier::Tier2 => Some(Tier::Tier3),
            Tier::Tier3 => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
        }
    }

    pub fn max(self, other: Tier) -> Tier {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Tier1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    /// Creation order.
    pub seq: i64,
    pub id: String,
    pub kind: Kind,
    pub title: String,
    pub objective: String,
    pub acceptance: Vec<String>,
    pub status: Status,
    pub category: String,
    pub complexity: Complexity,
    pub priority: Priority,
    pub mode: Option<TestMode>,
    pub dependencies: Vec<String>,
    pub tests: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failure_signature: Option<String>,
    pub previous_signatures: Vec<String>,
    pub signature_repeat_count: u32,
    pub tier_floor: Tier,
    pub halted: bool,
    pub claimed_by: Option<String>,
    pub status_changed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkItem {
    pub fn is_testing(&self) -> bool {
        self.category == TESTING_CATEGORY
    }

    /// Test-authoring items are scheduled ahead of the code they gate.
    pub fn is_test_writer(&self) -> bool {
        self.is_testing() && self.mode == Some(TestMode::Write)
    }
}

/// Everything needed to create a work item. The store assigns id and
/// bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    #[serde(default)]
    pub kind: Kind,
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
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewItem {
    pub fn task(title: &str, category: &str) -> Self {
        NewItem {
            kind: Kind::Task,
            title: title.to_string(),
            objective: String::new(),
            acceptance: Vec::new(),
            category: category.to_string(),
            complexity: Complexity::Normal,
            priority: Priority::Medium,
            mode: None,
            dependencies: Vec::new(),
            tests: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn issue(title: &str, category: &str, priority: Priority) -> Self {
        NewItem {
            kind: Kind::Issue,
            priority,
            ..NewItem::task(title, category)
        }
    }
}

/// The four canonical fields of a failure. Free-text logs have no place here:
/// anything incidental would destabilise the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub root_cause: RootCause,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub failing_test: String,
    #[serde(default)]
    pub artifact_path: String,
}

impl FailureReport {
    pub fn new(root_cause: RootCause, error_message: &str, failing_test: &str, artifact_path: &str) -> Self {
        FailureReport {
            root_cause,
            error_message: error_message.to_string(),
            failing_test: failing_test.to_string(),
            artifact_path: artifact_path.to_string(),
        }
    }

    /// Report used when an executor overran its tier budget.
    pub fn timeout(secs: u64) -> Self {
        FailureReport::new(
            RootCause::ConfigurationError,
            &format!("timeout after {secs}s"),
            "",
            "",
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: i64,
    pub item: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub item: String,
    pub kind: String,
    pub detail: String,
    pub created_at: String,
}

/// Manual-intervention record for a halted item. Never scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub item: String,
    pub signature: String,
    pub root_cause: RootCause,
    pub error_message: String,
    pub evidence: Vec<String>,
    pub suggested_remediation: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), *status);
        }
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in Status::ALL {
            assert!(!Status::Completed.can_transition_to(*to));
            assert!(!Status::Halted.can_transition_to(*to));
        }
    }

    #[test]
    fn lifecycle_edges() {
        assert!(Status::Pending.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Pending));
        assert!(Status::Failed.can_transition_to(Status::Halted));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Failed.can_transition_to(Status::Completed));
        assert!(!Status::Pending.can_transition_to(Status::Halted));
    }

    #[test]
    fn priority_urgency_order() {
        assert!(Priority::Critical.urgency() > Priority::High.urgency());
        assert!(Priority::High.urgency() > Priority::Medium.urgency());
        assert!(Priority::Medium.urgency() > Priority::Low.urgency());
        assert_eq!(Priority::Low.most_urgent(Priority::High), Priority::High);
        assert_eq!(Priority::Critical.most_urgent(Priority::Low), Priority::Critical);
    }

    #[test]
    fn tier_escalation_stops_at_top() {
        assert_eq!(Tier::Tier1.escalate(), Some(Tier::Tier2));
        assert_eq!(Tier::Tier2.escalate(), Some(Tier::Tier3));
        assert_eq!(Tier::Tier3.escalate(), None);
        assert_eq!(Tier::Tier3.max(Tier::Tier1), Tier::Tier3);
    }

    #[test]
    fn invalid_value_lists_choices() {
        let err = "urgent".parse::<Priority>().unwrap_err();
        assert!(err.to_string().contains("critical, high, medium, low"), "{err}");
    }

    #[test]
    fn new_item_deserializes_with_defaults() {
        let item: NewItem =
            serde_json::from_str(r#"{"title": "Add login", "category": "backend"}"#).unwrap();
        assert_eq!(item.kind, Kind::Task);
        assert_eq!(item.complexity, Complexity::Normal);
        assert_eq!(item.priority, Priority::Medium);
        assert_eq!(item.max_retries, DEFAULT_MAX_RETRIES);
        assert!(item.mode.is_none());
    }
}
