//! Failure recovery: signature bookkeeping and the retry / halt decision.
//!
//! [`on_failure`] is a pure function of the item and the report;
//! [`record_failure`] applies its decision to the store in one transaction.

use log::{info, warn};
use rusqlite::Connection;

use crate::db::write_txn;
use crate::error::{EngineError, Result};
use crate::model::{FailureReport, Intervention, Priority, RootCause, Status, Tier, WorkItem};
use crate::router;
use crate::signature::compute_signature;
use crate::store;

pub const DEFAULT_SIGNATURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Consecutive identical signatures that halt an item regardless of
    /// remaining retry budget.
    pub signature_threshold: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            signature_threshold: DEFAULT_SIGNATURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    RepeatedSignature,
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureState {
    pub signature: String,
    pub previous_signatures: Vec<String>,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Retry {
        state: SignatureState,
        retry_count: u32,
        priority: Priority,
        tier_floor: Tier,
    },
    Halt {
        state: SignatureState,
        reason: HaltReason,
        intervention: Intervention,
    },
}

impl RecoveryDecision {
    pub fn state(&self) -> &SignatureState {
        match self {
            RecoveryDecision::Retry { state, .. } | RecoveryDecision::Halt { state, .. } => state,
        }
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, RecoveryDecision::Halt { .. })
    }
}

/// Fold a new signature into the item's history: same as the last entry
/// bumps the repeat count, anything else appends and resets it to 1.
pub fn advance_signature(item: &WorkItem, signature: String) -> SignatureState {
    let mut previous = item.previous_signatures.clone();
    let repeat_count = if previous.last() == Some(&signature) {
        item.signature_repeat_count + 1
    } else {
        previous.push(signature.clone());
        1
    };
    SignatureState {
        signature,
        previous_signatures: previous,
        repeat_count,
    }
}

pub fn suggested_remediation(report: &FailureReport) -> String {
    let artifact = if report.artifact_path.trim().is_empty() {
        "the affected code".to_string()
    } else {
        report.artifact_path.clone()
    };
    match report.root_cause {
        RootCause::ImplementationBug => {
            format!("Fix the implementation in {artifact}; automated retries reproduced the same defect")
        }
        RootCause::TestDefect => {
            let test = if report.failing_test.trim().is_empty() {
                "the failing test".to_string()
            } else {
                report.failing_test.clone()
            };
            format!("Review {test} for incorrect expectations or setup before retrying")
        }
        RootCause::MissingDependency => {
            "Declare or install the missing dependency, then re-queue the item".to_string()
        }
        RootCause::ConfigurationError => {
            "Check configuration and environment (executor timeouts are reported here)".to_string()
        }
        RootCause::ArchitectureConflict => {
            "Needs a design decision: the requested change conflicts with the current architecture"
                .to_string()
        }
        RootCause::ScopeTooLarge => "Split the item into smaller items and re-submit them".to_string(),
        RootCause::MissingPrerequisite => {
            "Complete the prerequisite work and link it as a dependency".to_string()
        }
    }
}

fn build_intervention(
    item: &WorkItem,
    report: &FailureReport,
    state: &SignatureState,
    reason: HaltReason,
) -> Intervention {
    let mut evidence = vec![
        match reason {
            HaltReason::RepeatedSignature => format!(
                "signature {} seen {} times in a row",
                state.signature, state.repeat_count
            ),
            HaltReason::BudgetExhausted => format!(
                "retry budget exhausted ({}/{})",
                item.retry_count, item.max_retries
            ),
        },
        format!("retries used: {}/{}", item.retry_count, item.max_retries),
        format!("signature history: {}", state.previous_signatures.join(", ")),
    ];
    if !report.failing_test.trim().is_empty() {
        evidence.push(format!("failing test: {}", report.failing_test.trim()));
    }
    if !report.artifact_path.trim().is_empty() {
        evidence.push(format!("artifact: {}", report.artifact_path.trim()));
    }
    Intervention {
        item: item.id.clone(),
        signature: state.signature.clone(),
        root_cause: report.root_cause,
        error_message: report.error_message.clone(),
        evidence,
        suggested_remediation: suggested_remediation(report),
    }
}

pub fn on_failure(item: &WorkItem, report: &FailureReport, policy: &RecoveryPolicy) -> RecoveryDecision {
    let state = advance_signature(item, compute_signature(report));

    let reason = if state.repeat_count >= policy.signature_threshold {
        Some(HaltReason::RepeatedSignature)
    } else if item.retry_count >= item.max_retries {
        Some(HaltReason::BudgetExhausted)
    } else {
        None
    };

    match reason {
        Some(reason) => {
            let intervention = build_intervention(item, report, &state, reason);
            RecoveryDecision::Halt {
                state,
                reason,
                intervention,
            }
        }
        None => {
            let dispatched_at = router::route(item);
            RecoveryDecision::Retry {
                state,
                retry_count: item.retry_count + 1,
                priority: Priority::Critical,
                tier_floor: dispatched_at.escalate().unwrap_or(dispatched_at),
            }
        }
    }
}

/// Record a failed dispatch and apply the recovery decision.
///
/// Accepts the item in `in_progress` (the executor just reported) or
/// `failed` (marked failed earlier, e.g. by an operator). A worker passes its
/// name as `claimer` and gets `ClaimConflict` once the claim is no longer
/// its own; `None` is the operator path and acts on any holder.
pub fn record_failure(
    conn: &Connection,
    id: &str,
    claimer: Option<&str>,
    report: &FailureReport,
    policy: &RecoveryPolicy,
) -> Result<RecoveryDecision> {
    write_txn(conn, || {
        let mut item = store::get(conn, id)?;
        match item.status {
            Status::InProgress => {
                store::mark_failed(conn, id, claimer)?;
                item.status = Status::Failed;
            }
            Status::Failed if claimer.is_some() => {
                return Err(EngineError::ClaimConflict { id: id.to_string() });
            }
            Status::Failed => {}
            other => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from: other,
                    to: Status::Failed,
                })
            }
        }

        let decision = on_failure(&item, report, policy);
        let state = decision.state();
        store::set_failure_state(
            conn,
            id,
            &state.signature,
            &state.previous_signatures,
            state.repeat_count,
        )?;

        match &decision {
            RecoveryDecision::Retry {
                retry_count,
                priority,
                tier_floor,
                ..
            } => {
                store::rearm(conn, id, *retry_count, *priority, *tier_floor)?;
                info!(
                    "{id}: re-armed (retry {retry_count}/{}, signature {}, {tier_floor})",
                    item.max_retries, state.signature
                );
            }
            RecoveryDecision::Halt {
                reason,
                intervention,
                ..
            } => {
                store::halt(conn, intervention)?;
                warn!(
                    "{id}: halted ({reason:?}, signature {}); manual intervention required",
                    state.signature
                );
            }
        }
        Ok(decision)
    })
}
