//! Executor routing: complexity to tier, and the bounded context handed to
//! the executor for one dispatch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::{Complexity, Note, Tier, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimits {
    pub max_context_items: usize,
    pub max_capabilities: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    #[serde(default = "TierTable::default_tier1")]
    pub tier1: TierLimits,
    #[serde(default = "TierTable::default_tier2")]
    pub tier2: TierLimits,
    #[serde(default = "TierTable::default_tier3")]
    pub tier3: TierLimits,
}

impl TierTable {
    fn default_tier1() -> TierLimits {
        TierLimits {
            max_context_items: 3,
            max_capabilities: 2,
            timeout_secs: 300,
        }
    }

    fn default_tier2() -> TierLimits {
        TierLimits {
            max_context_items: 6,
            max_capabilities: 4,
            timeout_secs: 900,
        }
    }

    fn default_tier3() -> TierLimits {
        TierLimits {
            max_context_items: 12,
            max_capabilities: 6,
            timeout_secs: 1800,
        }
    }

    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Tier1 => &self.tier1,
            Tier::Tier2 => &self.tier2,
            Tier::Tier3 => &self.tier3,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        TierTable {
            tier1: Self::default_tier1(),
            tier2: Self::default_tier2(),
            tier3: Self::default_tier3(),
        }
    }
}

/// An auxiliary capability module that can be attached to a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Capability {
    pub name: String,
    /// Functional category; at most one capability per category per dispatch.
    pub category: String,
    /// Item categories this capability applies to; empty means all.
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl Capability {
    pub fn applies(&self, item: &WorkItem) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|c| *c == item.category)
    }
}

pub fn base_tier(complexity: Complexity) -> Tier {
    match complexity {
        Complexity::Easy => Tier::Tier1,
        Complexity::Normal => Tier::Tier2,
        Complexity::Complex => Tier::Tier3,
    }
}

/// Tier for the next dispatch of `item`. Escalation raises `tier_floor`, so
/// an item is never routed below a tier it has already been escalated to.
pub fn route(item: &WorkItem) -> Tier {
    base_tier(item.complexity).max(item.tier_floor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundedContext {
    pub item_id: String,
    pub tier: Tier,
    pub title: String,
    pub objective: String,
    pub acceptance: Vec<String>,
    pub tests: Vec<String>,
    pub context: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub timeout_secs: u64,
    /// Context entries left out by the tier cap.
    pub dropped_context: usize,
    /// Capabilities left out by the cap or the one-per-category rule.
    pub dropped_capabilities: Vec<String>,
}

fn failure_summary(item: &WorkItem) -> Option<String> {
    item.failure_signature.as_ref().map(|sig| {
        format!(
            "previous failure {sig} (seen {} time(s) in a row, retry {}/{})",
            item.signature_repeat_count, item.retry_count, item.max_retries
        )
    })
}

pub fn build_context(
    item: &WorkItem,
    notes: &[Note],
    capabilities: &[Capability],
    table: &TierTable,
) -> BoundedContext {
    let tier = route(item);
    let limits = table.limits(tier);

    // Prior-failure context first, then notes newest first.
    let mut candidates: Vec<String> = failure_summary(item).into_iter().collect();
    candidates.extend(notes.iter().rev().map(|n| n.content.clone()));
    let dropped_context = candidates.len().saturating_sub(limits.max_context_items);
    candidates.truncate(limits.max_context_items);

    let mut seen_categories = HashSet::new();
    let mut attached = Vec::new();
    let mut dropped_capabilities = Vec::new();
    for cap in capabilities.iter().filter(|c| c.applies(item)) {
        if attached.len() >= limits.max_capabilities || !seen_categories.insert(cap.category.as_str()) {
            dropped_capabilities.push(cap.name.clone());
            continue;
        }
        attached.push(cap.clone());
    }

    BoundedContext {
        item_id: item.id.clone(),
        tier,
        title: item.title.clone(),
        objective: item.objective.clone(),
        acceptance: item.acceptance.clone(),
        tests: item.tests.clone(),
        context: candidates,
        capabilities: attached,
        timeout_secs: limits.timeout_secs,
        dropped_context,
        dropped_capabilities,
    }
}
