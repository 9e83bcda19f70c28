use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::model::{Event, Intervention, Note, Status, WorkItem};

#[derive(Serialize)]
pub struct ItemDetail<'a> {
    #[serde(flatten)]
    pub item: &'a WorkItem,
    pub notes: &'a [Note],
    pub blocked_by: &'a [String],
    pub blocks: &'a [String],
    pub intervention: Option<&'a Intervention>,
}

pub fn format_item_detail(
    item: &WorkItem,
    notes: &[Note],
    blockers: &[String],
    dependents: &[String],
    intervention: Option<&Intervention>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Id:          {}\n", item.id));
    out.push_str(&format!("Title:       {}\n", item.title));
    out.push_str(&format!("Status:      {}\n", item.status));
    out.push_str(&format!("Kind:        {}\n", item.kind));
    out.push_str(&format!("Category:    {}\n", item.category));
    if let Some(mode) = item.mode {
        out.push_str(&format!("Mode:        {mode}\n"));
    }
    out.push_str(&format!("Complexity:  {}\n", item.complexity));
    out.push_str(&format!("Priority:    {}\n", item.priority));
    out.push_str(&format!("Retries:     {}/{}\n", item.retry_count, item.max_retries));
    if !item.objective.is_empty() {
        out.push_str(&format!("Objective:   {}\n", item.objective));
    }
    for criterion in &item.acceptance {
        out.push_str(&format!("Accept:      {criterion}\n"));
    }
    if !item.tests.is_empty() {
        out.push_str(&format!("Tests:       {}\n", item.tests.join(", ")));
    }
    if let Some(ref sig) = item.failure_signature {
        out.push_str(&format!(
            "Signature:   {sig} (x{})\n",
            item.signature_repeat_count
        ));
    }
    if let Some(ref claimer) = item.claimed_by {
        out.push_str(&format!("Claimed by:  {claimer}\n"));
    }
    out.push_str(&format!("Created:     {}\n", item.created_at));
    out.push_str(&format!("Updated:     {}\n", item.updated_at));

    if !blockers.is_empty() {
        out.push_str(&format!("Blocked by:  {}\n", blockers.join(", ")));
    }
    if !dependents.is_empty() {
        out.push_str(&format!("Blocks:      {}\n", dependents.join(", ")));
    }

    if let Some(intervention) = intervention {
        out.push('\n');
        out.push_str(&format_intervention(intervention));
    }

    if !notes.is_empty() {
        out.push('\n');
        out.push_str("Notes:\n");
        for note in notes {
            out.push_str(&format!("  [{}] {}\n", note.created_at, note.content));
        }
    }

    out
}

pub fn format_intervention(intervention: &Intervention) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Needs attention: {} [{}] {}\n",
        intervention.item, intervention.root_cause, intervention.signature
    ));
    out.push_str(&format!("  Error:  {}\n", intervention.error_message));
    for line in &intervention.evidence {
        out.push_str(&format!("  - {line}\n"));
    }
    out.push_str(&format!("  Fix:    {}\n", intervention.suggested_remediation));
    out
}

pub fn format_item_list(items: &[WorkItem]) -> String {
    let mut out = String::new();
    for item in items {
        out.push_str(&format!(
            "{} {} [{}/{}] {}\n",
            item.status.icon(),
            item.id,
            item.priority,
            item.category,
            item.title
        ));
    }
    out
}

/// Counts per status, then halted items in their own section: they need a
/// human and will never resolve on their own.
pub fn format_status_report(
    counts: &HashMap<Status, usize>,
    ready: &[WorkItem],
    interventions: &[Intervention],
) -> String {
    let mut out = String::new();
    for status in Status::ALL {
        out.push_str(&format!(
            "{} {:<12}{}\n",
            status.icon(),
            status.as_str(),
            counts.get(status).copied().unwrap_or(0)
        ));
    }

    if !ready.is_empty() {
        out.push_str("\nReady:\n");
        for item in ready {
            out.push_str(&format!("  {} [{}] {}\n", item.id, item.priority, item.title));
        }
    }

    if !interventions.is_empty() {
        out.push_str(&format!("\nNeeds attention ({} halted):\n", interventions.len()));
        for intervention in interventions {
            out.push_str(&format!(
                "  # {} [{}] {}\n",
                intervention.item, intervention.root_cause, intervention.suggested_remediation
            ));
        }
    }
    out
}

/// What `root` waits on, recursively. Shared dependencies are expanded once.
pub fn format_dependency_tree(root: &str, items: &[WorkItem]) -> String {
    let by_id: HashMap<&str, &WorkItem> = items.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut out = String::new();
    let mut expanded = HashSet::new();
    write_tree(&mut out, root, &by_id, &mut expanded, "", "");
    out
}

/// Write an item line and recurse into its dependencies.
/// `line_prefix` is what goes before the status icon on this line.
/// `child_prefix` is the base prefix for the children's tree connectors.
fn write_tree<'a>(
    out: &mut String,
    id: &'a str,
    by_id: &HashMap<&'a str, &'a WorkItem>,
    expanded: &mut HashSet<&'a str>,
    line_prefix: &str,
    child_prefix: &str,
) {
    let Some(&item) = by_id.get(id) else {
        out.push_str(&format!("{line_prefix}? {id}  (missing)\n"));
        return;
    };
    let first_visit = expanded.insert(id);
    let suffix = if first_visit || item.dependencies.is_empty() {
        ""
    } else {
        "  (see above)"
    };
    out.push_str(&format!(
        "{line_prefix}{} {}  {}{suffix}\n",
        item.status.icon(),
        item.id,
        item.title
    ));
    if !first_visit {
        return;
    }

    for (i, dep) in item.dependencies.iter().enumerate() {
        let is_last = i == item.dependencies.len() - 1;
        let (connector, extension) = if is_last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        write_tree(
            out,
            dep,
            by_id,
            expanded,
            &format!("{child_prefix}{connector}"),
            &format!("{child_prefix}{extension}"),
        );
    }
}

pub fn format_notes(notes: &[Note]) -> String {
    let mut out = String::new();
    for note in notes {
        out.push_str(&format!("[{}] {}\n", note.created_at, note.content));
    }
    out
}

pub fn format_events(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&format!("[{}] {:<10} {}\n", event.created_at, event.kind, event.detail));
    }
    out
}
