use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tlhs_core::{ActionRecord, EntityKind, SyncDecision};
use tlhs_storage::read_action_log;

const RECENT_ERRORS: usize = 5;

struct RunSection<'a> {
    label: String,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    counts: BTreeMap<(EntityKind, SyncDecision), usize>,
    errors: Vec<&'a ActionRecord>,
}

/// Markdown summary of the most recent `runs` runs in an action log.
pub fn report_markdown(records: &[ActionRecord], runs: usize) -> String {
    let mut sections: Vec<RunSection<'_>> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        let label = record
            .run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unscoped".to_string());
        let slot = *index.entry(label.clone()).or_insert_with(|| {
            sections.push(RunSection {
                label,
                first: record.timestamp,
                last: record.timestamp,
                counts: BTreeMap::new(),
                errors: Vec::new(),
            });
            sections.len() - 1
        });
        let section = &mut sections[slot];
        section.first = section.first.min(record.timestamp);
        section.last = section.last.max(record.timestamp);
        *section.counts.entry((record.entity, record.action)).or_default() += 1;
        if record.action == SyncDecision::Error {
            section.errors.push(record);
        }
    }
    sections.sort_by_key(|s| s.first);

    let mut lines = vec!["# Sync Report".to_string(), String::new()];
    if sections.is_empty() {
        lines.push("No recorded actions.".to_string());
        return lines.join("\n");
    }

    let skip = sections.len().saturating_sub(runs.max(1));
    for section in sections.iter().skip(skip).rev() {
        lines.push(format!("## Run `{}`", section.label));
        lines.push(format!(
            "- window: {} .. {}",
            section.first.format("%Y-%m-%d %H:%M:%S"),
            section.last.format("%Y-%m-%d %H:%M:%S")
        ));
        lines.push(format!("- actions: {}", section.counts.values().sum::<usize>()));
        lines.push(String::new());
        lines.push("| entity | action | count |".to_string());
        lines.push("|---|---|---|".to_string());
        for ((entity, action), count) in &section.counts {
            lines.push(format!("| {entity} | {action} | {count} |"));
        }
        if !section.errors.is_empty() {
            lines.push(String::new());
            lines.push("Recent errors:".to_string());
            for record in section.errors.iter().rev().take(RECENT_ERRORS) {
                lines.push(format!("- {} `{}`: {}", record.entity, record.id, record.message));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

pub async fn report_from_log(path: impl AsRef<Path>, runs: usize) -> Result<String> {
    let records = read_action_log(path).await?;
    Ok(report_markdown(&records, runs))
}
