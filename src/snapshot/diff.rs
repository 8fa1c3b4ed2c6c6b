use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub summary: String,
}

/// Compares two snapshots as multisets of lines. Sibling reordering yields
/// nothing; a net change in how often a line occurs yields that many
/// entries. Each list is truncated to `cap` entries.
///
/// Returns `None` unless both snapshots are present.
pub fn diff(
    before: Option<&str>,
    after: Option<&str>,
    cap: usize,
) -> Option<SnapshotDiff> {
    let before = normalized_lines(before?);
    let after = normalized_lines(after?);

    let before_counts = line_counts(&before);
    let after_counts = line_counts(&after);

    let (added, added_total) =
        surplus(&after, &after_counts, &before_counts, cap);
    let (removed, removed_total) =
        surplus(&before, &before_counts, &after_counts, cap);

    Some(SnapshotDiff {
        added,
        removed,
        summary: summary(added_total, removed_total),
    })
}

fn normalized_lines(snapshot: &str) -> Vec<&str> {
    snapshot
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect()
}

fn line_counts<'a>(lines: &[&'a str]) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for line in lines {
        *counts.entry(*line).or_insert(0) += 1;
    }
    counts
}

/// Lines that occur more often on `side` than on `other`, in order of first
/// occurrence on `side`. Also returns the untruncated total.
fn surplus(
    side: &[&str],
    side_counts: &HashMap<&str, usize>,
    other_counts: &HashMap<&str, usize>,
    cap: usize,
) -> (Vec<String>, usize) {
    let mut entries = Vec::new();
    let mut total = 0;
    let mut seen = HashSet::new();
    for line in side {
        if !seen.insert(*line) {
            continue;
        }
        let count = side_counts.get(line).copied().unwrap_or(0);
        let other = other_counts.get(line).copied().unwrap_or(0);
        let excess = count.saturating_sub(other);
        total += excess;
        for _ in 0..excess {
            if entries.len() < cap {
                entries.push(line.trim().to_string());
            }
        }
    }
    (entries, total)
}

fn summary(added: usize, removed: usize) -> String {
    match (added, removed) {
        (0, 0) => "no changes".to_string(),
        (added, 0) => format!("{} added", added),
        (0, removed) => format!("{} removed", removed),
        (added, removed) => format!("{} added, {} removed", added, removed),
    }
}
