//! Line-level comparison of two versions.
//!
//! This is a set difference over lines, not a sequence alignment: order and
//! moves are not tracked.

use serde::Serialize;

pub const MAX_LINES: usize = 100;
/// Including the terminator, so a line holds at most 127 bytes. Longer
/// lines continue as the next line.
pub const MAX_LINE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub from: u32,
    pub to: u32,
    pub identical: bool,
    /// Lines of `from` missing from `to`.
    pub removed: Vec<String>,
    /// Lines of `to` missing from `from`.
    pub added: Vec<String>,
}

impl DiffReport {
    /// `- `/`+ ` prefixed output lines, removals first.
    pub fn render(&self) -> Vec<String> {
        self.removed
            .iter()
            .map(|l| format!("- {}", l))
            .chain(self.added.iter().map(|l| format!("+ {}", l)))
            .collect()
    }
}

/// Split content into at most [`MAX_LINES`] lines, stopping at the first NUL.
pub fn parse_lines(content: &[u8]) -> Vec<String> {
    let end = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    let content = &content[..end];
    let mut lines = Vec::new();
    let mut i = 0;
    while i < content.len() && lines.len() < MAX_LINES {
        let start = i;
        while i < content.len() && content[i] != b'\n' && i - start < MAX_LINE_LEN - 1 {
            i += 1;
        }
        lines.push(String::from_utf8_lossy(&content[start..i]).into_owned());
        if i < content.len() && content[i] == b'\n' {
            i += 1;
        }
    }
    lines
}

fn missing(lines: &[String], other: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| !l.is_empty() && !other.contains(*l))
        .cloned()
        .collect()
}

/// Compare version `from` (content `old`) against version `to` (content `new`).
pub fn diff_versions(from: u32, to: u32, old: &[u8], new: &[u8]) -> DiffReport {
    if from == to {
        return DiffReport {
            from,
            to,
            identical: true,
            removed: Vec::new(),
            added: Vec::new(),
        };
    }
    let old = parse_lines(old);
    let new = parse_lines(new);
    DiffReport {
        from,
        to,
        identical: false,
        removed: missing(&old, &new),
        added: missing(&new, &old),
    }
}
