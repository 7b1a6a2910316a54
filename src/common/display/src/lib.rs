//! Display utilities for Rivulet.
//!
//! Renders execution plans as indented trees for `explain` output.

mod tree;

pub use tree::{DisplayTree, OwnedTreeNode, TreeNode};

/// Truncate a string to at most `max_len` characters, marking the cut.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Indent a multi-line string.
pub fn indent(s: &str, prefix: &str) -> String {
    s.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
