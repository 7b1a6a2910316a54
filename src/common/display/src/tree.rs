//! Tree display utilities for execution plans.

use std::fmt;

/// A node in a display tree.
pub trait TreeNode {
    /// Get the display name of this node.
    fn name(&self) -> &str;

    /// Get child nodes.
    fn children(&self) -> Vec<&dyn TreeNode>;

    /// Get additional details to display.
    fn details(&self) -> Option<String> {
        None
    }
}

/// An owned tree, convenient when the source graph is not itself a tree
/// of references (e.g. an arena of nodes addressed by id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedTreeNode {
    pub name: String,
    pub details: Option<String>,
    pub children: Vec<OwnedTreeNode>,
}

impl OwnedTreeNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: None,
            children: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_child(mut self, child: OwnedTreeNode) -> Self {
        self.children.push(child);
        self
    }
}

impl TreeNode for OwnedTreeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<&dyn TreeNode> {
        self.children.iter().map(|c| c as &dyn TreeNode).collect()
    }

    fn details(&self) -> Option<String> {
        self.details.clone()
    }
}

/// Helper for displaying tree structures.
pub struct DisplayTree<'a> {
    root: &'a dyn TreeNode,
}

impl<'a> DisplayTree<'a> {
    /// Create a new display tree.
    pub fn new(root: &'a dyn TreeNode) -> Self {
        Self { root }
    }

    fn fmt_label(f: &mut fmt::Formatter<'_>, node: &dyn TreeNode) -> fmt::Result {
        write!(f, "{}", node.name())?;
        if let Some(details) = node.details() {
            write!(f, " ({details})")?;
        }
        writeln!(f)
    }

    fn fmt_node(
        f: &mut fmt::Formatter<'_>,
        node: &dyn TreeNode,
        prefix: &str,
        is_last: bool,
    ) -> fmt::Result {
        let connector = if is_last { "└─ " } else { "├─ " };
        write!(f, "{prefix}{connector}")?;
        Self::fmt_label(f, node)?;

        let children = node.children();
        let child_prefix = format!("{prefix}{}", if is_last { "   " } else { "│  " });
        for (i, child) in children.iter().enumerate() {
            Self::fmt_node(f, *child, &child_prefix, i + 1 == children.len())?;
        }

        Ok(())
    }
}

impl fmt::Display for DisplayTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Self::fmt_label(f, self.root)?;

        let children = self.root.children();
        for (i, child) in children.iter().enumerate() {
            Self::fmt_node(f, *child, "", i + 1 == children.len())?;
        }

        Ok(())
    }
}
