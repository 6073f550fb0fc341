//! The configuration tree and its nodes.

use std::collections::BTreeMap;

/// A single node in a configuration tree.
///
/// Each child key is one command token. The `terminal` flag marks that a
/// command line ended at this node; it is a struct field rather than a
/// sentinel child entry, so a token can never collide with the marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigNode {
    children: BTreeMap<String, ConfigNode>,
    terminal: bool,
}

impl ConfigNode {
    /// Returns true if a command line ends at this node.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Returns true if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Child node for a token, if present.
    pub fn child(&self, token: &str) -> Option<&ConfigNode> {
        self.children.get(token)
    }

    fn descendant_count(&self) -> usize {
        self.children
            .values()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }
}

/// Hierarchical model of a device's line-oriented running configuration.
///
/// The root represents the empty command prefix. Exclusively owned by one
/// device session; all mutation goes through [`set`](Self::set) and
/// [`unset`](Self::unset).
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    root: ConfigNode,
}

impl ConfigTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no configuration has been set.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Total number of nodes below the root.
    pub fn node_count(&self) -> usize {
        self.root.descendant_count()
    }

    /// Returns true if the full token path exists in the tree.
    pub fn contains(&self, path: &[&str]) -> bool {
        let mut node = &self.root;
        for token in path {
            match node.child(token) {
                Some(child) => node = child,
                None => return false,
            }
        }
        !path.is_empty()
    }

    /// Walks the token path, creating intermediate nodes as needed, and marks
    /// the final node terminal. Re-entering an existing subtree reuses it.
    pub fn set(&mut self, path: &[&str]) {
        if path.is_empty() {
            return;
        }
        let mut node = &mut self.root;
        for token in path {
            node = node.children.entry((*token).to_string()).or_default();
        }
        node.terminal = true;
    }

    /// Removes the subtree named by the final path element and prunes
    /// now-empty, non-terminal ancestors bottom-up (never the root).
    ///
    /// Returns true if anything was removed.
    pub fn unset(&mut self, path: &[&str]) -> bool {
        Self::unset_in(&mut self.root, path)
    }

    fn unset_in(node: &mut ConfigNode, path: &[&str]) -> bool {
        let Some((head, rest)) = path.split_first() else {
            return false;
        };
        if rest.is_empty() {
            return node.children.remove(*head).is_some();
        }
        let Some(child) = node.children.get_mut(*head) else {
            return false;
        };
        let removed = Self::unset_in(child, rest);
        if removed && child.is_leaf() && !child.is_terminal() {
            node.children.remove(*head);
        }
        removed
    }

    /// Serializes the tree back to configuration text.
    ///
    /// Pre-order traversal; tokens accumulate into a line until a terminal
    /// node is reached, which emits the line and starts its children on fresh
    /// lines (nested-block style). A `!` separator follows every root-level
    /// subtree. Sibling order is lexicographic by token.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (token, node) in &self.root.children {
            Self::render_node(&mut out, node, token.clone());
            out.push_str("!\n");
        }
        out
    }

    fn render_node(out: &mut String, node: &ConfigNode, line: String) {
        let base = if node.is_terminal() {
            out.push_str(&line);
            out.push('\n');
            String::new()
        } else {
            line
        };
        for (token, child) in &node.children {
            let child_line = if base.is_empty() {
                token.clone()
            } else {
                format!("{base} {token}")
            };
            Self::render_node(out, child, child_line);
        }
    }
}
