//! Flat, index-addressed view of a supervision tree.
//!
//! Daemons own their children directly; this snapshot turns that into an
//! arena with parent-index back references so ordering and lookups don't
//! need recursion over live handles.

use serde::Serialize;

use super::core::{Daemon, DaemonId};
use super::state::DaemonState;

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    #[serde(skip)]
    pub id: DaemonId,
    pub name: String,
    /// Index of the parent node in [`TreeSnapshot::nodes`].
    pub parent: Option<usize>,
    pub depth: usize,
    pub state: DaemonState,
    pub alive: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeSnapshot {
    pub nodes: Vec<TreeNode>,
}

impl TreeSnapshot {
    /// Capture `root` and everything below it, breadth first.
    pub fn capture(root: &Daemon) -> Self {
        let mut nodes = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((root.clone(), None, 0usize));

        while let Some((daemon, parent, depth)) = queue.pop_front() {
            // A handle can only be reached twice through a cycle, which
            // `add_daemon_child` rejects; guard anyway so capture terminates.
            if nodes.iter().any(|n: &TreeNode| n.id == daemon.id()) {
                continue;
            }
            let index = nodes.len();
            nodes.push(TreeNode {
                id: daemon.id(),
                name: daemon.name().to_string(),
                parent,
                depth,
                state: daemon.get_state(),
                alive: daemon.is_alive(),
                last_error: daemon.last_error(),
            });
            for child in daemon.children() {
                queue.push_back((child, Some(index), depth + 1));
            }
        }

        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: DaemonId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn find(&self, name: &str) -> Option<&TreeNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Indices of the direct children of `index`, in insertion order.
    pub fn children_of(&self, index: usize) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == Some(index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Node indices in reverse breadth-first order. Every daemon comes after
    /// all of its descendants, matching the order cleanup completes on End.
    pub fn leaves_first(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| {
            self.nodes[*b]
                .depth
                .cmp(&self.nodes[*a].depth)
                .then_with(|| b.cmp(a))
        });
        order
    }

    /// Render as an indented outline, one daemon per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        if !self.nodes.is_empty() {
            self.outline_into(0, &mut out);
        }
        out
    }

    fn outline_into(&self, index: usize, out: &mut String) {
        let node = &self.nodes[index];
        let marker = if node.alive { "" } else { " (stopped)" };
        out.push_str(&format!(
            "{}{} [{}]{}\n",
            "  ".repeat(node.depth),
            node.name,
            node.state,
            marker
        ));
        for child in self.children_of(index) {
            self.outline_into(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Daemon {
        let root = Daemon::new("edge");
        let mqtt = Daemon::new("mqtt");
        let opcua = Daemon::new("opcua");
        let calendar = Daemon::new("calendar");
        opcua.add_daemon_child(calendar).unwrap();
        root.add_daemon_child(mqtt).unwrap();
        root.add_daemon_child(opcua).unwrap();
        root
    }

    #[test]
    fn capture_records_parent_indices() {
        let snapshot = TreeSnapshot::capture(&tree());
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.nodes[0].name, "edge");
        assert_eq!(snapshot.nodes[0].parent, None);

        let calendar = snapshot.find("calendar").unwrap();
        assert_eq!(calendar.depth, 2);
        let parent = calendar.parent.unwrap();
        assert_eq!(snapshot.nodes[parent].name, "opcua");
        assert_eq!(snapshot.children_of(0).len(), 2);
    }

    #[test]
    fn leaves_first_puts_root_last() {
        let snapshot = TreeSnapshot::capture(&tree());
        let names: Vec<&str> = snapshot
            .leaves_first()
            .into_iter()
            .map(|i| snapshot.nodes[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["calendar", "opcua", "mqtt", "edge"]);
    }

    #[test]
    fn outline_indents_by_depth() {
        let outline = TreeSnapshot::capture(&tree()).outline();
        let lines: Vec<&str> = outline.lines().collect();
        assert_eq!(lines[0], "edge [INITIAL] (stopped)");
        assert_eq!(lines[1], "  mqtt [INITIAL] (stopped)");
        assert_eq!(lines[3], "    calendar [INITIAL] (stopped)");
    }
}
