//! In-memory view of a repository's directory tree

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{DirectoryNode, ROOT_PARENT_ID};

/// Nodes of one repository indexed by id and by parent
pub struct DirectoryArena {
    nodes: Vec<DirectoryNode>,
    by_id: HashMap<i64, usize>,
    children: HashMap<i64, Vec<usize>>,
}

impl DirectoryArena {
    pub fn new(nodes: Vec<DirectoryNode>) -> Self {
        let mut by_id = HashMap::with_capacity(nodes.len());
        let mut children: HashMap<i64, Vec<usize>> = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            by_id.insert(node.id, idx);
            children.entry(node.parent_id).or_default().push(idx);
        }
        Self {
            nodes,
            by_id,
            children,
        }
    }

    pub fn get(&self, id: i64) -> Option<&DirectoryNode> {
        self.by_id.get(&id).map(|&idx| &self.nodes[idx])
    }

    /// The node itself followed by every node below it, breadth first
    pub fn collect_descendants(&self, id: i64) -> Vec<&DirectoryNode> {
        let Some(&start) = self.by_id.get(&id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            let node = &self.nodes[idx];
            out.push(node);
            if node.is_file {
                continue;
            }
            if let Some(kids) = self.children.get(&node.id) {
                queue.extend(kids.iter().copied());
            }
        }
        out
    }

    /// Ancestors from the top level down to the node itself
    pub fn path_to_root(&self, id: i64) -> Vec<&DirectoryNode> {
        let mut path = Vec::new();
        let mut current = id;
        // A corrupt parent cycle would otherwise never terminate
        while current != ROOT_PARENT_ID && path.len() <= self.nodes.len() {
            let Some(node) = self.get(current) else {
                break;
            };
            path.push(node);
            current = node.parent_id;
        }
        path.reverse();
        path
    }
}
