//! Run statistics.
//!
//! A nested counter tree accumulated in memory across one pipeline
//! invocation and rendered once at the end as sorted, pretty-printed JSON.
//! Nothing here is persisted; it exists for the log.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
enum StatNode {
    Count(i64),
    Tree(BTreeMap<String, StatNode>),
}

/// Counter tree addressed by key paths such as `["file", "a.pdf", "text_len"]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    #[serde(flatten)]
    root: BTreeMap<String, StatNode>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to the counter at `path`, creating intermediate nodes.
    pub fn incr(&mut self, path: &[&str], by: i64) {
        if let Some(slot) = self.slot(path) {
            match slot {
                StatNode::Count(n) => *n += by,
                StatNode::Tree(_) => *slot = StatNode::Count(by),
            }
        }
    }

    /// Overwrite the counter at `path`.
    pub fn set(&mut self, path: &[&str], value: i64) {
        if let Some(slot) = self.slot(path) {
            *slot = StatNode::Count(value);
        }
    }

    /// Counter at `path`; zero when absent or when `path` names a subtree.
    pub fn get(&self, path: &[&str]) -> i64 {
        let Some((last, parents)) = path.split_last() else {
            return 0;
        };
        let mut level = &self.root;
        for key in parents {
            match level.get(*key) {
                Some(StatNode::Tree(next)) => level = next,
                _ => return 0,
            }
        }
        match level.get(*last) {
            Some(StatNode::Count(n)) => *n,
            _ => 0,
        }
    }

    /// Keys directly under `path`, in sorted order.
    pub fn keys(&self, path: &[&str]) -> Vec<String> {
        let mut level = &self.root;
        for key in path {
            match level.get(*key) {
                Some(StatNode::Tree(next)) => level = next,
                _ => return Vec::new(),
            }
        }
        level.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Pretty JSON with sorted keys, prefixed for the log.
    pub fn render(&self) -> String {
        let json = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        format!("Statistics:\n{}", json)
    }

    fn slot(&mut self, path: &[&str]) -> Option<&mut StatNode> {
        let (last, parents) = path.split_last()?;
        let mut level = &mut self.root;
        for key in parents {
            let node = level
                .entry((*key).to_string())
                .or_insert_with(|| StatNode::Tree(BTreeMap::new()));
            if let StatNode::Count(_) = node {
                *node = StatNode::Tree(BTreeMap::new());
            }
            level = match node {
                StatNode::Tree(next) => next,
                StatNode::Count(_) => return None,
            };
        }
        Some(
            level
                .entry((*last).to_string())
                .or_insert(StatNode::Count(0)),
        )
    }
}
