use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::calltree::{CallForest, CallItem, CallNode, NodeKey};
use crate::ir::{Invocation, MethodSig};
use crate::search::{CutItem, CutNode};

/// Everything the body of a call node may reach: callee signatures and string
/// literals. The literals of the call site itself belong to the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Summary {
    pub(crate) callees: BTreeSet<MethodSig>,
    pub(crate) literals: BTreeSet<String>,
}

impl Summary {
    /// Adds a nested call: its callee, its literals, and what it reaches.
    fn add_call(&mut self, invocation: &Invocation, reached: Option<&Summary>) {
        self.callees.insert(invocation.callee.clone());
        self.literals.extend(invocation.literals.iter().cloned());
        if let Some(reached) = reached {
            self.absorb(reached);
        }
    }

    pub(crate) fn absorb(&mut self, other: &Summary) {
        self.callees.extend(other.callees.iter().cloned());
        self.literals.extend(other.literals.iter().cloned());
    }

    pub(crate) fn is_subset(&self, other: &Summary) -> bool {
        self.callees.is_subset(&other.callees) && self.literals.is_subset(&other.literals)
    }
}

/// Summaries of every call node of a forest, by sharing key.
pub(crate) type SummaryTable = HashMap<NodeKey, Summary>;

/// Summarizes every node reachable from the forest roots. Shared bodies are
/// summarized once.
pub(crate) fn summarize_forest(forest: &CallForest) -> SummaryTable {
    let mut summarizer = Summarizer {
        forest,
        table: SummaryTable::new(),
        in_progress: BTreeSet::new(),
    };
    for root in &forest.roots {
        summarizer.summarize(root);
    }
    log::debug!("summarized {} call nodes", summarizer.table.len());
    summarizer.table
}

struct Summarizer<'a> {
    forest: &'a CallForest,
    table: SummaryTable,
    in_progress: BTreeSet<NodeKey>,
}

impl Summarizer<'_> {
    fn summarize(&mut self, node: &CallNode) -> Summary {
        let key = node.key();
        if let Some(summary) = self.table.get(&key) {
            return summary.clone();
        }
        let mut summary = Summary::default();
        if !self.in_progress.insert(key.clone()) {
            return summary;
        }
        let forest = self.forest;
        for item in forest.body(node).leaves() {
            match item {
                CallItem::Invoked(invocation) => summary.add_call(invocation, None),
                CallItem::Call(child) => {
                    let reached = self.summarize(child);
                    summary.add_call(&child.invocation, Some(&reached));
                }
            }
        }
        self.in_progress.remove(&key);
        self.table.insert(key, summary.clone());
        summary
    }
}

/// Memo of excerpt summaries, keyed by sharing key and remaining depth.
pub(crate) type ExcerptSummaries = HashMap<(NodeKey, usize), Summary>;

/// Summary of a depth-cut excerpt. Only what is inside the cut counts.
pub(crate) fn excerpt_summary(node: &CutNode, memo: &mut ExcerptSummaries) -> Summary {
    summarize_cut(node, Some(memo))
}

/// Summary of one expanded path rooted at `node`.
pub(crate) fn rooted_path_summary(node: &CutNode) -> Summary {
    summarize_cut(node, None)
}

/// Summary of expanded path items. Paths through the same node differ, so
/// nothing is memoized.
pub(crate) fn path_summary<'a>(items: impl IntoIterator<Item = &'a CutItem>) -> Summary {
    let mut summary = Summary::default();
    summarize_items(&mut summary, items, None);
    summary
}

fn summarize_cut(node: &CutNode, mut memo: Option<&mut ExcerptSummaries>) -> Summary {
    let key = (node.key(), node.depth);
    if let Some(summary) = memo.as_deref().and_then(|memo| memo.get(&key)) {
        return summary.clone();
    }
    let mut summary = Summary::default();
    summarize_items(&mut summary, node.body.leaves(), memo.as_deref_mut());
    if let Some(memo) = memo {
        memo.insert(key, summary.clone());
    }
    summary
}

fn summarize_items<'a>(
    summary: &mut Summary,
    items: impl IntoIterator<Item = &'a CutItem>,
    mut memo: Option<&mut ExcerptSummaries>,
) {
    for item in items {
        match item {
            CutItem::Invoked(invocation) => summary.add_call(invocation, None),
            CutItem::Call(child) => {
                let reached = summarize_cut(child, memo.as_deref_mut());
                summary.add_call(&child.invocation, Some(&reached));
            }
        }
    }
}
