use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::body::method_trees;
use crate::calltree::{build_call_forest, CallForest, CallItem, CallNode, NodeKey};
use crate::config::AnalysisConfig;
use crate::dispatch::DispatchTable;
use crate::error::Error;
use crate::ir::{ClassTable, MethodSig};
use crate::summary::{summarize_forest, Summary, SummaryTable};

/// Everything a search needs: the call forest of the entry points and the
/// summary of each of its nodes.
#[derive(Clone, Debug)]
pub(crate) struct Index {
    pub(crate) entry_points: Vec<MethodSig>,
    pub(crate) forest: CallForest,
    pub(crate) summaries: SummaryTable,
}

impl Index {
    pub(crate) fn build(
        classes: &ClassTable,
        entry_points: Vec<MethodSig>,
        config: &AnalysisConfig,
    ) -> crate::error::Result<Self> {
        let trees = method_trees(classes, config)?;
        let table = DispatchTable::new(classes);
        let forest = build_call_forest(&entry_points, &trees, &table, config)?;
        let summaries = summarize_forest(&forest);
        log::info!(
            "indexed {} entry points: {} bodies, {} summaries",
            entry_points.len(),
            forest.bodies.len(),
            summaries.len()
        );
        Ok(Self {
            entry_points,
            forest,
            summaries,
        })
    }

    /// Checks that the call forest and the summary table belong together.
    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.entry_points.len() != self.forest.roots.len() {
            return Err(Error::InconsistentIndex(format!(
                "{} entry points but {} call trees",
                self.entry_points.len(),
                self.forest.roots.len()
            )));
        }
        for (entry_point, root) in self.entry_points.iter().zip(&self.forest.roots) {
            if entry_point != root.callee() {
                return Err(Error::InconsistentIndex(format!(
                    "call tree of {} found for entry point {entry_point}",
                    root.callee()
                )));
            }
        }

        let mut seen: HashSet<NodeKey> = HashSet::new();
        let mut pending: Vec<&CallNode> = self.forest.roots.iter().collect();
        while let Some(node) = pending.pop() {
            let key = node.key();
            let Some(body) = self.forest.bodies.get(node.body) else {
                return Err(Error::InconsistentIndex(format!(
                    "body {} of {} is missing",
                    node.body,
                    node.callee()
                )));
            };
            if !self.summaries.contains_key(&key) {
                return Err(Error::InconsistentIndex(format!(
                    "no summary for {}",
                    node.callee()
                )));
            }
            if !seen.insert(key) {
                continue;
            }
            for item in body.leaves() {
                if let CallItem::Call(child) = item {
                    pending.push(child);
                }
            }
        }
        Ok(())
    }

    /// Methods whose bodies the index expanded.
    pub(crate) fn methods(&self) -> Vec<MethodSig> {
        let mut methods: Vec<MethodSig> = self
            .forest
            .nodes()
            .into_keys()
            .map(|key| key.callee)
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// String literals reachable from any entry point.
    pub(crate) fn literals(&self) -> Vec<String> {
        let mut literals: Vec<String> = self
            .summaries
            .values()
            .flat_map(|summary| summary.literals.iter().cloned())
            .collect();
        literals.sort();
        literals.dedup();
        literals
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSummary {
    key: NodeKey,
    summary: Summary,
}

#[derive(Serialize, Deserialize)]
struct StoredIndex {
    entry_points: Vec<MethodSig>,
    forest: CallForest,
    summaries: Vec<StoredSummary>,
}

/// Writes the index as JSON. Summaries are sorted by key so that the output is
/// deterministic.
pub(crate) fn write_index(path: &Path, index: &Index) -> Result<()> {
    let mut summaries: Vec<StoredSummary> = index
        .summaries
        .iter()
        .map(|(key, summary)| StoredSummary {
            key: key.clone(),
            summary: summary.clone(),
        })
        .collect();
    summaries.sort_by(|a, b| a.key.cmp(&b.key));
    let stored = StoredIndex {
        entry_points: index.entry_points.clone(),
        forest: index.forest.clone(),
        summaries,
    };

    let file = File::create(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &stored)
        .with_context(|| format!("failed to serialize index to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Reads and validates an index written by [`write_index`].
pub(crate) fn read_index(path: &Path) -> Result<Index> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let stored: StoredIndex = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse index {}", path.display()))?;
    let index = Index {
        entry_points: stored.entry_points,
        forest: stored.forest,
        summaries: stored
            .summaries
            .into_iter()
            .map(|stored| (stored.key, stored.summary))
            .collect(),
    };
    index
        .validate()
        .with_context(|| format!("failed to load index {}", path.display()))?;
    Ok(index)
}
