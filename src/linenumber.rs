use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ir::{Locator, MethodSig};

/// Source lines of the invocations of one method, by invocation ordinal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MethodLines {
    pub(crate) method: MethodSig,
    pub(crate) lines: Vec<u32>,
}

/// Maps invocations back to lines of the original source. Used only to
/// decorate output.
#[derive(Clone, Debug, Default)]
pub(crate) struct LineNumberTable {
    lines: HashMap<MethodSig, Vec<u32>>,
}

impl LineNumberTable {
    pub(crate) fn new(entries: Vec<MethodLines>) -> Self {
        let lines = entries
            .into_iter()
            .map(|entry| (entry.method, entry.lines))
            .collect();
        Self { lines }
    }

    /// Reads a JSON list of [`MethodLines`].
    pub(crate) fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let entries: Vec<MethodLines> = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse line numbers in {}", path.display()))?;
        log::debug!("line numbers of {} methods", entries.len());
        Ok(Self::new(entries))
    }

    pub(crate) fn source_line(&self, method: &MethodSig, ordinal: usize) -> Option<u32> {
        self.lines.get(method)?.get(ordinal).copied()
    }

    pub(crate) fn locate(&self, locator: &Locator) -> Option<u32> {
        self.source_line(&locator.method, locator.ordinal)
    }
}
