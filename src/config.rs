use clap::ValueEnum;

/// What to do with a method whose branch count exceeds the ceiling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum BranchLimitPolicy {
    /// Keep the method as an opaque leaf and carry on.
    #[default]
    Skip,
    /// Fail the whole construction.
    Abort,
}

/// Knobs for building per-method trees and call trees.
#[derive(Clone, Debug)]
pub(crate) struct AnalysisConfig {
    pub(crate) branch_limit: Option<usize>,
    pub(crate) on_branch_limit: BranchLimitPolicy,
    /// Count a method calling itself directly as a recursive chain.
    pub(crate) include_direct_recursion: bool,
}

pub(crate) const DEFAULT_BRANCH_LIMIT: usize = 50;

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            branch_limit: Some(DEFAULT_BRANCH_LIMIT),
            on_branch_limit: BranchLimitPolicy::Skip,
            include_direct_recursion: false,
        }
    }
}

/// Shape of the search output.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputForm {
    /// Bare signatures of the matching methods.
    Signature,
    /// Shallowest depth-cut excerpt of each matching method.
    #[value(name = "treecut")]
    TreeCut,
    /// Concrete call paths that contain every query word.
    #[default]
    Path,
}

#[derive(Clone, Debug)]
pub(crate) struct SearchConfig {
    /// `None` searches cuts of any depth.
    pub(crate) max_depth: Option<usize>,
    pub(crate) form: OutputForm,
    pub(crate) fully_qualified: bool,
}

pub(crate) const DEFAULT_MAX_DEPTH: usize = 5;

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: Some(DEFAULT_MAX_DEPTH),
            form: OutputForm::Path,
            fully_qualified: false,
        }
    }
}
