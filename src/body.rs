use std::collections::BTreeMap;
use std::rc::Rc;

use crate::andor::Tree;
use crate::cfg::{branch_count, clean_up, structure};
use crate::config::{AnalysisConfig, BranchLimitPolicy};
use crate::error::{Error, Result};
use crate::ir::{Class, ClassTable, Invocation, Method, MethodSig};
use crate::normalize::normalize_method;
use crate::paths::{enumerate, to_tree};

/// AND/OR tree of the invocations each method body may perform.
pub(crate) type MethodTrees = BTreeMap<MethodSig, Tree<Rc<Invocation>>>;

/// Runs one method through normalization, structuring, path enumeration and
/// compression. Returns `None` for methods without code.
pub(crate) fn method_tree(
    class: &Class,
    method: &Method,
    branch_limit: Option<usize>,
) -> Result<Option<Tree<Rc<Invocation>>>> {
    if method.code.is_none() {
        return Ok(None);
    }
    let code = clean_up(normalize_method(class, method)?);
    let regions = structure(&method.sig, code)?;
    let branches = branch_count(&regions);
    if let Some(limit) = branch_limit {
        if branches > limit {
            return Err(Error::TooManyBranches {
                method: method.sig.clone(),
                branches,
                limit,
            });
        }
    }
    let paths = enumerate(&regions);
    log::debug!("{}: {} branches, {} paths", method.sig, branches, paths.len());
    Ok(Some(to_tree(&paths)))
}

/// Builds the tree of every method with code in the class table.
///
/// Methods over the branch ceiling are left out under
/// [`BranchLimitPolicy::Skip`], so that calls to them stay opaque.
pub(crate) fn method_trees(classes: &ClassTable, config: &AnalysisConfig) -> Result<MethodTrees> {
    let mut trees = MethodTrees::new();
    for class in classes.values() {
        for method in &class.methods {
            match method_tree(class, method, config.branch_limit) {
                Ok(Some(tree)) => {
                    trees.insert(method.sig.clone(), tree);
                }
                Ok(None) => {}
                Err(Error::TooManyBranches {
                    method: sig,
                    branches,
                    limit,
                }) if config.on_branch_limit == BranchLimitPolicy::Skip => {
                    log::warn!("skip {sig}: {branches} branches exceed the limit of {limit}");
                }
                Err(e) => return Err(e),
            }
        }
    }
    log::debug!("built trees of {} methods", trees.len());
    Ok(trees)
}
