use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// AND/OR tree over leaves of type `T`.
///
/// `Seq` runs its children one after another and `Alt` picks exactly one.
/// `Seq([])` is the empty sequence, `Alt([])` can never happen.
/// The derived order puts leaves before sequences before alternatives.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Tree<T> {
    Leaf(T),
    Seq(Vec<Tree<T>>),
    Alt(Vec<Tree<T>>),
}

impl<T> Tree<T> {
    pub(crate) fn empty() -> Self {
        Tree::Seq(Vec::new())
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Tree::Seq(items) if items.is_empty())
    }

    /// Leaves in left-to-right order.
    pub(crate) fn leaves(&self) -> Vec<&T> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a T>) {
        match self {
            Tree::Leaf(item) => leaves.push(item),
            Tree::Seq(items) | Tree::Alt(items) => {
                for item in items {
                    item.collect_leaves(leaves);
                }
            }
        }
    }

    pub(crate) fn map<U>(&self, f: &mut impl FnMut(&T) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(item) => Tree::Leaf(f(item)),
            Tree::Seq(items) => Tree::Seq(items.iter().map(|item| item.map(&mut *f)).collect()),
            Tree::Alt(items) => Tree::Alt(items.iter().map(|item| item.map(&mut *f)).collect()),
        }
    }

    /// Replaces every leaf with a whole subtree.
    pub(crate) fn flat_map<U>(&self, f: &mut impl FnMut(&T) -> Tree<U>) -> Tree<U> {
        match self {
            Tree::Leaf(item) => f(item),
            Tree::Seq(items) => Tree::Seq(items.iter().map(|item| item.flat_map(&mut *f)).collect()),
            Tree::Alt(items) => Tree::Alt(items.iter().map(|item| item.flat_map(&mut *f)).collect()),
        }
    }

    pub(crate) fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<Tree<U>, E> {
        Ok(match self {
            Tree::Leaf(item) => Tree::Leaf(f(item)?),
            Tree::Seq(items) => Tree::Seq(
                items
                    .iter()
                    .map(|item| item.try_map(&mut *f))
                    .collect::<Result<_, _>>()?,
            ),
            Tree::Alt(items) => Tree::Alt(
                items
                    .iter()
                    .map(|item| item.try_map(&mut *f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl<T: Ord> Tree<T> {
    /// Canonical form: nested sequences and alternatives are spliced into
    /// their parent, alternatives are sorted and deduplicated, and
    /// single-child nodes collapse into the child.
    pub(crate) fn normalize(self) -> Self {
        match self {
            Tree::Leaf(_) => self,
            Tree::Seq(items) => {
                let mut flat = Vec::with_capacity(items.len());
                for item in items {
                    match item.normalize() {
                        Tree::Seq(inner) => flat.extend(inner),
                        Tree::Alt(inner) if inner.is_empty() => return Tree::Alt(inner),
                        other => flat.push(other),
                    }
                }
                single_or(flat, Tree::Seq)
            }
            Tree::Alt(items) => {
                let mut flat = Vec::with_capacity(items.len());
                for item in items {
                    match item.normalize() {
                        Tree::Alt(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                flat.sort();
                flat.dedup();
                single_or(flat, Tree::Alt)
            }
        }
    }
}

fn single_or<T>(mut items: Vec<Tree<T>>, wrap: fn(Vec<Tree<T>>) -> Tree<T>) -> Tree<T> {
    if items.len() == 1 {
        if let Some(item) = items.pop() {
            return item;
        }
    }
    wrap(items)
}

#[derive(Clone, Copy)]
enum GroupBy {
    Both,
    First,
    Last,
}

type GroupKey<S> = (Option<S>, Option<S>);

impl GroupBy {
    fn key<S: Clone>(self, path: &[S]) -> GroupKey<S> {
        let first = path.first().cloned();
        let last = path.last().cloned();
        match self {
            GroupBy::Both if path.len() >= 2 => (first, last),
            GroupBy::Both | GroupBy::First => (first, None),
            GroupBy::Last => (None, last),
        }
    }
}

impl<S: Ord + Clone> Tree<S> {
    /// Compresses a set of paths into a tree that expands to exactly the same
    /// set, factoring shared heads and tails.
    pub(crate) fn paths_to_tree(paths: &[Vec<S>]) -> Self {
        let mut paths = paths.to_vec();
        paths.sort();
        paths.dedup();
        factor(paths).normalize()
    }
}

fn sequence<S>(path: Vec<S>) -> Tree<S> {
    Tree::Seq(path.into_iter().map(Tree::Leaf).collect())
}

fn factor<S: Ord + Clone>(paths: Vec<Vec<S>>) -> Tree<S> {
    if paths.len() <= 1 {
        return paths.into_iter().next().map_or_else(Tree::empty, sequence);
    }

    let mut best: Option<BTreeMap<GroupKey<S>, Vec<Vec<S>>>> = None;
    for group_by in [GroupBy::Both, GroupBy::First, GroupBy::Last] {
        let mut groups: BTreeMap<GroupKey<S>, Vec<Vec<S>>> = BTreeMap::new();
        for path in &paths {
            groups.entry(group_by.key(path)).or_default().push(path.clone());
        }
        if best.as_ref().is_none_or(|best| groups.len() < best.len()) {
            best = Some(groups);
        }
    }
    let groups = match best {
        Some(groups) if groups.len() < paths.len() => groups,
        _ => return Tree::Alt(paths.into_iter().map(sequence).collect()),
    };

    let alternatives = groups
        .into_iter()
        .map(|((first, last), members)| {
            if members.len() == 1 {
                return members.into_iter().next().map_or_else(Tree::empty, sequence);
            }
            let mut remainders = members;
            let mut items = Vec::with_capacity(3);
            if let Some(first) = first {
                for path in &mut remainders {
                    path.remove(0);
                }
                items.push(Tree::Leaf(first));
            }
            let mut tail = None;
            if let Some(last) = last {
                if remainders.iter().all(|path| !path.is_empty()) {
                    for path in &mut remainders {
                        path.pop();
                    }
                    tail = Some(Tree::Leaf(last));
                }
            }
            remainders.sort();
            remainders.dedup();
            items.push(factor(remainders));
            items.extend(tail);
            Tree::Seq(items)
        })
        .collect();
    Tree::Alt(alternatives)
}
