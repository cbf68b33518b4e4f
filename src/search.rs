use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use crate::andor::Tree;
use crate::calltree::{CallForest, CallItem, CallNode, NodeKey};
use crate::config::{OutputForm, SearchConfig};
use crate::ir::{Invocation, MethodSig};
use crate::query::Query;
use crate::summary::{
    excerpt_summary, path_summary, rooted_path_summary, ExcerptSummaries, SummaryTable,
};

/// A call node of a depth-cut excerpt. Unlike [`CallNode`], the body is owned
/// by the excerpt and may be shared with other excerpt nodes through the `Rc`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct CutNode {
    pub(crate) invocation: Rc<Invocation>,
    pub(crate) context: Option<MethodSig>,
    /// Levels of calls kept below and including this node.
    pub(crate) depth: usize,
    pub(crate) body: Rc<Tree<CutItem>>,
}

impl CutNode {
    pub(crate) fn callee(&self) -> &MethodSig {
        &self.invocation.callee
    }

    pub(crate) fn key(&self) -> NodeKey {
        NodeKey {
            callee: self.invocation.callee.clone(),
            context: self.context.clone(),
        }
    }

    fn with_body(&self, body: Rc<Tree<CutItem>>) -> Self {
        Self {
            body,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum CutItem {
    Invoked(Rc<Invocation>),
    Call(CutNode),
}

impl CutItem {
    pub(crate) fn invocation(&self) -> &Rc<Invocation> {
        match self {
            CutItem::Invoked(invocation) => invocation,
            CutItem::Call(node) => &node.invocation,
        }
    }
}

/// Call nodes that satisfy `predicate` while none of their nested call nodes
/// do. The search only descends into satisfying nodes, so `predicate` must be
/// monotone: a node satisfies it whenever one of its descendants does.
pub(crate) fn lowest_fulfilling_nodes<'f>(
    forest: &'f CallForest,
    mut predicate: impl FnMut(&CallNode) -> bool,
) -> Vec<&'f CallNode> {
    let mut search = LowerBoundSearch {
        forest,
        searched: HashSet::new(),
        found: Vec::new(),
    };
    for root in &forest.roots {
        if predicate(root) {
            search.dig(root, &mut predicate);
        }
    }
    search.found
}

struct LowerBoundSearch<'f> {
    forest: &'f CallForest,
    searched: HashSet<NodeKey>,
    found: Vec<&'f CallNode>,
}

impl<'f> LowerBoundSearch<'f> {
    fn dig(&mut self, node: &'f CallNode, predicate: &mut dyn FnMut(&CallNode) -> bool) {
        if !self.searched.insert(node.key()) {
            return;
        }
        let forest = self.forest;
        let mut deeper = false;
        for item in forest.body(node).leaves() {
            if let CallItem::Call(child) = item {
                if predicate(child) {
                    deeper = true;
                    self.dig(child, predicate);
                }
            }
        }
        if !deeper {
            self.found.push(node);
        }
    }
}

/// Excerpt of a call node down to some depth.
#[derive(Clone, Debug)]
pub(crate) struct TreeCut {
    pub(crate) node: CutNode,
    /// Some call node was cut off at the depth boundary.
    pub(crate) has_deeper: bool,
}

/// Cuts `node` at `depth` levels of calls, counting the node itself: call
/// nodes beyond that are replaced by their bare invocation. A depth of 0 is
/// treated as 1.
pub(crate) fn tree_cut(forest: &CallForest, node: &CallNode, depth: usize) -> TreeCut {
    let mut cutter = Cutter {
        forest,
        memo: HashMap::new(),
        has_deeper: false,
    };
    let node = cutter.cut(node, depth.max(1));
    TreeCut {
        node,
        has_deeper: cutter.has_deeper,
    }
}

struct Cutter<'f> {
    forest: &'f CallForest,
    memo: HashMap<(NodeKey, usize), Rc<Tree<CutItem>>>,
    has_deeper: bool,
}

impl Cutter<'_> {
    fn cut(&mut self, node: &CallNode, depth: usize) -> CutNode {
        let key = (node.key(), depth);
        let body = match self.memo.get(&key) {
            Some(body) => Rc::clone(body),
            None => {
                let forest = self.forest;
                let body = Rc::new(forest.body(node).map(&mut |item| self.cut_item(item, depth - 1)));
                self.memo.insert(key, Rc::clone(&body));
                body
            }
        };
        CutNode {
            invocation: Rc::clone(&node.invocation),
            context: node.context.clone(),
            depth,
            body,
        }
    }

    fn cut_item(&mut self, item: &CallItem, depth: usize) -> CutItem {
        match item {
            CallItem::Invoked(invocation) => CutItem::Invoked(Rc::clone(invocation)),
            CallItem::Call(child) if depth == 0 => {
                self.has_deeper = true;
                CutItem::Invoked(Rc::clone(&child.invocation))
            }
            CallItem::Call(child) => CutItem::Call(self.cut(child, depth)),
        }
    }
}

/// The shallowest cut of `node` whose own summary fulfills the query.
///
/// Depths are tried from 1 up to `max_depth` inclusive. Returns `None` when
/// no depth within the cap fulfills the query, or when the full node does not.
pub(crate) fn shallowest_cut(
    forest: &CallForest,
    node: &CallNode,
    query: &Query,
    max_depth: Option<usize>,
) -> Option<CutNode> {
    let mut memo = ExcerptSummaries::new();
    let mut depth = 1;
    while max_depth.is_none_or(|max_depth| depth <= max_depth) {
        let cut = tree_cut(forest, node, depth);
        if query.is_fulfilled_by(&excerpt_summary(&cut.node, &mut memo)) {
            return Some(cut.node);
        }
        if !cut.has_deeper {
            break;
        }
        depth += 1;
    }
    None
}

/// Expands a cut into its concrete call paths.
///
/// Alternatives are chosen in every combination; an alternative that carries
/// no evidence for any pattern is not offered. Each path keeps the shape of
/// the cut, with every body normalized again, and only paths that fulfill the
/// whole query are returned.
pub(crate) fn expand_paths(cut: &CutNode, query: &Query) -> Vec<CutNode> {
    let mut expander = PathExpander {
        query,
        memo: HashMap::new(),
    };
    expander
        .node_paths(cut)
        .into_iter()
        .filter(|path| query.is_fulfilled_by(&rooted_path_summary(path)))
        .collect()
}

type Paths = Vec<Vec<CutItem>>;

struct PathExpander<'q> {
    query: &'q Query,
    /// Paths of each body, by body identity.
    memo: HashMap<*const Tree<CutItem>, Rc<Vec<Rc<Tree<CutItem>>>>>,
}

impl PathExpander<'_> {
    fn node_paths(&mut self, node: &CutNode) -> Vec<CutNode> {
        let bodies = self.body_paths(&node.body);
        if bodies.is_empty() {
            return vec![node.with_body(Rc::new(Tree::empty()))];
        }
        bodies.iter().map(|body| node.with_body(Rc::clone(body))).collect()
    }

    fn body_paths(&mut self, body: &Rc<Tree<CutItem>>) -> Rc<Vec<Rc<Tree<CutItem>>>> {
        let key = Rc::as_ptr(body);
        if let Some(paths) = self.memo.get(&key) {
            return Rc::clone(paths);
        }
        let paths: Vec<Rc<Tree<CutItem>>> = self
            .tree_paths(body)
            .unwrap_or_default()
            .into_iter()
            .map(|path| Rc::new(Tree::Seq(path.into_iter().map(Tree::Leaf).collect()).normalize()))
            .collect();
        let paths = Rc::new(paths);
        self.memo.insert(key, Rc::clone(&paths));
        paths
    }

    /// `None` when the tree holds no path at all.
    fn tree_paths(&mut self, tree: &Tree<CutItem>) -> Option<Paths> {
        match tree {
            Tree::Leaf(CutItem::Call(node)) => Some(
                self.node_paths(node)
                    .into_iter()
                    .map(|node| vec![CutItem::Call(node)])
                    .collect(),
            ),
            Tree::Leaf(item) => Some(vec![vec![item.clone()]]),
            Tree::Alt(alternatives) => {
                let mut paths = Vec::new();
                for alternative in alternatives {
                    for path in self.tree_paths(alternative).unwrap_or_default() {
                        if !path.is_empty() && self.query.is_partially_fulfilled_by(&path_summary(&path)) {
                            paths.push(path);
                        }
                    }
                }
                (!paths.is_empty()).then_some(paths)
            }
            Tree::Seq(items) => {
                let parts: Vec<Paths> = items.iter().filter_map(|item| self.tree_paths(item)).collect();
                if parts.is_empty() {
                    return None;
                }
                let mut paths: Paths = vec![Vec::new()];
                for part in parts {
                    paths = paths
                        .iter()
                        .flat_map(|prefix| part.iter().map(move |suffix| [prefix.as_slice(), suffix.as_slice()].concat()))
                        .collect();
                }
                Some(paths)
            }
        }
    }
}

/// What made an excerpt match: the types, method names and literals the
/// patterns hit, and the callees hit by field-wise method patterns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Contribution {
    pub(crate) types: BTreeSet<String>,
    pub(crate) method_names: BTreeSet<String>,
    pub(crate) literals: BTreeSet<String>,
    pub(crate) callees: BTreeSet<MethodSig>,
}

impl Contribution {
    /// Records what the invocation contributes; false if nothing.
    fn record(&mut self, invocation: &Invocation, query: &Query) -> bool {
        let callee = &invocation.callee;
        let mut contributes = false;
        for typ in callee.types() {
            if self.types.contains(typ) || query.matches_type(typ) {
                self.types.insert(typ.to_string());
                contributes = true;
            }
        }
        if self.method_names.contains(&callee.name) {
            contributes = true;
        } else if query.matches_method(callee) {
            contributes = true;
            if query.matches_method_name(&callee.name) {
                self.method_names.insert(callee.name.clone());
            } else {
                self.callees.insert(callee.clone());
            }
        }
        for literal in &invocation.literals {
            if query.matches_literal(literal) {
                self.literals.insert(literal.clone());
                contributes = true;
            }
        }
        contributes
    }
}

/// Drops every part of the excerpt that contributes nothing to the query. A
/// call node whose body prunes away entirely is kept as a bare invocation when
/// the call itself contributes. The root node is always kept.
pub(crate) fn prune_uncontributing(cut: &CutNode, query: &Query) -> (CutNode, Contribution) {
    let mut pruner = Pruner {
        query,
        contribution: Contribution::default(),
        memo: HashMap::new(),
    };
    pruner.contribution.record(&cut.invocation, query);
    let body = pruner.prune_body(&cut.body).unwrap_or_else(|| Rc::new(Tree::empty()));
    (cut.with_body(body), pruner.contribution)
}

struct Pruner<'q> {
    query: &'q Query,
    contribution: Contribution,
    memo: HashMap<*const Tree<CutItem>, Option<Rc<Tree<CutItem>>>>,
}

impl Pruner<'_> {
    fn prune_body(&mut self, body: &Rc<Tree<CutItem>>) -> Option<Rc<Tree<CutItem>>> {
        let key = Rc::as_ptr(body);
        if let Some(pruned) = self.memo.get(&key) {
            return pruned.clone();
        }
        let pruned = self.prune_tree(body).map(|tree| Rc::new(tree.normalize()));
        self.memo.insert(key, pruned.clone());
        pruned
    }

    fn prune_tree(&mut self, tree: &Tree<CutItem>) -> Option<Tree<CutItem>> {
        match tree {
            Tree::Leaf(item) => self.prune_item(item).map(Tree::Leaf),
            Tree::Seq(items) => {
                let kept: Vec<_> = items.iter().filter_map(|item| self.prune_tree(item)).collect();
                (!kept.is_empty()).then_some(Tree::Seq(kept))
            }
            Tree::Alt(items) => {
                let kept: Vec<_> = items.iter().filter_map(|item| self.prune_tree(item)).collect();
                (!kept.is_empty()).then_some(Tree::Alt(kept))
            }
        }
    }

    fn prune_item(&mut self, item: &CutItem) -> Option<CutItem> {
        let contributes = self.contribution.record(item.invocation(), self.query);
        match item {
            CutItem::Invoked(_) => contributes.then(|| item.clone()),
            CutItem::Call(node) => match self.prune_body(&node.body) {
                Some(body) => Some(CutItem::Call(node.with_body(body))),
                None => contributes.then(|| CutItem::Invoked(Rc::clone(&node.invocation))),
            },
        }
    }
}

/// A pruned excerpt and what made it match.
#[derive(Clone, Debug)]
pub(crate) struct Excerpt {
    pub(crate) node: CutNode,
    pub(crate) contribution: Contribution,
}

/// One matching method. Signature searches carry no excerpts.
#[derive(Clone, Debug)]
pub(crate) struct Hit {
    pub(crate) callee: MethodSig,
    pub(crate) excerpts: Vec<Excerpt>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SearchOutcome {
    pub(crate) hits: Vec<Hit>,
    /// Matching nodes with no fulfilling cut within the depth cap.
    pub(crate) beyond_max_depth: usize,
    /// Matching cuts none of whose paths holds every query word.
    pub(crate) without_paths: usize,
}

/// Finds the most specific call nodes fulfilling the query and renders them
/// in the configured form.
pub(crate) fn search(
    forest: &CallForest,
    summaries: &SummaryTable,
    query: &Query,
    config: &SearchConfig,
) -> SearchOutcome {
    let mut fulfilled: HashMap<NodeKey, bool> = HashMap::new();
    let nodes = lowest_fulfilling_nodes(forest, |node| {
        *fulfilled.entry(node.key()).or_insert_with_key(|key| {
            summaries
                .get(key)
                .is_some_and(|summary| query.is_fulfilled_by(summary))
        })
    });
    log::debug!("{} call nodes fulfill the query", nodes.len());

    let mut outcome = SearchOutcome::default();
    if config.form == OutputForm::Signature {
        let callees: BTreeSet<&MethodSig> = nodes.iter().map(|node| node.callee()).collect();
        outcome.hits = callees
            .into_iter()
            .map(|callee| Hit {
                callee: callee.clone(),
                excerpts: Vec::new(),
            })
            .collect();
        return outcome;
    }

    let mut cuts = Vec::new();
    for node in nodes {
        match shallowest_cut(forest, node, query, config.max_depth) {
            Some(cut) => cuts.push(without_contexts(&outermost(cut))),
            None => outcome.beyond_max_depth += 1,
        }
    }
    cuts.sort_by(|a, b| a.callee().cmp(b.callee()));
    cuts.dedup_by(|a, b| a.callee() == b.callee());

    for cut in cuts {
        let excerpts = match config.form {
            OutputForm::Path => expand_paths(&cut, query),
            _ => vec![cut.clone()],
        };
        if excerpts.is_empty() {
            outcome.without_paths += 1;
            continue;
        }
        let excerpts = excerpts
            .iter()
            .map(|excerpt| {
                let (node, contribution) = prune_uncontributing(excerpt, query);
                Excerpt { node, contribution }
            })
            .collect();
        outcome.hits.push(Hit {
            callee: cut.callee().clone(),
            excerpts,
        });
    }
    outcome
}

/// Drops the locator of the outermost call, which points into whatever caller
/// the node happened to be found under.
fn outermost(cut: CutNode) -> CutNode {
    CutNode {
        invocation: Rc::new(cut.invocation.without_locator()),
        ..cut
    }
}

fn without_contexts(node: &CutNode) -> CutNode {
    let body = node.body.map(&mut |item| match item {
        CutItem::Invoked(invocation) => CutItem::Invoked(Rc::clone(invocation)),
        CutItem::Call(child) => CutItem::Call(without_contexts(child)),
    });
    CutNode {
        context: None,
        body: Rc::new(body),
        ..node.clone()
    }
}
