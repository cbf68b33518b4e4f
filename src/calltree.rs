use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::andor::Tree;
use crate::body::MethodTrees;
use crate::config::AnalysisConfig;
use crate::dispatch::DispatchTable;
use crate::error::{Error, Result};
use crate::ir::{ClassTable, DispatchKind, Invocation, MethodSig};

/// Index of a call-node body in [`CallForest::bodies`].
pub(crate) type BodyId = usize;

/// Sharing key of a call-node body: the resolved callee and the recursion
/// context it was expanded under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct NodeKey {
    pub(crate) callee: MethodSig,
    pub(crate) context: Option<MethodSig>,
}

/// A resolved call whose callee body has been expanded.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct CallNode {
    /// The call site, bound to the resolved callee.
    pub(crate) invocation: Rc<Invocation>,
    /// Nearest enclosing method that is part of a recursive chain.
    pub(crate) context: Option<MethodSig>,
    pub(crate) body: BodyId,
}

impl CallNode {
    pub(crate) fn callee(&self) -> &MethodSig {
        &self.invocation.callee
    }

    pub(crate) fn key(&self) -> NodeKey {
        NodeKey {
            callee: self.invocation.callee.clone(),
            context: self.context.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CallItem {
    /// A call that is not expanded: external, recursive, or without code.
    Invoked(Rc<Invocation>),
    Call(CallNode),
}

impl CallItem {
    pub(crate) fn invocation(&self) -> &Rc<Invocation> {
        match self {
            CallItem::Invoked(invocation) => invocation,
            CallItem::Call(node) => &node.invocation,
        }
    }
}

/// Call trees of a set of entry points. Bodies live in one arena and are
/// shared by every node with the same [`NodeKey`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct CallForest {
    pub(crate) roots: Vec<CallNode>,
    pub(crate) bodies: Vec<Tree<CallItem>>,
}

impl CallForest {
    pub(crate) fn body(&self, node: &CallNode) -> &Tree<CallItem> {
        &self.bodies[node.body]
    }

    /// Every distinct call node reachable from the roots, keyed by sharing key.
    pub(crate) fn nodes(&self) -> HashMap<NodeKey, &CallNode> {
        let mut nodes = HashMap::new();
        let mut pending: Vec<&CallNode> = self.roots.iter().collect();
        while let Some(node) = pending.pop() {
            if nodes.insert(node.key(), node).is_some() {
                continue;
            }
            for item in self.body(node).leaves() {
                if let CallItem::Call(child) = item {
                    pending.push(child);
                }
            }
        }
        nodes
    }
}

const ENTRY_SIGNATURES: [(&str, &str, &[&str]); 3] = [
    ("void", "main", &["java.lang.String[]"]),
    ("void", "run", &[]),
    ("void", "<clinit>", &[]),
];

/// Entry points of a class table: methods with a conventional entry
/// signature, or every method with code of the named classes.
pub(crate) fn find_entry_points(classes: &ClassTable, entry_classes: &[String]) -> Vec<MethodSig> {
    let mut entry_points: Vec<MethodSig> = classes
        .values()
        .filter(|class| entry_classes.is_empty() || entry_classes.contains(&class.name))
        .flat_map(|class| &class.methods)
        .filter(|method| method.code.is_some())
        .filter(|method| {
            !entry_classes.is_empty()
                || ENTRY_SIGNATURES.iter().any(|(ret, name, params)| {
                    method.sig.ret == *ret && method.sig.name == *name && method.sig.params == *params
                })
        })
        .map(|method| method.sig.clone())
        .collect();
    entry_points.sort();
    entry_points
}

/// Every method with code, in signature order.
pub(crate) fn declared_methods(classes: &ClassTable) -> Vec<MethodSig> {
    let mut methods: Vec<MethodSig> = classes
        .values()
        .flat_map(|class| &class.methods)
        .filter(|method| method.code.is_some())
        .map(|method| method.sig.clone())
        .collect();
    methods.sort();
    methods
}

fn entry_invocation(entry_point: &MethodSig) -> Invocation {
    Invocation {
        kind: DispatchKind::Static,
        callee: entry_point.clone(),
        literals: Vec::new(),
        locator: None,
    }
}

fn resolve_entry_point(
    entry_point: &MethodSig,
    trees: &MethodTrees,
    table: &DispatchTable,
) -> Result<MethodSig> {
    table
        .resolve(&entry_invocation(entry_point))
        .into_iter()
        .next()
        .filter(|resolved| trees.contains_key(resolved))
        .ok_or_else(|| Error::EntryPointNotFound {
            method: entry_point.clone(),
        })
}

/// Methods reachable from `entry_point` that take part in a recursive call
/// chain: the members of every call cycle, found as strongly connected
/// components of the call graph.
pub(crate) fn find_recursive_methods(
    entry_point: &MethodSig,
    trees: &MethodTrees,
    table: &DispatchTable,
    include_direct_recursion: bool,
) -> Result<BTreeSet<MethodSig>> {
    let root = resolve_entry_point(entry_point, trees, table)?;
    let mut search = RecursionSearch {
        trees,
        table,
        include_direct_recursion,
        order: HashMap::new(),
        low: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        recursive: BTreeSet::new(),
    };
    search.dig(&root);
    Ok(search.recursive)
}

struct RecursionSearch<'a> {
    trees: &'a MethodTrees,
    table: &'a DispatchTable,
    include_direct_recursion: bool,
    /// Visit order of each searched method.
    order: HashMap<MethodSig, usize>,
    /// Earliest visit order reachable through methods still on the stack.
    low: HashMap<MethodSig, usize>,
    stack: Vec<MethodSig>,
    on_stack: HashSet<MethodSig>,
    recursive: BTreeSet<MethodSig>,
}

impl RecursionSearch<'_> {
    fn dig(&mut self, method: &MethodSig) {
        let trees = self.trees;
        let Some(tree) = trees.get(method) else {
            return;
        };
        let order = self.order.len();
        self.order.insert(method.clone(), order);
        self.low.insert(method.clone(), order);
        self.stack.push(method.clone());
        self.on_stack.insert(method.clone());

        let mut calls_itself = false;
        for invocation in tree.leaves() {
            for target in self.table.resolve(invocation) {
                if &target == method {
                    calls_itself = true;
                    continue;
                }
                if !trees.contains_key(&target) {
                    continue;
                }
                match self.order.get(&target).copied() {
                    None => {
                        self.dig(&target);
                        if let Some(reached) = self.low.get(&target).copied() {
                            self.lower(method, reached);
                        }
                    }
                    Some(visited) if self.on_stack.contains(&target) => self.lower(method, visited),
                    Some(_) => {}
                }
            }
        }

        if self.low.get(method) != Some(&order) {
            return;
        }
        let Some(pos) = self.stack.iter().rposition(|caller| caller == method) else {
            return;
        };
        let component = self.stack.split_off(pos);
        for member in &component {
            self.on_stack.remove(member);
        }
        if component.len() > 1 || (calls_itself && self.include_direct_recursion) {
            self.recursive.extend(component);
        }
    }

    fn lower(&mut self, method: &MethodSig, reached: usize) {
        if let Some(low) = self.low.get_mut(method) {
            *low = (*low).min(reached);
        }
    }
}

/// Expands the call tree of every entry point, sharing bodies by
/// [`NodeKey`] across all of them.
pub(crate) fn build_call_forest(
    entry_points: &[MethodSig],
    trees: &MethodTrees,
    table: &DispatchTable,
    config: &AnalysisConfig,
) -> Result<CallForest> {
    let mut recursive = BTreeSet::new();
    let mut roots = Vec::with_capacity(entry_points.len());
    for entry_point in entry_points {
        roots.push(resolve_entry_point(entry_point, trees, table)?);
        recursive.extend(find_recursive_methods(
            entry_point,
            trees,
            table,
            config.include_direct_recursion,
        )?);
    }
    log::info!("{} methods involved in recursive call chains", recursive.len());

    let mut builder = Builder {
        trees,
        table,
        recursive,
        memo: HashMap::new(),
        bodies: Vec::new(),
        expanding: Vec::new(),
    };
    let roots = roots
        .into_iter()
        .map(|root| {
            let invocation = Rc::new(entry_invocation(&root));
            let context = builder.recursive.contains(&root).then(|| root.clone());
            builder.node(invocation, &root, context)
        })
        .collect();
    log::debug!("call forest with {} shared bodies", builder.bodies.len());
    Ok(CallForest {
        roots,
        bodies: builder.bodies,
    })
}

struct Builder<'a> {
    trees: &'a MethodTrees,
    table: &'a DispatchTable,
    recursive: BTreeSet<MethodSig>,
    memo: HashMap<NodeKey, BodyId>,
    bodies: Vec<Tree<CallItem>>,
    /// Callees whose bodies are being expanded right now.
    expanding: Vec<MethodSig>,
}

impl Builder<'_> {
    fn node(&mut self, invocation: Rc<Invocation>, callee: &MethodSig, context: Option<MethodSig>) -> CallNode {
        let key = NodeKey {
            callee: callee.clone(),
            context: context.clone(),
        };
        let body = match self.memo.get(&key) {
            Some(&body) => body,
            None => {
                let trees = self.trees;
                let expanded = match trees.get(callee) {
                    Some(tree) => {
                        self.expanding.push(callee.clone());
                        let expanded = self.expand(tree, &context);
                        self.expanding.pop();
                        expanded
                    }
                    None => Tree::empty(),
                };
                let body = self.bodies.len();
                self.bodies.push(expanded);
                self.memo.insert(key, body);
                body
            }
        };
        CallNode {
            invocation,
            context,
            body,
        }
    }

    fn expand(&mut self, tree: &Tree<Rc<Invocation>>, context: &Option<MethodSig>) -> Tree<CallItem> {
        tree.flat_map(&mut |invocation| self.expand_call(invocation, context))
            .normalize()
    }

    fn expand_call(&mut self, invocation: &Rc<Invocation>, context: &Option<MethodSig>) -> Tree<CallItem> {
        let targets = self.table.resolve(invocation);
        if targets.is_empty() {
            return Tree::Leaf(CallItem::Invoked(invocation.clone()));
        }
        let alternatives = targets
            .iter()
            .map(|target| {
                let bound = Rc::new(invocation.retarget(target));
                if self.expanding.contains(target) || !self.trees.contains_key(target) {
                    return Tree::Leaf(CallItem::Invoked(bound));
                }
                let context = context
                    .clone()
                    .or_else(|| self.recursive.contains(target).then(|| target.clone()));
                Tree::Leaf(CallItem::Call(self.node(bound, target, context)))
            })
            .collect();
        Tree::Alt(alternatives).normalize()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::body::method_trees;
    use crate::body::tests::{class, method};
    use crate::ir::{Class, Method};
    use pretty_assertions::assert_eq;

    pub(crate) fn sig(class: &str, name: &str) -> MethodSig {
        MethodSig::new(class, "void", name, &[])
    }

    /// One class per entry, each with a single method `name` calling the
    /// listed `(class, method, literal)` triples.
    pub(crate) fn program(methods: &[(&str, &str, &[(&str, &str, Option<&str>)])]) -> ClassTable {
        let mut classes: ClassTable = ClassTable::new();
        for (class_name, name, callees) in methods {
            let entry = classes
                .entry(class_name.to_string())
                .or_insert_with(|| class(class_name, None, Vec::new()));
            entry.methods.push(method(sig(class_name, name), callees));
        }
        classes
    }

    pub(crate) fn forest_of(classes: &ClassTable, entry: MethodSig, config: &AnalysisConfig) -> CallForest {
        let trees = method_trees(classes, config).expect("method trees");
        let table = DispatchTable::new(classes);
        build_call_forest(&[entry], &trees, &table, config).expect("call forest")
    }

    fn call_nodes<'a>(forest: &'a CallForest, node: &CallNode) -> Vec<&'a CallNode> {
        forest
            .body(node)
            .leaves()
            .into_iter()
            .filter_map(|item| match item {
                CallItem::Call(child) => Some(child),
                CallItem::Invoked(_) => None,
            })
            .collect()
    }

    fn invoked_names(forest: &CallForest, node: &CallNode) -> Vec<String> {
        forest
            .body(node)
            .leaves()
            .into_iter()
            .filter_map(|item| match item {
                CallItem::Invoked(invocation) => Some(invocation.callee.name.clone()),
                CallItem::Call(_) => None,
            })
            .collect()
    }

    #[test]
    fn find_entry_points_uses_conventional_signatures() {
        let mut classes = program(&[("A", "run", &[]), ("A", "helper", &[]), ("B", "go", &[])]);
        let main = Method {
            sig: MethodSig::new("B", "void", "main", &["java.lang.String[]"]),
            locals: Default::default(),
            code: Some(Vec::new()),
        };
        if let Some(b) = classes.get_mut("B") {
            b.methods.push(main.clone());
        }

        assert_eq!(vec![sig("A", "run"), main.sig.clone()], find_entry_points(&classes, &[]));
        assert_eq!(
            vec![sig("B", "go"), main.sig.clone()],
            find_entry_points(&classes, &["B".to_string()])
        );
    }

    #[test]
    fn declared_methods_lists_methods_with_code() {
        let mut classes = program(&[("B", "go", &[]), ("A", "run", &[])]);
        if let Some(a) = classes.get_mut("A") {
            a.methods.push(Method {
                sig: sig("A", "abstract_step"),
                locals: Default::default(),
                code: None,
            });
        }

        assert_eq!(vec![sig("A", "run"), sig("B", "go")], declared_methods(&classes));
    }

    #[test]
    fn build_call_forest_shares_bodies_between_call_sites() {
        let classes = program(&[
            ("Main", "run", &[("X", "f", None), ("Y", "g", None)]),
            ("X", "f", &[("Z", "h", None)]),
            ("Y", "g", &[("Z", "h", None)]),
            ("Z", "h", &[("Lib", "print", Some("shared"))]),
        ]);

        let forest = forest_of(&classes, sig("Main", "run"), &AnalysisConfig::default());

        let root = &forest.roots[0];
        let children = call_nodes(&forest, root);
        assert_eq!(2, children.len());
        let via_x = call_nodes(&forest, children[0]);
        let via_y = call_nodes(&forest, children[1]);
        assert_eq!(sig("Z", "h"), *via_x[0].callee());
        assert_eq!(via_x[0].body, via_y[0].body);
        assert!(std::ptr::eq(forest.body(via_x[0]), forest.body(via_y[0])));
        assert_eq!(vec!["print".to_string()], invoked_names(&forest, via_x[0]));
        assert_eq!(4, forest.nodes().len());
    }

    #[test]
    fn build_call_forest_keeps_unresolved_calls_as_leaves() {
        let classes = program(&[("Main", "run", &[("java.io.PrintStream", "println", Some("hi"))])]);

        let forest = forest_of(&classes, sig("Main", "run"), &AnalysisConfig::default());

        let Tree::Leaf(CallItem::Invoked(invocation)) = forest.body(&forest.roots[0]) else {
            panic!("expected a single invoked leaf");
        };
        assert_eq!("println", invocation.callee.name);
        assert_eq!(vec!["\"hi\"".to_string()], invocation.literals);
    }

    #[test]
    fn build_call_forest_fails_for_unknown_entry_point() {
        let classes = program(&[("Main", "run", &[])]);
        let config = AnalysisConfig::default();
        let trees = method_trees(&classes, &config).expect("method trees");
        let table = DispatchTable::new(&classes);

        let result = build_call_forest(&[sig("Main", "missing")], &trees, &table, &config);

        assert!(matches!(result, Err(Error::EntryPointNotFound { method }) if method == sig("Main", "missing")));
    }

    fn cycle() -> ClassTable {
        program(&[
            ("A", "a", &[("B", "b", None)]),
            ("B", "b", &[("C", "c", None)]),
            ("C", "c", &[("A", "a", None), ("Lib", "done", None)]),
        ])
    }

    #[test]
    fn find_recursive_methods_marks_the_whole_cycle() {
        let classes = cycle();
        let config = AnalysisConfig::default();
        let trees = method_trees(&classes, &config).expect("method trees");
        let table = DispatchTable::new(&classes);

        let from_a = find_recursive_methods(&sig("A", "a"), &trees, &table, false).expect("search");
        let from_b = find_recursive_methods(&sig("B", "b"), &trees, &table, false).expect("search");

        let all = BTreeSet::from([sig("A", "a"), sig("B", "b"), sig("C", "c")]);
        assert_eq!(all, from_a);
        assert_eq!(all, from_b);
    }

    #[test]
    fn find_recursive_methods_marks_cycles_entered_through_searched_methods() {
        let classes = program(&[
            ("Main", "run", &[("A", "a", None), ("C", "c", None)]),
            ("A", "a", &[("B", "b", None), ("C", "c", None)]),
            ("B", "b", &[("A", "a", None)]),
            ("C", "c", &[("B", "b", None)]),
        ]);
        let config = AnalysisConfig::default();
        let trees = method_trees(&classes, &config).expect("method trees");
        let table = DispatchTable::new(&classes);

        let found = find_recursive_methods(&sig("Main", "run"), &trees, &table, false).expect("search");

        assert_eq!(BTreeSet::from([sig("A", "a"), sig("B", "b"), sig("C", "c")]), found);
    }

    #[test]
    fn find_recursive_methods_skips_methods_that_only_reach_a_cycle() {
        let classes = program(&[
            ("Main", "run", &[("A", "a", None)]),
            ("A", "a", &[("B", "b", None)]),
            ("B", "b", &[("A", "a", None), ("Lib", "tail", None)]),
        ]);
        let config = AnalysisConfig::default();
        let trees = method_trees(&classes, &config).expect("method trees");
        let table = DispatchTable::new(&classes);

        let found = find_recursive_methods(&sig("Main", "run"), &trees, &table, false).expect("search");

        assert_eq!(BTreeSet::from([sig("A", "a"), sig("B", "b")]), found);
    }

    #[test]
    fn find_recursive_methods_ignores_direct_recursion_unless_asked() {
        let classes = program(&[("D", "d", &[("D", "d", None), ("Lib", "step", None)])]);
        let config = AnalysisConfig::default();
        let trees = method_trees(&classes, &config).expect("method trees");
        let table = DispatchTable::new(&classes);

        assert!(find_recursive_methods(&sig("D", "d"), &trees, &table, false)
            .expect("search")
            .is_empty());
        assert_eq!(
            BTreeSet::from([sig("D", "d")]),
            find_recursive_methods(&sig("D", "d"), &trees, &table, true).expect("search")
        );
    }

    #[test]
    fn build_call_forest_terminates_on_cycles() {
        let forest = forest_of(&cycle(), sig("A", "a"), &AnalysisConfig::default());

        let root = &forest.roots[0];
        assert_eq!(Some(sig("A", "a")), root.context);
        let b = call_nodes(&forest, root)[0];
        let c = call_nodes(&forest, b)[0];
        assert_eq!(Some(sig("A", "a")), b.context);
        assert_eq!(Some(sig("A", "a")), c.context);
        assert!(call_nodes(&forest, c).is_empty());
        assert_eq!(vec!["a".to_string(), "done".to_string()], invoked_names(&forest, c));
        assert_eq!(3, forest.bodies.len());
    }

    #[test]
    fn build_call_forest_leaves_self_calls_unexpanded() {
        let classes = program(&[("D", "d", &[("D", "d", None), ("Lib", "step", None)])]);

        let forest = forest_of(&classes, sig("D", "d"), &AnalysisConfig::default());

        assert_eq!(None, forest.roots[0].context);
        assert_eq!(vec!["d".to_string(), "step".to_string()], invoked_names(&forest, &forest.roots[0]));
    }

    #[test]
    fn build_call_forest_offers_every_dispatch_target() {
        let mut classes = program(&[("Main", "run", &[("Base", "work", None)]), ("Base", "work", &[])]);
        let sub = Class {
            methods: vec![method(sig("Sub", "work"), &[("Lib", "sub", None)])],
            ..class("Sub", Some("Base"), Vec::new())
        };
        classes.insert("Sub".to_string(), sub);

        let forest = forest_of(&classes, sig("Main", "run"), &AnalysisConfig::default());

        let Tree::Alt(alternatives) = forest.body(&forest.roots[0]) else {
            panic!("expected alternatives");
        };
        let callees: Vec<&MethodSig> = alternatives
            .iter()
            .filter_map(|item| match item {
                Tree::Leaf(CallItem::Call(node)) => Some(node.callee()),
                _ => None,
            })
            .collect();
        assert_eq!(vec![&sig("Base", "work"), &sig("Sub", "work")], callees);
    }
}
