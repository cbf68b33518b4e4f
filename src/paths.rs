use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::andor::Tree;
use crate::cfg::Region;
use crate::ir::{Instruction, Invocation};

/// One step of a path through a region level.
///
/// A `Nested` step stands for "any one of these paths" through a box, shared
/// by every path that crosses the box.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Step {
    Block(Rc<[Rc<Invocation>]>),
    Nested(Rc<Vec<Path>>),
}

pub(crate) type Path = Vec<Step>;

/// Paths through one level of regions.
#[derive(Default)]
struct Level {
    /// Paths that fall off the end of the level.
    through: Vec<Path>,
    /// Paths that leave the method early by returning or throwing.
    exits: Vec<Path>,
}

/// Persistent path prefix, so that forking a walk is a pointer copy.
#[derive(Clone, Default)]
struct Trail(Option<Rc<TrailLink>>);

struct TrailLink {
    step: Step,
    prev: Trail,
}

impl Trail {
    fn push(&self, step: Step) -> Self {
        Trail(Some(Rc::new(TrailLink {
            step,
            prev: self.clone(),
        })))
    }

    fn to_path(&self) -> Path {
        let mut path = Vec::new();
        let mut cursor = &self.0;
        while let Some(link) = cursor {
            path.push(link.step.clone());
            cursor = &link.prev.0;
        }
        path.reverse();
        path
    }
}

struct Walk {
    pos: usize,
    trail: Trail,
    visited: Vec<u8>,
}

/// Passes allowed through one backward jump.
const BACK_EDGE_PASSES: u8 = 2;

/// Every path through a method body, including early exits.
pub(crate) fn enumerate(regions: &[Region]) -> Vec<Path> {
    let level = enumerate_level(regions);
    let mut paths = level.through;
    paths.extend(level.exits);
    paths.sort();
    paths.dedup();
    paths
}

fn enumerate_level(regions: &[Region]) -> Level {
    let nested: Vec<Option<(Rc<Vec<Path>>, Rc<Vec<Path>>)>> = regions
        .iter()
        .map(|region| match region {
            Region::Box(inner) => {
                let level = enumerate_level(inner);
                Some((Rc::new(level.through), Rc::new(level.exits)))
            }
            _ => None,
        })
        .collect();
    let labels: HashMap<&str, usize> = regions
        .iter()
        .enumerate()
        .filter_map(|(index, region)| match region {
            Region::Op(Instruction::Label { name }) => Some((name.as_str(), index)),
            _ => None,
        })
        .collect();

    let mut level = Level::default();
    let mut queue = vec![Walk {
        pos: 0,
        trail: Trail::default(),
        visited: vec![0; regions.len()],
    }];
    while let Some(Walk {
        mut pos,
        mut trail,
        mut visited,
    }) = queue.pop()
    {
        loop {
            let Some(region) = regions.get(pos) else {
                level.through.push(trail.to_path());
                break;
            };
            match region {
                Region::Block(calls) => {
                    trail = trail.push(Step::Block(calls.clone()));
                    pos += 1;
                }
                Region::Box(_) => {
                    let Some((through, exits)) = &nested[pos] else {
                        unreachable!("every box has a nested level");
                    };
                    if !exits.is_empty() {
                        level.exits.push(trail.push(Step::Nested(exits.clone())).to_path());
                    }
                    if through.is_empty() {
                        break;
                    }
                    trail = trail.push(Step::Nested(through.clone()));
                    pos += 1;
                }
                Region::Op(Instruction::Return { .. } | Instruction::Throw { .. }) => {
                    level.exits.push(trail.to_path());
                    break;
                }
                Region::Op(Instruction::CondBranch { target, .. }) => {
                    if let Some(&dest) = labels.get(target.as_str()) {
                        if visited[dest] == 0 {
                            queue.push(Walk {
                                pos: dest,
                                trail: trail.clone(),
                                visited: visited.clone(),
                            });
                        }
                    }
                    pos += 1;
                }
                Region::Op(Instruction::Branch { target, .. }) => {
                    let Some(&dest) = labels.get(target.as_str()) else {
                        break;
                    };
                    if dest < pos {
                        if visited[pos] >= BACK_EDGE_PASSES {
                            break;
                        }
                        visited[pos] += 1;
                        pos = dest + 1;
                    } else {
                        pos = dest;
                    }
                }
                Region::Op(Instruction::MultiBranch { targets, .. }) => {
                    let dests: BTreeSet<usize> = targets
                        .iter()
                        .filter_map(|target| labels.get(target.as_str()).copied())
                        .collect();
                    for dest in dests {
                        if visited[dest] == 0 {
                            queue.push(Walk {
                                pos: dest,
                                trail: trail.clone(),
                                visited: visited.clone(),
                            });
                        }
                    }
                    break;
                }
                Region::Op(Instruction::Label { .. }) => {
                    if visited[pos] > 0 {
                        break;
                    }
                    visited[pos] = 1;
                    pos += 1;
                }
                Region::Op(Instruction::Invoke { .. }) => {
                    unreachable!("invocations are grouped into blocks")
                }
            }
        }
    }

    level.through.sort();
    level.through.dedup();
    level.exits.sort();
    level.exits.dedup();
    level
}

/// Compresses enumerated paths into an AND/OR tree of invocations. Nested
/// path sets shared between steps are converted once.
pub(crate) fn to_tree(paths: &[Path]) -> Tree<Rc<Invocation>> {
    let mut converted = HashMap::new();
    convert(paths, &mut converted).normalize()
}

fn convert(
    paths: &[Path],
    converted: &mut HashMap<*const Vec<Path>, Tree<Rc<Invocation>>>,
) -> Tree<Rc<Invocation>> {
    Tree::paths_to_tree(paths).flat_map(&mut |step| match step {
        Step::Block(calls) => Tree::Seq(calls.iter().cloned().map(Tree::Leaf).collect()),
        Step::Nested(inner) => {
            let key = Rc::as_ptr(inner);
            if let Some(tree) = converted.get(&key) {
                return tree.clone();
            }
            let tree = convert(inner, converted);
            converted.insert(key, tree.clone());
            tree
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::structure;
    use crate::cfg::tests::{goto, if_goto, invoke, label, ret, switch};
    use crate::ir::MethodSig;
    use pretty_assertions::assert_eq;

    fn regions(code: Vec<crate::cfg::Code>) -> Vec<Region> {
        structure(&MethodSig::new("T", "void", "m", &[]), code).expect("structure")
    }

    /// Concrete callee-name sequences a set of paths stands for.
    fn flatten(paths: &[Path]) -> BTreeSet<Vec<String>> {
        paths.iter().flat_map(|path| flatten_path(path)).collect()
    }

    fn flatten_path(path: &[Step]) -> BTreeSet<Vec<String>> {
        path.iter().fold(BTreeSet::from([Vec::new()]), |heads, step| {
            let tails: BTreeSet<Vec<String>> = match step {
                Step::Block(calls) => {
                    BTreeSet::from([calls.iter().map(|call| call.callee.name.clone()).collect()])
                }
                Step::Nested(inner) => flatten(inner),
            };
            join(&heads, &tails)
        })
    }

    fn join(heads: &BTreeSet<Vec<String>>, tails: &BTreeSet<Vec<String>>) -> BTreeSet<Vec<String>> {
        heads
            .iter()
            .flat_map(|head| {
                tails.iter().map(move |tail| {
                    let mut path = head.clone();
                    path.extend(tail.iter().cloned());
                    path
                })
            })
            .collect()
    }

    fn expand(tree: &Tree<Rc<Invocation>>) -> BTreeSet<Vec<String>> {
        match tree {
            Tree::Leaf(call) => BTreeSet::from([vec![call.callee.name.clone()]]),
            Tree::Alt(items) => items.iter().flat_map(expand).collect(),
            Tree::Seq(items) => items
                .iter()
                .fold(BTreeSet::from([Vec::new()]), |heads, item| join(&heads, &expand(item))),
        }
    }

    fn names(paths: &[&str]) -> BTreeSet<Vec<String>> {
        paths
            .iter()
            .map(|path| path.split_whitespace().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn enumerate_forks_on_conditions_and_switches() {
        let code = vec![
            invoke("a"),
            if_goto("label1"),
            invoke("b"),
            goto("label2"),
            label("label1"),
            invoke("c"),
            label("label2"),
            switch(&["label3", "label4", "label3"]),
            label("label3"),
            invoke("d"),
            ret(),
            label("label4"),
            invoke("e"),
        ];

        let paths = enumerate(&regions(code));

        assert_eq!(names(&["a b d", "a b e", "a c d", "a c e"]), flatten(&paths));
    }

    #[test]
    fn enumerate_unrolls_back_edges_twice() {
        let code = vec![
            invoke("a"),
            if_goto("label6"),
            label("label6"),
            invoke("f"),
            if_goto("label7"),
            invoke("g"),
            goto("label6"),
            label("label7"),
            invoke("h"),
        ];

        let paths = enumerate(&regions(code));

        assert_eq!(names(&["a f h", "a f g f h", "a f g f g f h"]), flatten(&paths));
    }

    #[test]
    fn enumerate_keeps_early_exits_of_nested_boxes() {
        let code = vec![
            invoke("a"),
            if_goto("label1"),
            invoke("b"),
            ret(),
            label("label1"),
            invoke("c"),
        ];

        let paths = enumerate(&regions(code));

        assert_eq!(names(&["a b", "a c"]), flatten(&paths));
    }

    #[test]
    fn to_tree_expands_to_the_enumerated_paths() {
        let code = vec![
            invoke("a"),
            if_goto("label1"),
            invoke("b"),
            goto("label2"),
            label("label1"),
            invoke("c"),
            label("label2"),
            switch(&["label3", "label4"]),
            label("label3"),
            invoke("d"),
            goto("label5"),
            label("label4"),
            invoke("e"),
            label("label5"),
            if_goto("label6"),
            label("label6"),
            invoke("f"),
            if_goto("label7"),
            invoke("g"),
            goto("label6"),
            label("label7"),
            ret(),
        ];

        let paths = enumerate(&regions(code));
        let tree = to_tree(&paths);

        assert_eq!(flatten(&paths), expand(&tree));
        assert_eq!(tree.clone(), tree.normalize());
    }
}
