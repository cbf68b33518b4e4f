use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::ir::{Instruction, Invocation, MethodSig};

/// Instruction after normalization.
pub(crate) type Code = Instruction<Rc<Invocation>>;

/// Structured region of a method body.
///
/// `Op` only ever holds control-flow instructions; invocations always live in
/// a `Block`. A `Box` has a single entry and a single exit with respect to its
/// siblings: no jump crosses its border.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Region {
    Block(Rc<[Rc<Invocation>]>),
    Box(Vec<Region>),
    Op(Code),
}

/// Merges chained labels and drops jumps that go nowhere new.
pub(crate) fn clean_up(code: Vec<Code>) -> Vec<Code> {
    remove_redundant_jumps(merge_labels(code))
}

fn merge_labels(code: Vec<Code>) -> Vec<Code> {
    let mut label_order = HashMap::new();
    for (index, instruction) in code.iter().enumerate() {
        if let Instruction::Label { name } = instruction {
            label_order.entry(name.clone()).or_insert(index);
        }
    }

    let mut reduced: Vec<Code> = Vec::with_capacity(code.len());
    let mut replace: HashMap<String, String> = HashMap::new();
    for instruction in code {
        let previous_label = match reduced.last() {
            Some(Instruction::Label { name }) => Some(name.clone()),
            _ => None,
        };
        match (&instruction, previous_label) {
            (Instruction::Label { name: dst }, Some(src)) => {
                replace.insert(src, dst.clone());
                reduced.pop();
            }
            (Instruction::Branch { target: dst, .. }, Some(src))
                if matches!(
                    (label_order.get(&src), label_order.get(dst)),
                    (Some(s), Some(d)) if s < d
                ) =>
            {
                replace.insert(src, dst.clone());
                reduced.pop();
            }
            _ => {}
        }
        reduced.push(instruction);
    }
    if replace.is_empty() {
        return reduced;
    }

    // Resolve replacement chains to their final label.
    let sources: Vec<String> = replace.keys().cloned().collect();
    for src in sources {
        let mut seen = BTreeSet::from([src.clone()]);
        let mut dst = replace[&src].clone();
        while let Some(next) = replace.get(&dst) {
            if !seen.insert(dst.clone()) {
                break;
            }
            dst = next.clone();
        }
        replace.insert(src, dst);
    }

    let redirect = |label: String| replace.get(&label).cloned().unwrap_or(label);
    reduced
        .into_iter()
        .map(|instruction| match instruction {
            Instruction::CondBranch { target, line } => Instruction::CondBranch {
                target: redirect(target),
                line,
            },
            Instruction::Branch { target, line } => Instruction::Branch {
                target: redirect(target),
                line,
            },
            Instruction::MultiBranch { targets, line } => Instruction::MultiBranch {
                targets: targets.into_iter().map(&redirect).collect(),
                line,
            },
            other => other,
        })
        .collect()
}

fn remove_redundant_jumps(code: Vec<Code>) -> Vec<Code> {
    let mut reduced: Vec<Code> = Vec::with_capacity(code.len());
    for instruction in code {
        match instruction {
            Instruction::CondBranch { ref target, .. } => {
                let duplicated = reduced
                    .iter()
                    .rev()
                    .map_while(|prev| match prev {
                        Instruction::CondBranch { target, .. } => Some(target),
                        _ => None,
                    })
                    .any(|prev_target| prev_target == target);
                if !duplicated {
                    reduced.push(instruction);
                }
            }
            Instruction::Branch { .. } => {
                // A jump right after another jump is unreachable.
                if !matches!(reduced.last(), Some(Instruction::Branch { .. })) {
                    reduced.push(instruction);
                }
            }
            Instruction::Label { ref name } => {
                let jumps_here = matches!(
                    reduced.last(),
                    Some(Instruction::CondBranch { target, .. } | Instruction::Branch { target, .. })
                        if target == name
                );
                if jumps_here {
                    reduced.pop();
                }
                reduced.push(instruction);
            }
            Instruction::MultiBranch { targets, line } => {
                let mut seen = BTreeSet::new();
                let targets = targets
                    .into_iter()
                    .filter(|target| seen.insert(target.clone()))
                    .collect();
                reduced.push(Instruction::MultiBranch { targets, line });
            }
            other => reduced.push(other),
        }
    }
    reduced
}

/// Groups a method's instructions into nested blocks and boxes.
pub(crate) fn structure(method: &MethodSig, code: Vec<Code>) -> Result<Vec<Region>> {
    let defined: BTreeSet<&str> = code
        .iter()
        .filter_map(|instruction| match instruction {
            Instruction::Label { name } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    let mut label_refs: HashMap<String, usize> = HashMap::new();
    for instruction in &code {
        for target in instruction.jump_targets() {
            if !defined.contains(target.as_str()) {
                return Err(Error::UndefinedLabel {
                    method: method.clone(),
                    label: target.clone(),
                });
            }
            *label_refs.entry(target.clone()).or_default() += 1;
        }
    }

    let regions = basic_blocks(code);
    let regions = make_boxes(regions);
    Ok(flatten_loops(regions, &label_refs))
}

fn basic_blocks(code: Vec<Code>) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut current: Vec<Rc<Invocation>> = Vec::new();
    for instruction in code {
        match instruction {
            Instruction::Invoke { call } => current.push(call),
            other => {
                if !current.is_empty() {
                    regions.push(Region::Block(std::mem::take(&mut current).into()));
                }
                regions.push(Region::Op(other));
            }
        }
    }
    if !current.is_empty() {
        regions.push(Region::Block(current.into()));
    }
    regions
}

/// Wraps each smallest interval that contains all of its jumps into a box,
/// recursively.
fn make_boxes(regions: Vec<Region>) -> Vec<Region> {
    let spans = box_spans(&regions);
    let mut remaining = regions.into_iter();
    let mut boxed = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        let mut chunk: Vec<Region> = remaining.by_ref().take(end - start).collect();
        if chunk.len() == 1 {
            boxed.extend(chunk.pop());
            continue;
        }
        let mut inner = make_boxes(chunk);
        if inner.len() == 1 {
            boxed.extend(inner.pop());
        } else {
            boxed.push(Region::Box(inner));
        }
    }
    boxed
}

fn box_spans(regions: &[Region]) -> Vec<(usize, usize)> {
    let mut label_index = HashMap::new();
    for (index, region) in regions.iter().enumerate() {
        if let Region::Op(Instruction::Label { name }) = region {
            label_index.insert(name.as_str(), index);
        }
    }
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); regions.len()];
    for (index, region) in regions.iter().enumerate() {
        if let Region::Op(instruction) = region {
            for target in instruction.jump_targets() {
                if let Some(&dest) = label_index.get(target.as_str()) {
                    edges[index].push(dest);
                    edges[dest].push(index);
                }
            }
        }
    }

    let len = regions.len();
    let mut spans = Vec::new();
    let mut start = 0;
    while start < len {
        let mut reach = start;
        let mut end = start + 1;
        let mut found = None;
        'extend: while end <= len {
            for &endpoint in &edges[end - 1] {
                if endpoint < start {
                    break 'extend;
                }
                reach = reach.max(endpoint);
            }
            if reach < end && (start, end) != (0, len) {
                found = Some(end);
                break;
            }
            end += 1;
        }
        let end = found.unwrap_or(start + 1);
        spans.push((start, end));
        start = end;
    }
    spans
}

/// Collapses simple loops whose labels are referenced by the loop alone, so
/// that their bodies count as a single pass.
fn flatten_loops(regions: Vec<Region>, label_refs: &HashMap<String, usize>) -> Vec<Region> {
    let mut regions: Vec<Region> = regions
        .into_iter()
        .map(|region| match region {
            Region::Box(inner) => collapse(flatten_loops(inner, label_refs)),
            other => other,
        })
        .collect();

    loop {
        let mut changed = false;
        let mut flattened = Vec::with_capacity(regions.len());
        let mut index = 0;
        while index < regions.len() {
            match match_loop(&regions[index..], label_refs) {
                Some((consumed, replacement)) => {
                    flattened.extend(replacement);
                    index += consumed;
                    changed = true;
                }
                None => {
                    flattened.push(regions[index].clone());
                    index += 1;
                }
            }
        }
        regions = flattened;
        if !changed {
            break;
        }
    }
    merge_adjacent_blocks(regions)
}

fn match_loop(
    window: &[Region],
    label_refs: &HashMap<String, usize>,
) -> Option<(usize, Option<Region>)> {
    let is_loop = |head: &Region, exit: &Region, back: &Region, tail: &Region| {
        let (
            Region::Op(Instruction::Label { name: head }),
            Region::Op(Instruction::CondBranch { target: exit, .. }),
            Region::Op(Instruction::Branch { target: back, .. }),
            Region::Op(Instruction::Label { name: tail }),
        ) = (head, exit, back, tail)
        else {
            return false;
        };
        head == back
            && exit == tail
            && label_refs.get(head) == Some(&1)
            && label_refs.get(tail) == Some(&1)
    };
    let is_body = |region: &Region| matches!(region, Region::Block(_) | Region::Box(_));

    match window {
        [head, exit, back, tail, ..] if is_loop(head, exit, back, tail) => Some((4, None)),
        [head, exit, body, back, tail, ..] if is_body(body) && is_loop(head, exit, back, tail) => {
            Some((5, Some(body.clone())))
        }
        [head, body, exit, back, tail, ..] if is_body(body) && is_loop(head, exit, back, tail) => {
            Some((5, Some(body.clone())))
        }
        [head, first, exit, second, back, tail, ..]
            if is_body(first) && is_body(second) && is_loop(head, exit, back, tail) =>
        {
            let merged = merge_adjacent_blocks(vec![first.clone(), second.clone()]);
            Some((6, Some(collapse(merged))))
        }
        _ => None,
    }
}

fn merge_adjacent_blocks(regions: Vec<Region>) -> Vec<Region> {
    let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        if let (Some(Region::Block(previous)), Region::Block(next)) = (merged.last_mut(), &region) {
            let calls: Vec<Rc<Invocation>> = previous.iter().chain(next.iter()).cloned().collect();
            *previous = calls.into();
            continue;
        }
        merged.push(region);
    }
    merged
}

fn collapse(mut regions: Vec<Region>) -> Region {
    if regions.len() == 1 {
        if let Some(region) = regions.pop() {
            return region;
        }
    }
    Region::Box(regions)
}

/// Largest number of ways out of any single level of nesting.
pub(crate) fn branch_count(regions: &[Region]) -> usize {
    let mut own = 0;
    let mut nested = 0;
    for region in regions {
        match region {
            Region::Op(Instruction::CondBranch { .. })
            | Region::Op(Instruction::Return { .. })
            | Region::Op(Instruction::Throw { .. }) => own += 1,
            Region::Op(Instruction::MultiBranch { targets, .. }) => own += targets.len(),
            Region::Box(inner) => nested = nested.max(branch_count(inner)),
            _ => {}
        }
    }
    own.max(nested)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ir::DispatchKind;

    pub(crate) fn invoke(name: &str) -> Code {
        Instruction::Invoke {
            call: Rc::new(call(name)),
        }
    }

    pub(crate) fn call(name: &str) -> Invocation {
        Invocation {
            kind: DispatchKind::Static,
            callee: MethodSig::new("T", "void", name, &[]),
            literals: Vec::new(),
            locator: None,
        }
    }

    pub(crate) fn label(name: &str) -> Code {
        Instruction::Label {
            name: name.to_string(),
        }
    }

    pub(crate) fn if_goto(target: &str) -> Code {
        Instruction::CondBranch {
            target: target.to_string(),
            line: None,
        }
    }

    pub(crate) fn goto(target: &str) -> Code {
        Instruction::Branch {
            target: target.to_string(),
            line: None,
        }
    }

    pub(crate) fn switch(targets: &[&str]) -> Code {
        Instruction::MultiBranch {
            targets: targets.iter().map(|target| target.to_string()).collect(),
            line: None,
        }
    }

    pub(crate) fn ret() -> Code {
        Instruction::Return { line: None }
    }

    fn method() -> MethodSig {
        MethodSig::new("T", "void", "m", &[])
    }

    fn block(names: &[&str]) -> Region {
        Region::Block(names.iter().map(|name| Rc::new(call(name))).collect())
    }

    fn op(code: Code) -> Region {
        Region::Op(code)
    }

    #[test]
    fn clean_up_merges_consecutive_labels() {
        let code = vec![
            if_goto("label1"),
            invoke("a"),
            label("label1"),
            label("label2"),
            invoke("b"),
            goto("label2"),
        ];

        let cleaned = clean_up(code);

        assert_eq!(
            vec![
                if_goto("label2"),
                invoke("a"),
                label("label2"),
                invoke("b"),
                goto("label2"),
            ],
            cleaned
        );
    }

    #[test]
    fn clean_up_redirects_label_followed_by_forward_jump() {
        let code = vec![
            if_goto("label1"),
            invoke("a"),
            label("label1"),
            goto("label2"),
            invoke("b"),
            label("label2"),
            ret(),
        ];

        let cleaned = clean_up(code);

        assert_eq!(
            vec![
                if_goto("label2"),
                invoke("a"),
                goto("label2"),
                invoke("b"),
                label("label2"),
                ret(),
            ],
            cleaned
        );
    }

    #[test]
    fn clean_up_drops_jump_to_next_label_and_duplicate_targets() {
        let code = vec![
            if_goto("label1"),
            if_goto("label1"),
            invoke("a"),
            goto("label1"),
            label("label1"),
            switch(&["label1", "label1"]),
        ];

        let cleaned = clean_up(code);

        assert_eq!(
            vec![if_goto("label1"), invoke("a"), label("label1"), switch(&["label1"])],
            cleaned
        );
    }

    #[test]
    fn structure_rejects_undefined_label() {
        let result = structure(&method(), vec![goto("nowhere")]);

        assert!(matches!(result, Err(Error::UndefinedLabel { label, .. }) if label == "nowhere"));
    }

    #[test]
    fn structure_boxes_an_if_statement() {
        let code = vec![
            invoke("a"),
            if_goto("label1"),
            invoke("b"),
            label("label1"),
            invoke("c"),
            ret(),
        ];

        let regions = structure(&method(), code).expect("structure");

        assert_eq!(
            vec![
                block(&["a"]),
                Region::Box(vec![op(if_goto("label1")), block(&["b"]), op(label("label1"))]),
                block(&["c"]),
                op(ret()),
            ],
            regions
        );
    }

    #[test]
    fn structure_keeps_independent_regions_apart() {
        let code = vec![
            if_goto("label1"),
            invoke("a"),
            label("label1"),
            if_goto("label2"),
            invoke("b"),
            label("label2"),
        ];

        let regions = structure(&method(), code).expect("structure");

        assert_eq!(
            vec![
                Region::Box(vec![op(if_goto("label1")), block(&["a"]), op(label("label1"))]),
                Region::Box(vec![op(if_goto("label2")), block(&["b"]), op(label("label2"))]),
            ],
            regions
        );
    }

    #[test]
    fn structure_flattens_while_loop() {
        let code = vec![
            invoke("a"),
            label("label0"),
            if_goto("label1"),
            invoke("b"),
            goto("label0"),
            label("label1"),
            invoke("c"),
        ];

        let regions = structure(&method(), code).expect("structure");

        assert_eq!(vec![block(&["a", "b", "c"])], regions);
    }

    #[test]
    fn structure_keeps_loop_with_shared_labels() {
        let code = vec![
            label("label0"),
            if_goto("label1"),
            invoke("b"),
            if_goto("label0"),
            goto("label0"),
            label("label1"),
        ];

        let regions = structure(&method(), code).expect("structure");

        assert!(regions
            .iter()
            .any(|region| matches!(region, Region::Op(Instruction::Branch { .. }))));
    }

    #[test]
    fn branch_count_takes_busiest_level() {
        let regions = vec![
            op(if_goto("label1")),
            Region::Box(vec![op(switch(&["x", "y", "z"])), op(ret())]),
            op(ret()),
        ];

        assert_eq!(4, branch_count(&regions));
    }
}
