use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::ir::{ClassTable, DispatchKind, Invocation, MethodSig, VOID};
use crate::normalize::is_primitive;

/// Subtype distances between the classes and interfaces of a class table.
#[derive(Debug, Default)]
pub(crate) struct ClassHierarchy {
    /// Ancestor to descendant to the length of the shortest inheritance chain.
    descendants: HashMap<String, BTreeMap<String, usize>>,
}

impl ClassHierarchy {
    pub(crate) fn new(classes: &ClassTable) -> Self {
        let mut descendants: HashMap<String, BTreeMap<String, usize>> = HashMap::new();
        for class in classes.values() {
            let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(class.name.as_str(), 0)]);
            let mut seen = BTreeSet::from([class.name.as_str()]);
            while let Some((name, distance)) = queue.pop_front() {
                let Some(current) = classes.get(name) else {
                    continue;
                };
                for parent in current.super_name.iter().chain(&current.interfaces) {
                    if seen.insert(parent.as_str()) {
                        descendants
                            .entry(parent.clone())
                            .or_default()
                            .insert(class.name.clone(), distance + 1);
                        queue.push_back((parent.as_str(), distance + 1));
                    }
                }
            }
        }
        Self { descendants }
    }

    /// Number of inheritance steps from `sub` up to `sup`, if `sub` is a
    /// proper descendant.
    pub(crate) fn distance(&self, sup: &str, sub: &str) -> Option<usize> {
        self.descendants.get(sup)?.get(sub).copied()
    }

    /// Proper descendants of `class`, in name order.
    pub(crate) fn descendants_of(&self, class: &str) -> impl Iterator<Item = (&str, usize)> {
        self.descendants
            .get(class)
            .into_iter()
            .flatten()
            .map(|(name, distance)| (name.as_str(), *distance))
    }

    /// How far a value of static type `sub` is from being a `sup`, or `None`
    /// when it is not assignable at all.
    pub(crate) fn is_a(&self, sub: &str, sup: &str) -> Option<usize> {
        if sub == sup {
            return Some(0);
        }
        if sub == VOID || sup == VOID {
            return None;
        }
        if sub == "null" {
            return if is_primitive(sup) { None } else { Some(0) };
        }
        let (mut sub, mut sup) = (sub, sup);
        while let (Some(sub_elem), Some(sup_elem)) = (sub.strip_suffix("[]"), sup.strip_suffix("[]")) {
            sub = sub_elem;
            sup = sup_elem;
        }
        if sub.ends_with("[]") || sup.ends_with("[]") {
            return None;
        }
        if sub == sup {
            return Some(0);
        }
        self.distance(sup, sub)
    }
}

type DispatchKey = (String, String, usize);

fn dispatch_key(class: &str, sig: &MethodSig) -> DispatchKey {
    (class.to_string(), sig.name.clone(), sig.arity())
}

/// Every method a call on a receiver type may land on, keyed by receiver class,
/// method name and arity.
#[derive(Debug, Default)]
pub(crate) struct DispatchTable {
    hierarchy: ClassHierarchy,
    /// Sorted candidate definitions.
    candidates: HashMap<DispatchKey, Vec<MethodSig>>,
}

impl DispatchTable {
    pub(crate) fn new(classes: &ClassTable) -> Self {
        let hierarchy = ClassHierarchy::new(classes);
        let declared = |class: &str, shape: &MethodSig| -> Vec<MethodSig> {
            classes
                .get(class)
                .map(|class| {
                    class
                        .methods
                        .iter()
                        .filter(|method| method.sig.same_shape(shape))
                        .map(|method| method.sig.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut candidates: HashMap<DispatchKey, BTreeSet<MethodSig>> = HashMap::new();
        // Declarations and their overrides.
        for class in classes.values() {
            for method in &class.methods {
                let entry = candidates.entry(dispatch_key(&class.name, &method.sig)).or_default();
                entry.extend(declared(&class.name, &method.sig));
                for (descendant, _) in hierarchy.descendants_of(&class.name) {
                    entry.extend(declared(descendant, &method.sig));
                }
            }
        }
        // Methods inherited without being redeclared take the nearest
        // ancestor's declaration.
        for class in classes.values() {
            let mut ancestors: Vec<(usize, &str)> = hierarchy
                .descendants
                .iter()
                .filter_map(|(ancestor, descendants)| {
                    descendants
                        .get(&class.name)
                        .map(|distance| (*distance, ancestor.as_str()))
                })
                .collect();
            ancestors.sort();
            let mut inherited: BTreeMap<DispatchKey, usize> = BTreeMap::new();
            for (distance, ancestor) in ancestors {
                let Some(ancestor_class) = classes.get(ancestor) else {
                    continue;
                };
                for method in &ancestor_class.methods {
                    let key = dispatch_key(&class.name, &method.sig);
                    if class.methods.iter().any(|own| own.sig.same_shape(&method.sig)) {
                        continue;
                    }
                    let nearest = *inherited.entry(key.clone()).or_insert(distance);
                    if nearest != distance {
                        continue;
                    }
                    let entry = candidates.entry(key).or_default();
                    entry.insert(method.sig.clone());
                    for (descendant, _) in hierarchy.descendants_of(&class.name) {
                        entry.extend(declared(descendant, &method.sig));
                    }
                }
            }
        }

        log::debug!("dispatch table with {} receiver keys", candidates.len());
        Self {
            hierarchy,
            candidates: candidates
                .into_iter()
                .map(|(key, sigs)| (key, sigs.into_iter().collect()))
                .collect(),
        }
    }

    pub(crate) fn hierarchy(&self) -> &ClassHierarchy {
        &self.hierarchy
    }

    /// Candidates recorded for a receiver class, method name and arity, before
    /// any applicability filtering.
    pub(crate) fn candidates(&self, class: &str, shape: &MethodSig) -> &[MethodSig] {
        self.candidates
            .get(&dispatch_key(class, shape))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Methods an invocation may dispatch to, closest match first.
    ///
    /// Every applicable candidate is kept, even when one overload is more
    /// specific than another.
    pub(crate) fn resolve(&self, invocation: &Invocation) -> Vec<MethodSig> {
        let call = &invocation.callee;
        let mut ranked: Vec<(usize, &MethodSig)> = self
            .candidates(&call.class, call)
            .iter()
            .filter(|candidate| {
                invocation.kind != DispatchKind::Static || candidate.class == call.class
            })
            .filter_map(|candidate| {
                let mut total = 0;
                for (arg, param) in call.params.iter().zip(&candidate.params) {
                    total += self.hierarchy.is_a(arg, param)?;
                }
                if call.ret != VOID {
                    self.hierarchy.is_a(&candidate.ret, &call.ret)?;
                }
                Some((total, candidate))
            })
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, candidate)| candidate.clone()).collect()
    }
}
