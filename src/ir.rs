use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Class table handed over by the decompiled-code parser, keyed by class name.
pub(crate) type ClassTable = BTreeMap<String, Class>;

/// Intermediate representation for a parsed JVM class.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    /// Field name to declared type.
    #[serde(default)]
    pub(crate) fields: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
}

impl Class {
    pub(crate) fn method(&self, sig: &MethodSig) -> Option<&Method> {
        self.methods.iter().find(|method| &method.sig == sig)
    }
}

/// Intermediate representation for a method and its instruction sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Method {
    pub(crate) sig: MethodSig,
    /// Local variable and parameter name to declared type.
    #[serde(default)]
    pub(crate) locals: BTreeMap<String, String>,
    /// `None` for abstract and native methods.
    #[serde(default)]
    pub(crate) code: Option<Vec<Instruction<CallSite>>>,
}

/// Fully qualified method signature. It doubles as the identity of a method.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct MethodSig {
    pub(crate) class: String,
    /// `void` when the method returns nothing.
    pub(crate) ret: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) params: Vec<String>,
}

pub(crate) const VOID: &str = "void";

impl MethodSig {
    pub(crate) fn new(class: &str, ret: &str, name: &str, params: &[&str]) -> Self {
        Self {
            class: class.to_string(),
            ret: ret.to_string(),
            name: name.to_string(),
            params: params.iter().map(|param| param.to_string()).collect(),
        }
    }

    pub(crate) fn arity(&self) -> usize {
        self.params.len()
    }

    /// Same method name and arity, ignoring the declaring class and types.
    pub(crate) fn same_shape(&self, other: &MethodSig) -> bool {
        self.name == other.name && self.arity() == other.arity()
    }

    /// Every type mentioned by the signature: class, return type, then parameters.
    pub(crate) fn types(&self) -> impl Iterator<Item = &str> {
        [self.class.as_str(), self.ret.as_str()]
            .into_iter()
            .chain(self.params.iter().map(String::as_str))
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}({})",
            self.ret,
            self.class,
            self.name,
            self.params.join(", ")
        )
    }
}

/// Instruction record produced by the textual parser. `C` is the call payload:
/// raw [`CallSite`]s before normalization, resolved invocations afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Instruction<C> {
    Invoke {
        call: C,
    },
    Return {
        #[serde(default)]
        line: Option<u32>,
    },
    Throw {
        #[serde(default)]
        line: Option<u32>,
    },
    CondBranch {
        target: String,
        #[serde(default)]
        line: Option<u32>,
    },
    Branch {
        target: String,
        #[serde(default)]
        line: Option<u32>,
    },
    MultiBranch {
        targets: Vec<String>,
        #[serde(default)]
        line: Option<u32>,
    },
    Label {
        name: String,
    },
}

impl<C> Instruction<C> {
    /// Labels this instruction may jump to.
    pub(crate) fn jump_targets(&self) -> &[String] {
        match self {
            Instruction::CondBranch { target, .. } | Instruction::Branch { target, .. } => {
                std::slice::from_ref(target)
            }
            Instruction::MultiBranch { targets, .. } => targets,
            _ => &[],
        }
    }

    pub(crate) fn map_call<D>(self, f: impl FnOnce(C) -> D) -> Instruction<D> {
        match self {
            Instruction::Invoke { call } => Instruction::Invoke { call: f(call) },
            Instruction::Return { line } => Instruction::Return { line },
            Instruction::Throw { line } => Instruction::Throw { line },
            Instruction::CondBranch { target, line } => Instruction::CondBranch { target, line },
            Instruction::Branch { target, line } => Instruction::Branch { target, line },
            Instruction::MultiBranch { targets, line } => {
                Instruction::MultiBranch { targets, line }
            }
            Instruction::Label { name } => Instruction::Label { name },
        }
    }
}

/// Call site as written in the decompiled text: value tokens, not yet typed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CallSite {
    pub(crate) kind: DispatchKind,
    /// Receiver variable, or a class name for static calls.
    pub(crate) receiver: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: Vec<String>,
    /// Variable the result is assigned to, if any.
    #[serde(default)]
    pub(crate) result: Option<String>,
    #[serde(default)]
    pub(crate) line: Option<u32>,
}

/// Call opcode classification used by dispatch resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DispatchKind {
    Static,
    Virtual,
}

/// Where an invocation was written: enclosing method, ordinal among the method's
/// invocations, and the line in the decompiled text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct Locator {
    pub(crate) method: MethodSig,
    pub(crate) ordinal: usize,
    #[serde(default)]
    pub(crate) line: Option<u32>,
}

/// A typed call: the unit deduplicated across the whole engine.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct Invocation {
    pub(crate) kind: DispatchKind,
    pub(crate) callee: MethodSig,
    /// Sorted and unique.
    #[serde(default)]
    pub(crate) literals: Vec<String>,
    #[serde(default)]
    pub(crate) locator: Option<Locator>,
}

impl Invocation {
    /// The same call site bound to another target method.
    pub(crate) fn retarget(&self, callee: &MethodSig) -> Self {
        Self {
            callee: callee.clone(),
            ..self.clone()
        }
    }

    pub(crate) fn without_locator(&self) -> Self {
        Self {
            locator: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_json_uses_op_tag() {
        let json = r#"[
            {"op": "label", "name": "label1"},
            {"op": "invoke", "call": {"kind": "virtual", "receiver": "r0", "name": "run"}},
            {"op": "multi_branch", "targets": ["label1", "label2"]},
            {"op": "return", "line": 12}
        ]"#;
        let code: Vec<Instruction<CallSite>> = serde_json::from_str(json).expect("parse code");

        assert_eq!(4, code.len());
        assert_eq!(
            code[0],
            Instruction::Label {
                name: "label1".to_string()
            }
        );
        assert!(matches!(&code[1], Instruction::Invoke { call } if call.args.is_empty()));
        assert_eq!(code[2].jump_targets(), ["label1", "label2"]);
        assert_eq!(code[3], Instruction::Return { line: Some(12) });
    }

    #[test]
    fn method_sig_lists_types_in_order() {
        let sig = MethodSig::new("A", "int", "f", &["B", "C[]"]);

        assert_eq!(vec!["A", "int", "B", "C[]"], sig.types().collect::<Vec<_>>());
        assert_eq!("int A.f(B, C[])", sig.to_string());
        assert!(sig.same_shape(&MethodSig::new("X", "void", "f", &["int", "int"])));
        assert!(!sig.same_shape(&MethodSig::new("A", "int", "f", &["B"])));
    }
}
