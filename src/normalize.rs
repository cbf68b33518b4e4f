use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::ir::{CallSite, Class, ClassTable, Instruction, Invocation, Locator, Method, MethodSig, VOID};

static CLASS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.$]+(\[\])*$").expect("valid class name regex"));

const PRIMITIVES: [&str; 8] = [
    "byte", "short", "int", "long", "boolean", "char", "float", "double",
];

pub(crate) fn is_primitive(typ: &str) -> bool {
    PRIMITIVES.contains(&typ)
}

/// Static type of a value token, plus the token itself when it is a string literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TypedValue {
    pub(crate) typ: String,
    pub(crate) literal: Option<String>,
}

impl TypedValue {
    fn of(typ: &str) -> Self {
        Self {
            typ: typ.to_string(),
            literal: None,
        }
    }
}

/// Classifies a value token as a literal, a local, a field, or a class name.
pub(crate) fn resolve_value(token: &str, method: &Method, class: &Class) -> Result<TypedValue> {
    if token == "null" {
        return Ok(TypedValue::of("null"));
    }
    if token.starts_with("class ") {
        return Ok(TypedValue::of("java.lang.Class"));
    }
    if token == "true" || token == "false" {
        return Ok(TypedValue::of("boolean"));
    }
    if token.starts_with('\'') {
        return Ok(TypedValue::of("char"));
    }
    if token.starts_with('"') {
        return Ok(TypedValue {
            typ: "java.lang.String".to_string(),
            literal: Some(token.to_string()),
        });
    }
    if token.starts_with(|c: char| c == '-' || c == '+' || c.is_ascii_digit()) {
        let typ = match token.chars().last() {
            Some('L') => "long",
            Some('F') => "float",
            Some('D') => "double",
            _ => "int",
        };
        return Ok(TypedValue::of(typ));
    }
    if matches!(token, "#NaN" | "#Infinity" | "#-Infinity") {
        return Ok(TypedValue::of("float"));
    }
    if let Some(typ) = method.locals.get(token).or_else(|| class.fields.get(token)) {
        return Ok(TypedValue::of(typ));
    }
    if CLASS_NAME.is_match(token) {
        return Ok(TypedValue::of(token));
    }
    Err(Error::UnresolvedValue {
        method: method.sig.clone(),
        token: token.to_string(),
    })
}

/// Types every call site of `method`, turning raw tokens into invocations.
///
/// Methods without code yield an empty sequence.
pub(crate) fn normalize_method(
    class: &Class,
    method: &Method,
) -> Result<Vec<Instruction<Rc<Invocation>>>> {
    let Some(code) = &method.code else {
        return Ok(Vec::new());
    };
    let mut ordinal = 0;
    let mut normalized = Vec::with_capacity(code.len());
    for instruction in code {
        let instruction = match instruction.clone() {
            Instruction::Invoke { call } => {
                let invocation = type_call(&call, ordinal, method, class)?;
                ordinal += 1;
                Instruction::Invoke {
                    call: Rc::new(invocation),
                }
            }
            other => other.map_call(|_| unreachable!("invoke handled above")),
        };
        normalized.push(instruction);
    }
    Ok(normalized)
}

/// String literals passed at any call site of the class table.
pub(crate) fn class_literals(classes: &ClassTable) -> Result<BTreeSet<String>> {
    let mut literals = BTreeSet::new();
    for class in classes.values() {
        for method in &class.methods {
            for instruction in normalize_method(class, method)? {
                if let Instruction::Invoke { call } = instruction {
                    literals.extend(call.literals.iter().cloned());
                }
            }
        }
    }
    Ok(literals)
}

fn type_call(call: &CallSite, ordinal: usize, method: &Method, class: &Class) -> Result<Invocation> {
    let mut literals = BTreeSet::new();
    let receiver = resolve_value(&call.receiver, method, class)?;
    literals.extend(receiver.literal);
    let mut params = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        let value = resolve_value(arg, method, class)?;
        literals.extend(value.literal);
        params.push(value.typ);
    }
    let ret = match &call.result {
        Some(result) => {
            let value = resolve_value(result, method, class)?;
            literals.extend(value.literal);
            value.typ
        }
        None => VOID.to_string(),
    };
    Ok(Invocation {
        kind: call.kind,
        callee: MethodSig {
            class: receiver.typ,
            ret,
            name: call.name.clone(),
            params,
        },
        literals: literals.into_iter().collect(),
        locator: Some(Locator {
            method: method.sig.clone(),
            ordinal,
            line: call.line,
        }),
    })
}
