use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::ir::MethodSig;
use crate::summary::Summary;

/// Regular expressions for the fields of a method signature; `None` matches
/// anything.
#[derive(Clone, Debug)]
pub(crate) struct MethodPattern {
    class: Option<Regex>,
    ret: Option<Regex>,
    name: Option<Regex>,
    param: Option<Regex>,
}

impl MethodPattern {
    fn matches_callee(&self, callee: &MethodSig) -> bool {
        let field = |regex: &Option<Regex>, text: &str| regex.as_ref().is_none_or(|regex| regex.is_match(text));
        field(&self.class, &callee.class)
            && field(&self.ret, &callee.ret)
            && field(&self.name, &callee.name)
            && self
                .param
                .as_ref()
                .is_none_or(|regex| callee.params.iter().any(|param| regex.is_match(param)))
    }
}

#[derive(Clone, Debug)]
pub(crate) enum PatternKind {
    /// `"word"`: matches string literals.
    Literal(Regex),
    /// `t.word`: matches the types of a signature.
    Type(Regex),
    /// `m.word` or `m.class/ret/name/param`.
    Method(MethodPattern),
    /// Matches any part of a signature, and literals.
    Any(Regex),
}

/// One compiled query word.
#[derive(Clone, Debug)]
pub(crate) struct Pattern {
    pub(crate) word: String,
    pub(crate) kind: PatternKind,
}

/// Turns non-ASCII characters into the `\uXXXX` escapes the decompiled text
/// uses, so that they match literally.
fn escape_unicode(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else if (c as u32) <= 0xffff {
            escaped.push_str(&format!(r"\\u{:04x}", c as u32));
        } else {
            escaped.push_str(&format!(r"\\U{:08x}", c as u32));
        }
    }
    escaped
}

fn compile_regex(word: &str, expr: &str, ignore_case: bool) -> Result<Regex> {
    RegexBuilder::new(expr)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|source| Error::InvalidPattern {
            word: word.to_string(),
            source,
        })
}

impl Pattern {
    pub(crate) fn compile(word: &str, ignore_case: bool) -> Result<Self> {
        let kind = if let Some(rest) = word.strip_prefix('"') {
            let rest = rest.strip_suffix('"').unwrap_or(rest);
            PatternKind::Literal(compile_regex(word, &escape_unicode(rest), ignore_case)?)
        } else if let Some(rest) = word.strip_prefix("t.") {
            PatternKind::Type(compile_regex(word, &escape_unicode(rest), ignore_case)?)
        } else if let Some(rest) = word.strip_prefix("m.") {
            PatternKind::Method(Self::compile_method(word, &escape_unicode(rest), ignore_case)?)
        } else {
            PatternKind::Any(compile_regex(word, &escape_unicode(word), ignore_case)?)
        };
        Ok(Self {
            word: word.to_string(),
            kind,
        })
    }

    fn compile_method(word: &str, expr: &str, ignore_case: bool) -> Result<MethodPattern> {
        let fields: Vec<&str> = expr.split('/').collect();
        if fields.len() == 1 {
            return Ok(MethodPattern {
                class: None,
                ret: None,
                name: Some(compile_regex(word, expr, ignore_case)?),
                param: None,
            });
        }
        if fields.len() > 4 || fields.iter().all(|field| field.is_empty()) {
            return Err(Error::MalformedQuery(format!("invalid method pattern `{word}`")));
        }
        let field = |index: usize| -> Result<Option<Regex>> {
            match fields.get(index) {
                Some(field) if !field.is_empty() => compile_regex(word, field, ignore_case).map(Some),
                _ => Ok(None),
            }
        };
        Ok(MethodPattern {
            class: field(0)?,
            ret: field(1)?,
            name: field(2)?,
            param: field(3)?,
        })
    }

    pub(crate) fn matches_callee(&self, callee: &MethodSig) -> bool {
        match &self.kind {
            PatternKind::Literal(_) => false,
            PatternKind::Type(regex) => callee.types().any(|typ| regex.is_match(typ)),
            PatternKind::Method(method) => method.matches_callee(callee),
            PatternKind::Any(regex) => {
                regex.is_match(&callee.name) || callee.types().any(|typ| regex.is_match(typ))
            }
        }
    }

    pub(crate) fn matches_type(&self, typ: &str) -> bool {
        match &self.kind {
            PatternKind::Type(regex) | PatternKind::Any(regex) => regex.is_match(typ),
            _ => false,
        }
    }

    /// Whether a bare method name matches. Field-wise method patterns only
    /// match whole signatures.
    pub(crate) fn matches_method_name(&self, name: &str) -> bool {
        match &self.kind {
            PatternKind::Method(MethodPattern {
                class: None,
                ret: None,
                name: Some(regex),
                param: None,
            })
            | PatternKind::Any(regex) => regex.is_match(name),
            _ => false,
        }
    }

    pub(crate) fn matches_literal(&self, literal: &str) -> bool {
        match &self.kind {
            PatternKind::Literal(regex) | PatternKind::Any(regex) => regex.is_match(literal),
            _ => false,
        }
    }

    pub(crate) fn is_matched_by(&self, summary: &Summary) -> bool {
        summary.callees.iter().any(|callee| self.matches_callee(callee))
            || summary.literals.iter().any(|literal| self.matches_literal(literal))
    }
}

/// A conjunction of patterns.
#[derive(Clone, Debug)]
pub(crate) struct Query {
    patterns: Vec<Pattern>,
}

impl Query {
    /// Compiles query words; duplicate or empty words are rejected up front.
    pub(crate) fn compile(words: &[String], ignore_case: bool) -> Result<Self> {
        if words.iter().any(String::is_empty) {
            return Err(Error::MalformedQuery("empty string in query words".to_string()));
        }
        let unique: BTreeSet<&String> = words.iter().collect();
        if unique.len() != words.len() {
            return Err(Error::MalformedQuery("duplicated query words".to_string()));
        }
        let patterns = words
            .iter()
            .map(|word| Pattern::compile(word, ignore_case))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub(crate) fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Every pattern matches some callee or literal of the summary.
    pub(crate) fn is_fulfilled_by(&self, summary: &Summary) -> bool {
        self.patterns.iter().all(|pattern| pattern.is_matched_by(summary))
    }

    /// Some pattern matches some callee or literal of the summary.
    pub(crate) fn is_partially_fulfilled_by(&self, summary: &Summary) -> bool {
        summary.callees.iter().any(|callee| self.matches_callee(callee))
            || summary.literals.iter().any(|literal| self.matches_literal(literal))
    }

    pub(crate) fn matches_callee(&self, callee: &MethodSig) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches_callee(callee))
    }

    pub(crate) fn matches_type(&self, typ: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches_type(typ))
    }

    pub(crate) fn matches_method_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches_method_name(name))
    }

    /// Matches the callee as a method: by name, or field by field.
    pub(crate) fn matches_method(&self, callee: &MethodSig) -> bool {
        self.patterns.iter().any(|pattern| match &pattern.kind {
            PatternKind::Method(method) => method.matches_callee(callee),
            PatternKind::Any(regex) => regex.is_match(&callee.name),
            _ => false,
        })
    }

    pub(crate) fn matches_literal(&self, literal: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches_literal(literal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn words(words: &[&str]) -> Vec<String> {
        words.iter().map(|word| word.to_string()).collect()
    }

    fn println() -> MethodSig {
        MethodSig::new("java.io.PrintStream", "void", "println", &["java.lang.String"])
    }

    fn summary(callees: &[MethodSig], literals: &[&str]) -> Summary {
        Summary {
            callees: callees.iter().cloned().collect(),
            literals: literals.iter().map(|literal| literal.to_string()).collect(),
        }
    }

    #[test]
    fn pattern_kinds_follow_word_prefix() {
        let pattern = |word: &str| Pattern::compile(word, false).expect("compile");

        assert!(matches!(pattern("\"hello\"").kind, PatternKind::Literal(_)));
        assert!(matches!(pattern("t.PrintStream").kind, PatternKind::Type(_)));
        assert!(matches!(pattern("m.println").kind, PatternKind::Method(_)));
        assert!(matches!(pattern("println").kind, PatternKind::Any(_)));
    }

    #[test]
    fn type_pattern_ignores_method_name() {
        let by_type = Pattern::compile("t.print", false).expect("compile");
        let by_type_name = Pattern::compile("t.PrintStream", false).expect("compile");

        assert!(!by_type.matches_callee(&println()));
        assert!(by_type_name.matches_callee(&println()));
        assert!(by_type_name.matches_type("java.io.PrintStream"));
        assert!(!by_type_name.matches_method_name("PrintStream"));
    }

    #[test]
    fn method_pattern_matches_fields() {
        let callee = println();
        let matches = |word: &str| {
            Pattern::compile(word, false)
                .expect("compile")
                .matches_callee(&callee)
        };

        assert!(matches("m.println"));
        assert!(!matches("m.PrintStream"));
        assert!(matches("m.PrintStream/void/println"));
        assert!(matches("m.//print/String"));
        assert!(!matches("m.//print/int"));
        assert!(!matches("m.Writer/"));
    }

    #[test]
    fn method_pattern_rejects_malformed_fields() {
        assert!(matches!(
            Pattern::compile("m.a/b/c/d/e", false),
            Err(Error::MalformedQuery(_))
        ));
        assert!(matches!(Pattern::compile("m.//", false), Err(Error::MalformedQuery(_))));
        assert!(matches!(Pattern::compile("(", false), Err(Error::InvalidPattern { .. })));
    }

    #[test]
    fn literal_pattern_matches_quoted_literals() {
        let pattern = Pattern::compile("\"hel", false).expect("compile");

        assert!(pattern.matches_literal("\"hello\""));
        assert!(!pattern.matches_callee(&println()));
    }

    #[test]
    fn patterns_escape_non_ascii_characters() {
        let pattern = Pattern::compile("\"caf\u{e9}\"", false).expect("compile");

        assert!(pattern.matches_literal(r#""caf\u00e9""#));
        assert!(!pattern.matches_literal("\"caf\u{e9}\""));
        assert_eq!(r"smile\\U0001f600", escape_unicode("smile\u{1f600}"));
    }

    #[test]
    fn ignore_case_applies_to_every_field() {
        let pattern = Pattern::compile("m.printstream//PRINTLN", true).expect("compile");

        assert!(pattern.matches_callee(&println()));
    }

    #[test]
    fn query_rejects_duplicate_and_empty_words() {
        assert!(matches!(
            Query::compile(&words(&["a", "a"]), false),
            Err(Error::MalformedQuery(_))
        ));
        assert!(matches!(
            Query::compile(&words(&["a", ""]), false),
            Err(Error::MalformedQuery(_))
        ));
    }

    #[test]
    fn query_needs_every_pattern_matched() {
        let query = Query::compile(&words(&["println", "\"hello"]), false).expect("compile");

        assert!(query.is_fulfilled_by(&summary(&[println()], &["\"hello world\""])));
        assert!(!query.is_fulfilled_by(&summary(&[println()], &[])));
        assert!(!query.is_fulfilled_by(&summary(&[], &["\"hello world\""])));
    }

    fn universe() -> (Vec<MethodSig>, Vec<&'static str>) {
        (
            vec![
                println(),
                MethodSig::new("java.util.List", "boolean", "add", &["java.lang.Object"]),
                MethodSig::new("Main", "void", "run", &[]),
            ],
            vec!["\"hello\"", "\"world\"", "\"x\""],
        )
    }

    proptest! {
        #[test]
        fn fulfillment_is_monotone(
            small in prop::collection::vec(any::<bool>(), 6),
            extra in prop::collection::vec(any::<bool>(), 6),
        ) {
            let (callees, literals) = universe();
            let pick = |mask: &dyn Fn(usize) -> bool| {
                let picked: Vec<MethodSig> = callees
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| mask(*index))
                    .map(|(_, callee)| callee.clone())
                    .collect();
                let picked_literals: Vec<&str> = literals
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| mask(index + 3))
                    .map(|(_, literal)| *literal)
                    .collect();
                summary(&picked, &picked_literals)
            };
            let s1 = pick(&|index| small[index]);
            let s2 = pick(&|index| small[index] || extra[index]);
            let query = Query::compile(&words(&["t.String", "\"hello"]), false).expect("compile");

            prop_assert!(s1.is_subset(&s2));
            if query.is_fulfilled_by(&s1) {
                prop_assert!(query.is_fulfilled_by(&s2));
            }
        }
    }
}
