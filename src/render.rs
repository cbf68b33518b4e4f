use serde_sarif::sarif::{Location, LogicalLocation, Message, Result as SarifResult};

use crate::andor::Tree;
use crate::ir::{Invocation, MethodSig};
use crate::linenumber::LineNumberTable;
use crate::query::Query;
use crate::search::{CutItem, CutNode, Hit};

const OMITTED_PACKAGES: [&str; 1] = ["java.lang."];

const INDENT: &str = "  ";

/// One output line: nesting level, text, and source location.
type Row = (usize, String, String);

/// Compact text rendering of search excerpts.
///
/// A call node prints as `class ret name(params) {` followed by its body and
/// `}`; alternatives are introduced by `||`. Literals of a call are shown
/// only when one of them matches the query.
pub(crate) struct Renderer<'a> {
    query: &'a Query,
    lines: Option<&'a LineNumberTable>,
    fully_qualified: bool,
}

impl<'a> Renderer<'a> {
    pub(crate) fn new(query: &'a Query, lines: Option<&'a LineNumberTable>, fully_qualified: bool) -> Self {
        Self {
            query,
            lines,
            fully_qualified,
        }
    }

    pub(crate) fn render(&self, node: &CutNode) -> String {
        let mut text = String::new();
        for (depth, row, location) in self.node_rows(node, String::new()) {
            text.push_str(&INDENT.repeat(depth));
            text.push_str(&row);
            if !location.is_empty() {
                text.push('\t');
                text.push_str(&location);
            }
            text.push('\n');
        }
        text
    }

    fn node_rows(&self, node: &CutNode, location: String) -> Vec<Row> {
        let mut rows = vec![(0, format!("{} {{", self.signature(node.callee())), location)];
        rows.extend(self.literal_row(&node.invocation));
        let body = self.tree_rows(&node.body);
        if body.is_empty() {
            if let Some(last) = rows.last_mut() {
                last.1.push('}');
            }
        } else {
            rows.extend(indented(body));
            rows.push((0, "}".to_string(), String::new()));
        }
        rows
    }

    fn invoked_rows(&self, invocation: &Invocation) -> Vec<Row> {
        let mut rows = vec![(0, self.signature(&invocation.callee), self.location(invocation))];
        rows.extend(self.literal_row(invocation));
        rows
    }

    fn tree_rows(&self, tree: &Tree<CutItem>) -> Vec<Row> {
        match tree {
            Tree::Leaf(CutItem::Invoked(invocation)) => self.invoked_rows(invocation),
            Tree::Leaf(CutItem::Call(node)) => self.node_rows(node, self.location(&node.invocation)),
            Tree::Seq(items) => items.iter().flat_map(|item| self.tree_rows(item)).collect(),
            Tree::Alt(items) => {
                let alternatives: Vec<Vec<Row>> = items
                    .iter()
                    .map(|item| self.tree_rows(item))
                    .filter(|rows| !rows.is_empty())
                    .collect();
                if alternatives.len() < 2 {
                    return alternatives.into_iter().flatten().collect();
                }
                let mut rows = vec![(0, "||".to_string(), String::new())];
                rows.extend(indented(alternatives.into_iter().flatten().collect()));
                rows
            }
        }
    }

    fn literal_row(&self, invocation: &Invocation) -> Option<Row> {
        invocation
            .literals
            .iter()
            .any(|literal| self.query.matches_literal(literal))
            .then(|| (0, format!("    {}", invocation.literals.join(", ")), String::new()))
    }

    fn location(&self, invocation: &Invocation) -> String {
        let Some(lines) = self.lines else {
            return String::new();
        };
        match &invocation.locator {
            None => "-".to_string(),
            Some(locator) => match lines.locate(locator).or(locator.line) {
                Some(line) => format!("(line {line})"),
                None => "(line *)".to_string(),
            },
        }
    }

    pub(crate) fn signature(&self, sig: &MethodSig) -> String {
        let params: Vec<&str> = sig.params.iter().map(|param| self.type_name(param)).collect();
        format!(
            "{} {} {}({})",
            self.type_name(&sig.class),
            self.type_name(&sig.ret),
            sig.name,
            params.join(",")
        )
    }

    fn type_name<'t>(&self, typ: &'t str) -> &'t str {
        if self.fully_qualified {
            return typ;
        }
        OMITTED_PACKAGES
            .iter()
            .find_map(|package| typ.strip_prefix(package))
            .unwrap_or(typ)
    }

    /// One SARIF result per excerpt, or per hit when there are no excerpts.
    pub(crate) fn results(&self, hits: &[Hit]) -> Vec<SarifResult> {
        let mut results = Vec::new();
        for hit in hits {
            let location = method_location(&hit.callee);
            if hit.excerpts.is_empty() {
                results.push(
                    SarifResult::builder()
                        .message(result_message(self.signature(&hit.callee)))
                        .locations(vec![location])
                        .build(),
                );
                continue;
            }
            for excerpt in &hit.excerpts {
                results.push(
                    SarifResult::builder()
                        .message(result_message(self.render(&excerpt.node)))
                        .locations(vec![location.clone()])
                        .build(),
                );
            }
        }
        results
    }
}

fn indented(rows: Vec<Row>) -> impl Iterator<Item = Row> {
    rows.into_iter()
        .map(|(depth, text, location)| (depth + 1, text, location))
}

fn method_location(method: &MethodSig) -> Location {
    let logical = LogicalLocation::builder()
        .name(method.name.clone())
        .fully_qualified_name(method.to_string())
        .kind("function")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}
