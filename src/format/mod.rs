//! Deterministic pretty-printer for policies.

mod doc;

use doc::Doc;

use crate::ast::{
    BinaryOp, Clause, EntityReference, Expr, Literal, Policy, ScopeConstraint, UnaryOp,
};
use crate::config::FormatConfig;
use crate::error::PolicyError;
use crate::parser::is_bare_attr;
use crate::parser::lexer::{escape, escape_pattern, is_ident};
use crate::policy_set::PolicySet;
use crate::types::PolicyId;

/// Parse `text` and print it back in canonical layout.
pub fn format_policies(text: &str, config: &FormatConfig) -> Result<String, PolicyError> {
    let set: PolicySet = text.parse()?;
    Ok(policy_set_to_pretty(&set, config))
}

/// Static policies then templates, one blank line apart. Links are not printed.
pub(crate) fn policy_set_to_pretty(set: &PolicySet, config: &FormatConfig) -> String {
    let rendered: Vec<String> = set
        .policies()
        .iter()
        .chain(set.templates())
        .enumerate()
        .map(|(position, policy)| policy_to_pretty(policy, position, config))
        .collect();
    if rendered.is_empty() {
        return "\n".to_string();
    }
    rendered.join("\n")
}

/// `position` decides whether the id needs an explicit `@id`.
pub(crate) fn policy_to_pretty(policy: &Policy, position: usize, config: &FormatConfig) -> String {
    let mut out = Printer { config }
        .policy(policy, position)
        .render(config.line_width);
    out.push('\n');
    out
}

struct Printer<'a> {
    config: &'a FormatConfig,
}

impl Printer<'_> {
    fn indent(&self) -> usize {
        self.config.indent_width
    }

    fn policy(&self, policy: &Policy, position: usize) -> Doc {
        let mut parts = Vec::new();
        if *policy.id() != PolicyId::default_for_position(position) {
            parts.push(annotation("id", policy.id().as_str()));
            parts.push(Doc::HardLine);
        }
        for (key, value) in policy.annotations() {
            parts.push(annotation(key, value));
            parts.push(Doc::HardLine);
        }

        parts.push(Doc::text(format!("{} (", policy.effect())));
        parts.push(Doc::nest(
            self.indent(),
            Doc::concat([
                Doc::HardLine,
                self.scope("principal", policy.principal()),
                Doc::text(","),
                Doc::HardLine,
                self.scope("action", policy.action()),
                Doc::text(","),
                Doc::HardLine,
                self.scope("resource", policy.resource()),
            ]),
        ));
        parts.push(Doc::HardLine);
        parts.push(Doc::text(")"));

        for clause in policy.conditions() {
            parts.push(Doc::HardLine);
            parts.push(self.clause(clause));
        }
        parts.push(Doc::text(";"));
        Doc::concat(parts)
    }

    fn scope(&self, var: &str, scope: &ScopeConstraint) -> Doc {
        let reference = |r: &EntityReference| r.to_string();
        match scope {
            ScopeConstraint::All => Doc::text(var),
            ScopeConstraint::Eq(r) => Doc::text(format!("{var} == {}", reference(r))),
            ScopeConstraint::In(r) => Doc::text(format!("{var} in {}", reference(r))),
            ScopeConstraint::Is(t) => Doc::text(format!("{var} is {t}")),
            ScopeConstraint::IsIn(t, r) => {
                Doc::text(format!("{var} is {t} in {}", reference(r)))
            }
            ScopeConstraint::InList(uids) => Doc::concat([
                Doc::text(format!("{var} in ")),
                self.bracketed("[", uids.iter().map(|u| Doc::text(u.to_string())), "]"),
            ]),
        }
    }

    fn clause(&self, clause: &Clause) -> Doc {
        Doc::group(Doc::concat([
            Doc::text(format!("{} {{", clause.kind)),
            Doc::nest(
                self.indent(),
                Doc::concat([Doc::Line, self.expr(&clause.body)]),
            ),
            Doc::Line,
            Doc::text("}"),
        ]))
    }

    fn bracketed(&self, open: &str, items: impl IntoIterator<Item = Doc>, close: &str) -> Doc {
        Doc::group(Doc::concat([
            Doc::text(open),
            Doc::nest(
                self.indent(),
                Doc::concat([
                    Doc::SoftLine,
                    Doc::join(items, Doc::concat([Doc::text(","), Doc::Line])),
                ]),
            ),
            Doc::SoftLine,
            Doc::text(close),
        ]))
    }

    /// Print `expr`, parenthesized when it binds looser than `min`.
    fn child(&self, expr: &Expr, min: u8) -> Doc {
        let doc = self.expr(expr);
        if precedence(expr) < min {
            parens(doc)
        } else {
            doc
        }
    }

    fn expr(&self, expr: &Expr) -> Doc {
        match expr {
            Expr::Lit(lit) => Doc::text(literal(lit)),
            Expr::Var(var) => Doc::text(var.to_string()),
            Expr::Slot(slot) => Doc::text(slot.to_string()),
            Expr::And(..) => self.chain(expr, "&&"),
            Expr::Or(..) => self.chain(expr, "||"),
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => Doc::group(Doc::concat([
                Doc::text("if "),
                self.expr(cond),
                Doc::nest(
                    self.indent(),
                    Doc::concat([
                        Doc::Line,
                        Doc::text("then "),
                        self.expr(then_expr),
                        Doc::Line,
                        Doc::text("else "),
                        self.expr(else_expr),
                    ]),
                ),
            ])),
            Expr::Unary { op, arg } => match op {
                UnaryOp::Not => Doc::concat([Doc::text("!"), self.child(arg, 6)]),
                UnaryOp::Neg if starts_with_digit(arg) => {
                    Doc::concat([Doc::text("-"), parens(self.expr(arg))])
                }
                UnaryOp::Neg => Doc::concat([Doc::text("-"), self.child(arg, 6)]),
                UnaryOp::IsEmpty => Doc::concat([self.child(arg, 7), Doc::text(".isEmpty()")]),
            },
            Expr::Binary { op, left, right } if op.is_method() => Doc::concat([
                self.child(left, 7),
                Doc::text(format!(".{}(", op.symbol())),
                self.expr(right),
                Doc::text(")"),
            ]),
            Expr::Binary { op, left, right } => {
                let (left_min, right_min) = match op {
                    BinaryOp::Add | BinaryOp::Sub => (4, 5),
                    BinaryOp::Mul => (5, 6),
                    _ => (4, 4),
                };
                Doc::concat([
                    self.child(left, left_min),
                    Doc::text(format!(" {} ", op.symbol())),
                    self.child(right, right_min),
                ])
            }
            Expr::GetAttr { expr, attr } => {
                let access = if is_bare_attr(attr) {
                    format!(".{attr}")
                } else {
                    format!("[\"{}\"]", escape(attr))
                };
                Doc::concat([self.child(expr, 7), Doc::text(access)])
            }
            Expr::HasAttr { expr, attr } => {
                let name = if is_bare_attr(attr) {
                    attr.clone()
                } else {
                    format!("\"{}\"", escape(attr))
                };
                Doc::concat([self.child(expr, 4), Doc::text(format!(" has {name}"))])
            }
            Expr::Like { expr, pattern } => Doc::concat([
                self.child(expr, 4),
                Doc::text(format!(" like \"{}\"", escape_pattern(pattern.elems()))),
            ]),
            Expr::Is {
                expr,
                entity_type,
                in_expr,
            } => {
                let mut parts = vec![
                    self.child(expr, 4),
                    Doc::text(format!(" is {entity_type}")),
                ];
                if let Some(in_expr) = in_expr {
                    parts.push(Doc::text(" in "));
                    parts.push(self.child(in_expr, 4));
                }
                Doc::concat(parts)
            }
            Expr::Set(items) => self.bracketed("[", items.iter().map(|e| self.expr(e)), "]"),
            Expr::Record(fields) => self.bracketed(
                "{",
                fields.iter().map(|(key, value)| {
                    let key = if is_ident(key) {
                        key.clone()
                    } else {
                        format!("\"{}\"", escape(key))
                    };
                    Doc::concat([Doc::text(format!("{key}: ")), self.expr(value)])
                }),
                "}",
            ),
        }
    }

    /// `a && b && c` as one group that breaks after each operator.
    fn chain(&self, expr: &Expr, symbol: &str) -> Doc {
        let mut operands = Vec::new();
        let mut current = expr;
        loop {
            match (current, symbol) {
                (Expr::And(l, r), "&&") | (Expr::Or(l, r), "||") => {
                    operands.push(r.as_ref());
                    current = l;
                }
                _ => {
                    operands.push(current);
                    break;
                }
            }
        }
        operands.reverse();

        let level = if symbol == "&&" { 2 } else { 1 };
        let docs = operands.iter().enumerate().map(|(idx, operand)| {
            // Left-most operand may sit at the chain's own level; the rest must bind tighter.
            let min = if idx == 0 { level } else { level + 1 };
            self.child(operand, min)
        });
        Doc::group(Doc::join(
            docs,
            Doc::concat([Doc::text(format!(" {symbol}")), Doc::Line]),
        ))
    }
}

fn annotation(key: &str, value: &str) -> Doc {
    Doc::text(format!("@{key}(\"{}\")", escape(value)))
}

fn parens(doc: Doc) -> Doc {
    Doc::concat([Doc::text("("), doc, Doc::text(")")])
}

fn literal(lit: &Literal) -> String {
    match lit {
        Literal::Bool(b) => b.to_string(),
        Literal::Long(n) => n.to_string(),
        Literal::String(s) => format!("\"{}\"", escape(s)),
        Literal::EntityUid(uid) => uid.to_string(),
    }
}

/// Binding strength, loosest first: if, ||, &&, relations, + -, *, unary,
/// member access, primaries.
fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::If { .. } => 0,
        Expr::Or(..) => 1,
        Expr::And(..) => 2,
        Expr::HasAttr { .. } | Expr::Like { .. } | Expr::Is { .. } => 3,
        Expr::Binary { op, .. } => match op {
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul => 5,
            op if op.is_method() => 7,
            _ => 3,
        },
        Expr::Unary {
            op: UnaryOp::IsEmpty,
            ..
        } => 7,
        Expr::Unary { .. } => 6,
        Expr::Lit(Literal::Long(n)) if *n < 0 => 6,
        Expr::GetAttr { .. } => 7,
        Expr::Lit(_) | Expr::Var(_) | Expr::Slot(_) | Expr::Set(_) | Expr::Record(_) => 8,
    }
}

/// True when printing `expr` starts with a bare digit, which a leading `-`
/// would fold into a negative literal.
fn starts_with_digit(expr: &Expr) -> bool {
    match expr {
        Expr::Lit(Literal::Long(n)) => *n >= 0,
        Expr::GetAttr { expr, .. }
        | Expr::Unary {
            op: UnaryOp::IsEmpty,
            arg: expr,
        } => starts_with_digit(expr),
        Expr::Binary { op, left, .. } if op.is_method() => starts_with_digit(left),
        _ => false,
    }
}
