//! Expression syntax tree.
//!
//! Both the text parser and the JSON tree decoder produce these nodes, and
//! both printers consume them, so the two representations stay in lockstep.

mod policy;

pub use policy::{Clause, ClauseKind, Effect, EntityReference, Policy, ScopeConstraint, SlotId};

use std::collections::BTreeSet;

use strum_macros::{Display, EnumString};

use crate::types::{EntityUid, Value};

/// The four request variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Var {
    Principal,
    Action,
    Resource,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    Bool(bool),
    Long(i64),
    String(String),
    EntityUid(EntityUid),
}

impl From<Literal> for Value {
    fn from(lit: Literal) -> Self {
        match lit {
            Literal::Bool(b) => Value::Bool(b),
            Literal::Long(n) => Value::Long(n),
            Literal::String(s) => Value::String(s),
            Literal::EntityUid(uid) => Value::Entity(uid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    IsEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    In,
    Add,
    Sub,
    Mul,
    Contains,
    ContainsAll,
    ContainsAny,
}

impl BinaryOp {
    /// Operator token or method name, which is also its key in the JSON tree.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Contains => "contains",
            BinaryOp::ContainsAll => "containsAll",
            BinaryOp::ContainsAny => "containsAny",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::NotEq,
            "<" => BinaryOp::Less,
            "<=" => BinaryOp::LessEq,
            ">" => BinaryOp::Greater,
            ">=" => BinaryOp::GreaterEq,
            "in" => BinaryOp::In,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "contains" => BinaryOp::Contains,
            "containsAll" => BinaryOp::ContainsAll,
            "containsAny" => BinaryOp::ContainsAny,
            _ => return None,
        })
    }

    /// Written as `receiver.method(arg)` rather than infix.
    pub fn is_method(self) -> bool {
        matches!(
            self,
            BinaryOp::Contains | BinaryOp::ContainsAll | BinaryOp::ContainsAny
        )
    }
}

/// One element of a `like` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternElem {
    Char(char),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(Vec<PatternElem>);

impl Pattern {
    pub fn new(elems: Vec<PatternElem>) -> Self {
        Self(elems)
    }

    pub fn elems(&self) -> &[PatternElem] {
        &self.0
    }

    /// Glob match where `Wildcard` spans any run of characters, including none.
    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        let pat = &self.0;
        let (mut t, mut p) = (0, 0);
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match pat.get(p) {
                Some(PatternElem::Wildcard) => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                Some(PatternElem::Char(c)) if *c == text[t] => {
                    p += 1;
                    t += 1;
                }
                _ => match backtrack {
                    Some((star_p, star_t)) => {
                        p = star_p + 1;
                        t = star_t + 1;
                        backtrack = Some((star_p, star_t + 1));
                    }
                    None => return false,
                },
            }
        }
        pat[p..].iter().all(|e| *e == PatternElem::Wildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Lit(Literal),
    Var(Var),
    Slot(SlotId),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    If {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    GetAttr {
        expr: Box<Expr>,
        attr: String,
    },
    HasAttr {
        expr: Box<Expr>,
        attr: String,
    },
    Like {
        expr: Box<Expr>,
        pattern: Pattern,
    },
    Is {
        expr: Box<Expr>,
        entity_type: String,
        in_expr: Option<Box<Expr>>,
    },
    Set(Vec<Expr>),
    /// Keys are unique; source order is kept for printing.
    Record(Vec<(String, Expr)>),
}

impl Expr {
    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        Expr::Unary {
            op,
            arg: Box::new(arg),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn get_attr(expr: Expr, attr: impl Into<String>) -> Self {
        Expr::GetAttr {
            expr: Box::new(expr),
            attr: attr.into(),
        }
    }

    pub fn has_attr(expr: Expr, attr: impl Into<String>) -> Self {
        Expr::HasAttr {
            expr: Box::new(expr),
            attr: attr.into(),
        }
    }

    /// Slots referenced anywhere in this expression.
    pub fn slots(&self) -> BTreeSet<SlotId> {
        let mut found = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Slot(slot) = e {
                found.insert(*slot);
            }
        });
        found
    }

    /// Replace linked slots with entity literals; unbound slots are kept.
    pub(crate) fn substitute_slots(&self, bind: &dyn Fn(SlotId) -> Option<EntityUid>) -> Expr {
        let sub = |e: &Expr| Box::new(e.substitute_slots(bind));
        match self {
            Expr::Slot(slot) => match bind(*slot) {
                Some(uid) => Expr::Lit(Literal::EntityUid(uid)),
                None => self.clone(),
            },
            Expr::Lit(_) | Expr::Var(_) => self.clone(),
            Expr::Unary { op, arg } => Expr::Unary {
                op: *op,
                arg: sub(arg),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: sub(left),
                right: sub(right),
            },
            Expr::And(l, r) => Expr::And(sub(l), sub(r)),
            Expr::Or(l, r) => Expr::Or(sub(l), sub(r)),
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => Expr::If {
                cond: sub(cond),
                then_expr: sub(then_expr),
                else_expr: sub(else_expr),
            },
            Expr::GetAttr { expr, attr } => Expr::GetAttr {
                expr: sub(expr),
                attr: attr.clone(),
            },
            Expr::HasAttr { expr, attr } => Expr::HasAttr {
                expr: sub(expr),
                attr: attr.clone(),
            },
            Expr::Like { expr, pattern } => Expr::Like {
                expr: sub(expr),
                pattern: pattern.clone(),
            },
            Expr::Is {
                expr,
                entity_type,
                in_expr,
            } => Expr::Is {
                expr: sub(expr),
                entity_type: entity_type.clone(),
                in_expr: in_expr.as_deref().map(sub),
            },
            Expr::Set(items) => Expr::Set(items.iter().map(|e| e.substitute_slots(bind)).collect()),
            Expr::Record(fields) => Expr::Record(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), e.substitute_slots(bind)))
                    .collect(),
            ),
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Lit(_) | Expr::Var(_) | Expr::Slot(_) => Vec::new(),
            Expr::Unary { arg, .. } => vec![arg],
            Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                vec![left, right]
            }
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => vec![cond, then_expr, else_expr],
            Expr::GetAttr { expr, .. } | Expr::HasAttr { expr, .. } | Expr::Like { expr, .. } => {
                vec![expr]
            }
            Expr::Is { expr, in_expr, .. } => {
                std::iter::once(&**expr).chain(in_expr.as_deref()).collect()
            }
            Expr::Set(items) => items.iter().collect(),
            Expr::Record(fields) => fields.iter().map(|(_, e)| e).collect(),
        }
    }

    /// Edges on the longest path from this node to a leaf; a literal is 0.
    /// This is the depth the evaluator reaches, computed without recursion.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0)];
        while let Some((expr, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(expr.children().into_iter().map(|child| (child, depth + 1)));
        }
        deepest
    }

    /// Pre-order walk over every node.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Lit(_) | Expr::Var(_) | Expr::Slot(_) => {}
            Expr::Unary { arg, .. } => arg.visit(f),
            Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.visit(f);
                right.visit(f);
            }
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => {
                cond.visit(f);
                then_expr.visit(f);
                else_expr.visit(f);
            }
            Expr::GetAttr { expr, .. } | Expr::HasAttr { expr, .. } | Expr::Like { expr, .. } => {
                expr.visit(f)
            }
            Expr::Is { expr, in_expr, .. } => {
                expr.visit(f);
                if let Some(in_expr) = in_expr {
                    in_expr.visit(f);
                }
            }
            Expr::Set(items) => items.iter().for_each(|e| e.visit(f)),
            Expr::Record(fields) => fields.iter().for_each(|(_, e)| e.visit(f)),
        }
    }
}

impl From<Literal> for Expr {
    fn from(lit: Literal) -> Self {
        Expr::Lit(lit)
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Self {
        Expr::Var(var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    fn pattern(s: &str) -> Pattern {
        Pattern::new(crate::parser::lexer::unescape_pattern(s).unwrap())
    }

    #[parameterized(
        exact = { "abc", "abc", true },
        prefix = { "ab*", "abcdef", true },
        suffix = { "*.jpg", "vacation.jpg", true },
        middle = { "a*c", "abbbc", true },
        empty_run = { "a*c", "ac", true },
        only_star = { "*", "", true },
        multiple_stars = { "*a*b*", "xxaxxbxx", true },
        backtracking = { "*ab", "aab", true },
        mismatch = { "a*c", "abd", false },
        literal_star = { r"a\*", "a*", true },
        literal_star_no_glob = { r"a\*", "ab", false },
        too_short = { "abc", "ab", false },
    )]
    fn test_like_matching(pat: &str, text: &str, expected: bool) {
        assert_eq!(pattern(pat).matches(text), expected);
    }

    #[test]
    fn test_var_strings() {
        assert_eq!(Var::Principal.to_string(), "principal");
        assert_eq!("context".parse::<Var>().unwrap(), Var::Context);
        assert!("Principal".parse::<Var>().is_err());
    }

    #[test]
    fn test_binary_op_symbols_round_trip() {
        for op in [
            BinaryOp::Eq,
            BinaryOp::NotEq,
            BinaryOp::Less,
            BinaryOp::LessEq,
            BinaryOp::Greater,
            BinaryOp::GreaterEq,
            BinaryOp::In,
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Contains,
            BinaryOp::ContainsAll,
            BinaryOp::ContainsAny,
        ] {
            assert_eq!(BinaryOp::from_symbol(op.symbol()), Some(op));
        }
    }

    #[test]
    fn test_substitute_slots() {
        let uid: EntityUid = r#"User::"alice""#.parse().unwrap();
        let expr = Expr::binary(BinaryOp::Eq, Expr::Var(Var::Principal), Expr::Slot(SlotId::Principal));
        assert_eq!(expr.slots().len(), 1);
        let linked = expr.substitute_slots(&|slot| (slot == SlotId::Principal).then(|| uid.clone()));
        assert!(linked.slots().is_empty());
    }
}
