//! Expression evaluation against one request.

use std::collections::BTreeMap;

use crate::ast::{BinaryOp, Clause, ClauseKind, Expr, UnaryOp, Var};
use crate::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use crate::error::EvaluationError;
use crate::traits::EntityLookup;
use crate::types::{Context, EntityUid, Request, Value};

/// Bindings for the four request variables plus entity access.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub principal: &'a EntityUid,
    pub action: &'a EntityUid,
    pub resource: &'a EntityUid,
    pub context: &'a Context,
    pub entities: &'a dyn EntityLookup,
}

impl<'a> Env<'a> {
    pub fn new(request: &'a Request, entities: &'a dyn EntityLookup) -> Self {
        Self {
            principal: &request.principal,
            action: &request.action,
            resource: &request.resource,
            context: &request.context,
            entities,
        }
    }
}

/// Evaluate `expr` with the default depth limit.
pub fn evaluate(expr: &Expr, env: &Env<'_>) -> Result<Value, EvaluationError> {
    Evaluator::new(*env).evaluate(expr)
}

pub struct Evaluator<'a> {
    env: Env<'a>,
    max_depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(env: Env<'a>) -> Self {
        Self {
            env,
            max_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value, EvaluationError> {
        self.eval(expr, 0)
    }

    /// True when the clause is satisfied: `when` bodies must be true,
    /// `unless` bodies false.
    pub fn clause_holds(&self, clause: &Clause) -> Result<bool, EvaluationError> {
        let value = self.evaluate(&clause.body)?.as_bool()?;
        Ok(match clause.kind {
            ClauseKind::When => value,
            ClauseKind::Unless => !value,
        })
    }

    fn eval(&self, expr: &Expr, depth: usize) -> Result<Value, EvaluationError> {
        if depth > self.max_depth {
            return Err(EvaluationError::RecursionLimit {
                limit: self.max_depth,
            });
        }
        let next = depth + 1;

        match expr {
            Expr::Lit(lit) => Ok(lit.clone().into()),
            Expr::Var(var) => Ok(self.var(*var)),
            Expr::Slot(slot) => Err(EvaluationError::UnlinkedSlot(slot.to_string())),
            Expr::Unary { op, arg } => {
                let value = self.eval(arg, next)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.as_bool()?)),
                    UnaryOp::Neg => value
                        .as_long()?
                        .checked_neg()
                        .map(Value::Long)
                        .ok_or_else(|| overflow("-")),
                    UnaryOp::IsEmpty => Ok(Value::Bool(value.as_set()?.is_empty())),
                }
            }
            Expr::And(left, right) => {
                if !self.eval(left, next)?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right, next)?.as_bool()?))
            }
            Expr::Or(left, right) => {
                if self.eval(left, next)?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right, next)?.as_bool()?))
            }
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => {
                if self.eval(cond, next)?.as_bool()? {
                    self.eval(then_expr, next)
                } else {
                    self.eval(else_expr, next)
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, next)?;
                let right = self.eval(right, next)?;
                self.binary(*op, left, right)
            }
            Expr::GetAttr { expr, attr } => self.get_attr(expr, attr, next),
            Expr::HasAttr { expr, attr } => self.has_attr(expr, attr, next),
            Expr::Like { expr, pattern } => {
                let value = self.eval(expr, next)?;
                Ok(Value::Bool(pattern.matches(value.as_str()?)))
            }
            Expr::Is {
                expr,
                entity_type,
                in_expr,
            } => {
                let value = self.eval(expr, next)?;
                let uid = value.as_entity()?;
                if uid.entity_type() != entity_type {
                    return Ok(Value::Bool(false));
                }
                match in_expr {
                    None => Ok(Value::Bool(true)),
                    Some(in_expr) => {
                        let target = self.eval(in_expr, next)?;
                        self.hierarchy(uid, &target).map(Value::Bool)
                    }
                }
            }
            Expr::Set(items) => items
                .iter()
                .map(|item| self.eval(item, next))
                .collect::<Result<_, _>>()
                .map(Value::Set),
            Expr::Record(fields) => fields
                .iter()
                .map(|(k, e)| Ok((k.clone(), self.eval(e, next)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Record),
        }
    }

    fn var(&self, var: Var) -> Value {
        match var {
            Var::Principal => Value::Entity(self.env.principal.clone()),
            Var::Action => Value::Entity(self.env.action.clone()),
            Var::Resource => Value::Entity(self.env.resource.clone()),
            Var::Context => Value::Record(self.env.context.as_map().clone()),
        }
    }

    fn get_attr(&self, expr: &Expr, attr: &str, depth: usize) -> Result<Value, EvaluationError> {
        // `context.x` reads straight from the request without copying the record.
        if let Expr::Var(Var::Context) = expr {
            return self
                .env
                .context
                .get(attr)
                .cloned()
                .ok_or_else(|| not_found("context", attr));
        }
        match self.eval(expr, depth)? {
            Value::Entity(uid) => {
                let entity = self
                    .env
                    .entities
                    .entity(&uid)
                    .ok_or_else(|| EvaluationError::UnknownEntity(uid.clone()))?;
                entity
                    .attr(attr)
                    .cloned()
                    .ok_or_else(|| not_found(&uid.to_string(), attr))
            }
            Value::Record(mut fields) => fields
                .remove(attr)
                .ok_or_else(|| not_found("record", attr)),
            other => Err(EvaluationError::type_mismatch(
                "entity or record",
                other.type_name(),
            )),
        }
    }

    fn has_attr(&self, expr: &Expr, attr: &str, depth: usize) -> Result<Value, EvaluationError> {
        if let Expr::Var(Var::Context) = expr {
            return Ok(Value::Bool(self.env.context.get(attr).is_some()));
        }
        match self.eval(expr, depth)? {
            Value::Entity(uid) => Ok(Value::Bool(
                self.env
                    .entities
                    .entity(&uid)
                    .is_some_and(|entity| entity.attr(attr).is_some()),
            )),
            Value::Record(fields) => Ok(Value::Bool(fields.contains_key(attr))),
            other => Err(EvaluationError::type_mismatch(
                "entity or record",
                other.type_name(),
            )),
        }
    }

    fn binary(&self, op: BinaryOp, left: Value, right: Value) -> Result<Value, EvaluationError> {
        let compare = |f: fn(&i64, &i64) -> bool| -> Result<Value, EvaluationError> {
            Ok(Value::Bool(f(&left.as_long()?, &right.as_long()?)))
        };
        let arith = |f: fn(i64, i64) -> Option<i64>| -> Result<Value, EvaluationError> {
            f(left.as_long()?, right.as_long()?)
                .map(Value::Long)
                .ok_or_else(|| overflow(op.symbol()))
        };

        match op {
            BinaryOp::Eq => Ok(Value::Bool(left == right)),
            BinaryOp::NotEq => Ok(Value::Bool(left != right)),
            BinaryOp::Less => compare(i64::lt),
            BinaryOp::LessEq => compare(i64::le),
            BinaryOp::Greater => compare(i64::gt),
            BinaryOp::GreaterEq => compare(i64::ge),
            BinaryOp::Add => arith(i64::checked_add),
            BinaryOp::Sub => arith(i64::checked_sub),
            BinaryOp::Mul => arith(i64::checked_mul),
            BinaryOp::In => self.hierarchy(left.as_entity()?, &right).map(Value::Bool),
            BinaryOp::Contains => Ok(Value::Bool(left.as_set()?.contains(&right))),
            BinaryOp::ContainsAll => {
                let (haystack, needles) = (left.as_set()?, right.as_set()?);
                Ok(Value::Bool(needles.is_subset(haystack)))
            }
            BinaryOp::ContainsAny => {
                let (haystack, needles) = (left.as_set()?, right.as_set()?);
                Ok(Value::Bool(!needles.is_disjoint(haystack)))
            }
        }
    }

    /// `uid in target`, where target is an entity or a set of entities.
    ///
    /// Equality holds without a lookup; anything else needs `uid` in the store.
    fn hierarchy(&self, uid: &EntityUid, target: &Value) -> Result<bool, EvaluationError> {
        let targets: Vec<&EntityUid> = match target {
            Value::Entity(t) => vec![t],
            Value::Set(items) => items
                .iter()
                .map(Value::as_entity)
                .collect::<Result<_, _>>()?,
            other => {
                return Err(EvaluationError::type_mismatch(
                    "entity or set of entities",
                    other.type_name(),
                ));
            }
        };
        if targets.contains(&uid) {
            return Ok(true);
        }
        if targets.is_empty() {
            return Ok(false);
        }
        if !self.env.entities.contains(uid) {
            return Err(EvaluationError::UnknownEntity(uid.clone()));
        }
        Ok(targets
            .iter()
            .any(|t| self.env.entities.is_descendant(uid, t)))
    }
}

fn overflow(op: &str) -> EvaluationError {
    EvaluationError::IntegerOverflow { op: op.to_string() }
}

fn not_found(target: &str, attr: &str) -> EvaluationError {
    EvaluationError::AttributeNotFound {
        target: target.to_string(),
        attribute: attr.to_string(),
    }
}
