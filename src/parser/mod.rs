//! Recursive-descent parser for policy text.
//!
//! Precedence, loosest first: `if`, `||`, `&&`, relations (`==`, `<`, `in`,
//! `has`, `like`, `is`; non-associative), `+ -`, `*`, unary `! -`, member
//! access and method calls, primaries.

pub(crate) mod lexer;

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::ast::{
    BinaryOp, Clause, ClauseKind, Effect, EntityReference, Expr, Literal, Pattern, Policy,
    ScopeConstraint, SlotId, UnaryOp, Var,
};
use crate::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use crate::error::PolicyError;
use crate::policy_set::PolicySet;
use crate::types::{EntityUid, PolicyId};

use lexer::{Token, TokenKind, tokenize, unescape, unescape_pattern};

/// Words that cannot be written as bare attribute names.
pub(crate) static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "true", "false", "if", "then", "else", "in", "is", "like", "has",
    ]
    .into_iter()
    .collect()
});

/// True when `name` can follow `.` or `has` without quoting.
pub(crate) fn is_bare_attr(name: &str) -> bool {
    lexer::is_ident(name) && !RESERVED_WORDS.contains(name)
}

pub fn parse_policy_set(text: &str) -> Result<PolicySet, PolicyError> {
    let mut parser = Parser::new(text)?;
    let mut set = PolicySet::new();
    let mut index = 0;
    while !parser.at_eof() {
        let policy = parser.policy(PolicyId::default_for_position(index))?;
        set.add(policy)?;
        index += 1;
    }
    debug!(
        event = "Parse",
        phase = "PolicySet",
        policies = index,
        "Parsed policy text"
    );
    Ok(set)
}

pub fn parse_policy(text: &str, id: Option<PolicyId>) -> Result<Policy, PolicyError> {
    let mut parser = Parser::new(text)?;
    let policy = parser.policy(id.unwrap_or_else(|| PolicyId::default_for_position(0)))?;
    parser.expect_eof("expected exactly one policy")?;
    Ok(policy)
}

pub fn parse_expression(text: &str) -> Result<Expr, PolicyError> {
    let mut parser = Parser::new(text)?;
    let expr = parser.bounded_expr()?;
    parser.expect_eof("unexpected input after expression")?;
    Ok(expr)
}

pub fn parse_entity_uid(text: &str) -> Result<EntityUid, PolicyError> {
    let mut parser = Parser::new(text)?;
    let uid = parser.entity_uid()?;
    parser.expect_eof("unexpected input after entity uid")?;
    Ok(uid)
}

/// A type path, or a full uid when the path ended in `::"id"`.
pub(crate) enum NameOrUid {
    Name(String),
    Uid(EntityUid),
}

pub(crate) struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(input: &'a str) -> Result<Self, PolicyError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
            depth: 0,
        })
    }

    // ---- token helpers, shared with the schema text parser ----

    pub(crate) fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    pub(crate) fn peek_at(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    pub(crate) fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    pub(crate) fn at_eof(&self) -> bool {
        *self.peek() == TokenKind::Eof
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> PolicyError {
        let offset = self.tokens[self.pos.min(self.tokens.len() - 1)].start;
        PolicyError::syntax(self.input, offset, message)
    }

    fn unexpected(&self, wanted: &str) -> PolicyError {
        self.error(format!("expected {wanted}, found {}", self.peek()))
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind) -> Result<(), PolicyError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    pub(crate) fn expect_eof(&self, message: &str) -> Result<(), PolicyError> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(self.error(format!("{message}, found {}", self.peek())))
        }
    }

    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(name) if name == keyword)
    }

    pub(crate) fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_keyword(&mut self, keyword: &str) -> Result<(), PolicyError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{keyword}`")))
        }
    }

    pub(crate) fn expect_ident(&mut self) -> Result<String, PolicyError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    pub(crate) fn expect_string(&mut self) -> Result<String, PolicyError> {
        match self.peek() {
            TokenKind::Str(raw) => {
                let decoded = unescape(raw).map_err(|e| self.error(e))?;
                self.advance();
                Ok(decoded)
            }
            _ => Err(self.unexpected("a string literal")),
        }
    }

    /// `Ident ("::" Ident)*`, optionally followed by `::"id"`.
    pub(crate) fn name_or_uid(&mut self) -> Result<NameOrUid, PolicyError> {
        let mut path = self.expect_ident()?;
        while *self.peek() == TokenKind::PathSep {
            match self.peek_at(1).clone() {
                TokenKind::Ident(segment) => {
                    self.advance();
                    self.advance();
                    path.push_str("::");
                    path.push_str(&segment);
                }
                TokenKind::Str(_) => {
                    self.advance();
                    let id = self.expect_string()?;
                    return Ok(NameOrUid::Uid(EntityUid::new_unchecked(path, id)));
                }
                _ => {
                    self.advance();
                    return Err(self.unexpected("an identifier or entity id"));
                }
            }
        }
        Ok(NameOrUid::Name(path))
    }

    pub(crate) fn type_path(&mut self) -> Result<String, PolicyError> {
        match self.name_or_uid()? {
            NameOrUid::Name(name) => Ok(name),
            NameOrUid::Uid(uid) => Err(self.error(format!(
                "expected an entity type, found entity {uid}"
            ))),
        }
    }

    pub(crate) fn entity_uid(&mut self) -> Result<EntityUid, PolicyError> {
        match self.name_or_uid()? {
            NameOrUid::Uid(uid) => Ok(uid),
            NameOrUid::Name(name) => Err(self.error(format!(
                "expected an entity uid like {name}::\"id\""
            ))),
        }
    }

    // ---- policies ----

    fn policy(&mut self, default_id: PolicyId) -> Result<Policy, PolicyError> {
        let mut id = default_id;
        let mut annotations = BTreeMap::new();
        while self.eat(&TokenKind::At) {
            let key = self.expect_ident()?;
            self.expect(TokenKind::LParen)?;
            let value = self.expect_string()?;
            self.expect(TokenKind::RParen)?;
            if key == "id" {
                id = PolicyId::new(value);
            } else if annotations.insert(key.clone(), value).is_some() {
                return Err(self.error(format!("duplicate annotation `@{key}`")));
            }
        }

        let effect = match self.peek() {
            TokenKind::Ident(word) if word == "permit" => Effect::Permit,
            TokenKind::Ident(word) if word == "forbid" => Effect::Forbid,
            _ => return Err(self.unexpected("`permit` or `forbid`")),
        };
        self.advance();

        self.expect(TokenKind::LParen)?;
        let principal = self.entity_scope(Var::Principal, SlotId::Principal)?;
        self.expect(TokenKind::Comma)?;
        let action = self.action_scope()?;
        self.expect(TokenKind::Comma)?;
        let resource = self.entity_scope(Var::Resource, SlotId::Resource)?;
        self.expect(TokenKind::RParen)?;

        let mut conditions = Vec::new();
        loop {
            let kind = if self.eat_keyword("when") {
                ClauseKind::When
            } else if self.eat_keyword("unless") {
                ClauseKind::Unless
            } else {
                break;
            };
            self.expect(TokenKind::LBrace)?;
            let body = self.bounded_expr()?;
            self.expect(TokenKind::RBrace)?;
            conditions.push(Clause { kind, body });
        }
        self.expect(TokenKind::Semi)?;

        let mut policy = Policy::new(id, effect, principal, action, resource, conditions);
        for (key, value) in annotations {
            policy = policy.with_annotation(key, value);
        }
        Ok(policy)
    }

    fn entity_scope(&mut self, var: Var, slot: SlotId) -> Result<ScopeConstraint, PolicyError> {
        self.expect_keyword(&var.to_string())?;
        if self.eat(&TokenKind::EqEq) {
            return Ok(ScopeConstraint::Eq(self.entity_ref(slot)?));
        }
        if self.eat_keyword("in") {
            return Ok(ScopeConstraint::In(self.entity_ref(slot)?));
        }
        if self.eat_keyword("is") {
            let entity_type = self.type_path()?;
            if self.eat_keyword("in") {
                return Ok(ScopeConstraint::IsIn(entity_type, self.entity_ref(slot)?));
            }
            return Ok(ScopeConstraint::Is(entity_type));
        }
        Ok(ScopeConstraint::All)
    }

    fn entity_ref(&mut self, slot: SlotId) -> Result<EntityReference, PolicyError> {
        if self.eat(&TokenKind::Question) {
            let name = self.expect_ident()?;
            let found = format!("?{name}");
            if found != slot.to_string() {
                return Err(self.error(format!("expected slot {slot} here, found {found}")));
            }
            return Ok(EntityReference::Slot(slot));
        }
        Ok(EntityReference::Uid(self.entity_uid()?))
    }

    fn action_scope(&mut self) -> Result<ScopeConstraint, PolicyError> {
        self.expect_keyword("action")?;
        if self.eat(&TokenKind::EqEq) {
            return Ok(ScopeConstraint::Eq(EntityReference::Uid(self.entity_uid()?)));
        }
        if self.eat_keyword("in") {
            if !self.eat(&TokenKind::LBracket) {
                return Ok(ScopeConstraint::In(EntityReference::Uid(self.entity_uid()?)));
            }
            let mut uids = Vec::new();
            if !self.eat(&TokenKind::RBracket) {
                loop {
                    uids.push(self.entity_uid()?);
                    if self.eat(&TokenKind::RBracket) {
                        break;
                    }
                    self.expect(TokenKind::Comma)?;
                }
            }
            return Ok(ScopeConstraint::InList(uids));
        }
        if self.is_keyword("is") {
            return Err(self.error("`is` is not allowed in the action scope"));
        }
        Ok(ScopeConstraint::All)
    }

    // ---- expressions ----

    fn enter(&mut self) -> Result<(), PolicyError> {
        self.depth += 1;
        if self.depth > DEFAULT_MAX_EXPRESSION_DEPTH {
            return Err(self.nesting_error());
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn nesting_error(&self) -> PolicyError {
        self.error(format!(
            "expression nesting exceeds the limit of {DEFAULT_MAX_EXPRESSION_DEPTH}"
        ))
    }

    /// Chains like `a || b || c` are parsed in a loop but nest one level per
    /// link in the tree, so each link counts against the limit.
    fn chain_link(&self, links: &mut usize) -> Result<(), PolicyError> {
        *links += 1;
        if *links > DEFAULT_MAX_EXPRESSION_DEPTH {
            return Err(self.nesting_error());
        }
        Ok(())
    }

    /// A full expression whose tree fits within the evaluator's default depth.
    fn bounded_expr(&mut self) -> Result<Expr, PolicyError> {
        let expr = self.expr()?;
        if expr.depth() > DEFAULT_MAX_EXPRESSION_DEPTH {
            return Err(self.nesting_error());
        }
        Ok(expr)
    }

    pub(crate) fn expr(&mut self) -> Result<Expr, PolicyError> {
        self.enter()?;
        let result = if self.eat_keyword("if") {
            self.if_tail()
        } else {
            self.or()
        };
        self.leave();
        result
    }

    fn if_tail(&mut self) -> Result<Expr, PolicyError> {
        let cond = self.expr()?;
        self.expect_keyword("then")?;
        let then_expr = self.expr()?;
        self.expect_keyword("else")?;
        let else_expr = self.expr()?;
        Ok(Expr::If {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn or(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.and()?;
        let mut links = 0;
        while self.eat(&TokenKind::OrOr) {
            self.chain_link(&mut links)?;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.relation()?;
        let mut links = 0;
        while self.eat(&TokenKind::AndAnd) {
            self.chain_link(&mut links)?;
            let right = self.relation()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn relation(&mut self) -> Result<Expr, PolicyError> {
        let left = self.additive()?;
        let op = match self.peek() {
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::NotEq,
            TokenKind::Less => BinaryOp::Less,
            TokenKind::LessEq => BinaryOp::LessEq,
            TokenKind::Greater => BinaryOp::Greater,
            TokenKind::GreaterEq => BinaryOp::GreaterEq,
            TokenKind::Ident(word) if word == "in" => BinaryOp::In,
            TokenKind::Ident(word) if word == "has" => {
                self.advance();
                let attr = match self.peek() {
                    TokenKind::Str(_) => self.expect_string()?,
                    _ => self.expect_ident()?,
                };
                return Ok(Expr::has_attr(left, attr));
            }
            TokenKind::Ident(word) if word == "like" => {
                self.advance();
                let TokenKind::Str(raw) = self.peek().clone() else {
                    return Err(self.unexpected("a pattern string"));
                };
                let elems = unescape_pattern(&raw).map_err(|e| self.error(e))?;
                self.advance();
                return Ok(Expr::Like {
                    expr: Box::new(left),
                    pattern: Pattern::new(elems),
                });
            }
            TokenKind::Ident(word) if word == "is" => {
                self.advance();
                let entity_type = self.type_path()?;
                let in_expr = if self.eat_keyword("in") {
                    Some(Box::new(self.additive()?))
                } else {
                    None
                };
                return Ok(Expr::Is {
                    expr: Box::new(left),
                    entity_type,
                    in_expr,
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.multiplicative()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            self.chain_link(&mut links)?;
            let right = self.multiplicative()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.unary()?;
        let mut links = 0;
        while self.eat(&TokenKind::Star) {
            self.chain_link(&mut links)?;
            let right = self.unary()?;
            left = Expr::binary(BinaryOp::Mul, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, PolicyError> {
        self.enter()?;
        let result = match self.peek() {
            TokenKind::Bang => {
                self.advance();
                self.unary().map(|arg| Expr::unary(UnaryOp::Not, arg))
            }
            TokenKind::Minus => {
                if let TokenKind::Int(n) = *self.peek_at(1) {
                    self.advance();
                    let negated = self.negative_literal(n);
                    self.advance();
                    negated.and_then(|lit| self.member_suffix(lit))
                } else {
                    self.advance();
                    self.unary().map(|arg| Expr::unary(UnaryOp::Neg, arg))
                }
            }
            _ => self.primary().and_then(|base| self.member_suffix(base)),
        };
        self.leave();
        result
    }

    fn negative_literal(&self, magnitude: u64) -> Result<Expr, PolicyError> {
        0i64.checked_sub_unsigned(magnitude)
            .map(|n| Expr::Lit(Literal::Long(n)))
            .ok_or_else(|| self.error(format!("integer literal -{magnitude} is out of range")))
    }

    fn member_suffix(&mut self, mut expr: Expr) -> Result<Expr, PolicyError> {
        let mut links = 0;
        loop {
            if *self.peek() == TokenKind::Dot || *self.peek() == TokenKind::LBracket {
                self.chain_link(&mut links)?;
            }
            if self.eat(&TokenKind::Dot) {
                let name = self.expect_ident()?;
                if *self.peek() == TokenKind::LParen {
                    expr = self.method_call(expr, &name)?;
                } else {
                    expr = Expr::get_attr(expr, name);
                }
            } else if *self.peek() == TokenKind::LBracket
                && matches!(self.peek_at(1), TokenKind::Str(_))
            {
                self.advance();
                let attr = self.expect_string()?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::get_attr(expr, attr);
            } else {
                return Ok(expr);
            }
        }
    }

    fn method_call(&mut self, receiver: Expr, name: &str) -> Result<Expr, PolicyError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.expr()?);
                if self.eat(&TokenKind::RParen) {
                    break;
                }
                self.expect(TokenKind::Comma)?;
            }
        }

        if name == "isEmpty" {
            if !args.is_empty() {
                return Err(self.error("`isEmpty` takes no arguments"));
            }
            return Ok(Expr::unary(UnaryOp::IsEmpty, receiver));
        }
        let Some(op) = BinaryOp::from_symbol(name).filter(|op| op.is_method()) else {
            return Err(self.error(format!("unknown method `{name}`")));
        };
        let mut args = args.into_iter();
        match (args.next(), args.next()) {
            (Some(arg), None) => Ok(Expr::binary(op, receiver, arg)),
            _ => Err(self.error(format!("`{name}` takes exactly one argument"))),
        }
    }

    fn primary(&mut self) -> Result<Expr, PolicyError> {
        match self.peek().clone() {
            TokenKind::Int(n) => {
                let value = i64::try_from(n)
                    .map_err(|_| self.error(format!("integer literal {n} is out of range")))?;
                self.advance();
                Ok(Expr::Lit(Literal::Long(value)))
            }
            TokenKind::Str(_) => Ok(Expr::Lit(Literal::String(self.expect_string()?))),
            TokenKind::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Lit(Literal::Bool(word == "true")))
                }
                _ if *self.peek_at(1) != TokenKind::PathSep => match word.parse::<Var>() {
                    Ok(var) => {
                        self.advance();
                        Ok(Expr::Var(var))
                    }
                    Err(_) if *self.peek_at(1) == TokenKind::LParen => Err(self.error(format!(
                        "extension function `{word}` is not supported"
                    ))),
                    Err(_) => Err(self.error(format!("unexpected identifier `{word}`"))),
                },
                _ => match self.name_or_uid()? {
                    NameOrUid::Uid(uid) => Ok(Expr::Lit(Literal::EntityUid(uid))),
                    NameOrUid::Name(name) => Err(self.error(format!(
                        "extension function `{name}` is not supported"
                    ))),
                },
            },
            TokenKind::Question => {
                self.advance();
                let name = self.expect_ident()?;
                format!("?{name}")
                    .parse::<SlotId>()
                    .map(Expr::Slot)
                    .map_err(|_| self.error(format!("unknown slot `?{name}`")))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&TokenKind::RBracket) {
                            break;
                        }
                        self.expect(TokenKind::Comma)?;
                    }
                }
                Ok(Expr::Set(items))
            }
            TokenKind::LBrace => {
                self.advance();
                self.record_tail()
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn record_tail(&mut self) -> Result<Expr, PolicyError> {
        let mut fields: Vec<(String, Expr)> = Vec::new();
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::Record(fields));
        }
        loop {
            let key = match self.peek() {
                TokenKind::Str(_) => self.expect_string()?,
                _ => self.expect_ident()?,
            };
            if fields.iter().any(|(k, _)| *k == key) {
                return Err(self.error(format!("duplicate record key `{key}`")));
            }
            self.expect(TokenKind::Colon)?;
            fields.push((key, self.expr()?));
            if self.eat(&TokenKind::RBrace) {
                return Ok(Expr::Record(fields));
            }
            self.expect(TokenKind::Comma)?;
        }
    }
}
