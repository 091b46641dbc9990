//! Human-readable schema text.
//!
//! ```text
//! namespace App {
//!   entity User in [Group] { age: Long, email?: String };
//!   action view, "edit photo" in [read] appliesTo {
//!     principal: [User], resource: Photo, context: { mfa: Bool }
//!   };
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;

use crate::error::PolicyError;
use crate::parser::lexer::{TokenKind, escape, is_ident};
use crate::parser::{NameOrUid, Parser};
use crate::types::EntityUid;

use super::{
    ActionDecl, Attribute, EntityTypeDecl, Fragment, NamespaceDef, Schema, SchemaType,
    relative_name,
};

pub(crate) fn parse_fragment(text: &str) -> Result<Fragment, PolicyError> {
    let mut parser = Parser::new(text)?;
    let mut global = NamespaceDef::default();
    let mut fragment = Fragment::default();

    while !parser.at_eof() {
        if parser.eat_keyword("namespace") {
            let mut ns = NamespaceDef {
                name: parser.type_path()?,
                ..NamespaceDef::default()
            };
            parser.expect(TokenKind::LBrace)?;
            while !parser.eat(&TokenKind::RBrace) {
                declaration(&mut parser, &mut ns)?;
            }
            fragment.namespaces.push(ns);
        } else {
            declaration(&mut parser, &mut global)?;
        }
    }
    if !global.entity_types.is_empty() || !global.actions.is_empty() {
        fragment.namespaces.insert(0, global);
    }
    Ok(fragment)
}

fn declaration(parser: &mut Parser<'_>, ns: &mut NamespaceDef) -> Result<(), PolicyError> {
    if parser.eat_keyword("entity") {
        entity_declaration(parser, ns)
    } else if parser.eat_keyword("action") {
        action_declaration(parser, ns)
    } else if parser.at_eof() {
        Err(parser.error("unexpected end of input, expected `}`"))
    } else {
        Err(parser.error(format!(
            "expected `entity` or `action`, found {}",
            parser.peek()
        )))
    }
}

fn entity_declaration(parser: &mut Parser<'_>, ns: &mut NamespaceDef) -> Result<(), PolicyError> {
    let names = comma_separated(parser, |p| p.expect_ident())?;
    let member_of = if parser.eat_keyword("in") {
        type_list(parser)?
    } else {
        BTreeSet::new()
    };
    let attributes = if *parser.peek() == TokenKind::LBrace {
        record_type(parser)?
    } else {
        BTreeMap::new()
    };
    parser.expect(TokenKind::Semi)?;

    for name in names {
        ns.entity_types.push((
            name,
            EntityTypeDecl {
                member_of: member_of.clone(),
                attributes: attributes.clone(),
            },
        ));
    }
    Ok(())
}

fn action_declaration(parser: &mut Parser<'_>, ns: &mut NamespaceDef) -> Result<(), PolicyError> {
    let names = comma_separated(parser, name)?;
    let mut decl = ActionDecl::default();

    if parser.eat_keyword("in") {
        decl.member_of = if parser.eat(&TokenKind::LBracket) {
            let groups = comma_separated_until(parser, TokenKind::RBracket, action_ref)?;
            groups.into_iter().collect()
        } else {
            BTreeSet::from([action_ref(parser)?])
        };
    }

    if parser.eat_keyword("appliesTo") {
        parser.expect(TokenKind::LBrace)?;
        while !parser.eat(&TokenKind::RBrace) {
            let key = parser.expect_ident()?;
            parser.expect(TokenKind::Colon)?;
            match key.as_str() {
                "principal" => decl.principal_types = type_list(parser)?,
                "resource" => decl.resource_types = type_list(parser)?,
                "context" => decl.context = record_type(parser)?,
                other => {
                    return Err(parser.error(format!(
                        "expected `principal`, `resource` or `context`, found `{other}`"
                    )));
                }
            }
            if !parser.eat(&TokenKind::Comma) && *parser.peek() != TokenKind::RBrace {
                return Err(parser.error(format!("expected `,` or `}}`, found {}", parser.peek())));
            }
        }
    }
    parser.expect(TokenKind::Semi)?;

    for name in names {
        ns.actions.push((name, decl.clone()));
    }
    Ok(())
}

/// An identifier or a quoted string.
fn name(parser: &mut Parser<'_>) -> Result<String, PolicyError> {
    match parser.peek() {
        TokenKind::Str(_) => parser.expect_string(),
        _ => parser.expect_ident(),
    }
}

/// `read`, `"read"` or `Other::Action::"read"`.
fn action_ref(parser: &mut Parser<'_>) -> Result<EntityUid, PolicyError> {
    if let TokenKind::Str(_) = parser.peek() {
        let id = parser.expect_string()?;
        return Ok(EntityUid::new_unchecked("Action", id));
    }
    match parser.name_or_uid()? {
        NameOrUid::Uid(uid) => Ok(uid),
        NameOrUid::Name(id) if !id.contains("::") => Ok(EntityUid::new_unchecked("Action", id)),
        NameOrUid::Name(path) => Err(parser.error(format!(
            "expected an action name or uid, found type `{path}`"
        ))),
    }
}

/// `Type` or `[Type, ...]`.
fn type_list(parser: &mut Parser<'_>) -> Result<BTreeSet<String>, PolicyError> {
    if parser.eat(&TokenKind::LBracket) {
        let types = comma_separated_until(parser, TokenKind::RBracket, |p| p.type_path())?;
        Ok(types.into_iter().collect())
    } else {
        Ok(BTreeSet::from([parser.type_path()?]))
    }
}

fn record_type(parser: &mut Parser<'_>) -> Result<BTreeMap<String, Attribute>, PolicyError> {
    parser.expect(TokenKind::LBrace)?;
    let fields = comma_separated_until(parser, TokenKind::RBrace, |p| {
        let attr = name(p)?;
        let required = !p.eat(&TokenKind::Question);
        p.expect(TokenKind::Colon)?;
        let ty = schema_type(p)?;
        Ok((attr, Attribute { ty, required }))
    })?;

    let mut attributes = BTreeMap::new();
    for (attr, attribute) in fields {
        if attributes.insert(attr.clone(), attribute).is_some() {
            return Err(parser.error(format!("duplicate attribute `{attr}`")));
        }
    }
    Ok(attributes)
}

fn schema_type(parser: &mut Parser<'_>) -> Result<SchemaType, PolicyError> {
    if *parser.peek() == TokenKind::LBrace {
        return record_type(parser).map(SchemaType::Record);
    }
    let path = parser.type_path()?;
    Ok(match path.as_str() {
        "Bool" | "Boolean" => SchemaType::Bool,
        "Long" => SchemaType::Long,
        "String" => SchemaType::String,
        "Set" => {
            parser.expect(TokenKind::Less)?;
            let element = schema_type(parser)?;
            parser.expect(TokenKind::Greater)?;
            SchemaType::Set(Box::new(element))
        }
        _ => SchemaType::Entity(path),
    })
}

fn comma_separated<T>(
    parser: &mut Parser<'_>,
    mut item: impl FnMut(&mut Parser<'_>) -> Result<T, PolicyError>,
) -> Result<Vec<T>, PolicyError> {
    let mut items = vec![item(parser)?];
    while parser.eat(&TokenKind::Comma) {
        items.push(item(parser)?);
    }
    Ok(items)
}

/// Items up to `close`, allowing a trailing comma and an empty list.
fn comma_separated_until<T>(
    parser: &mut Parser<'_>,
    close: TokenKind,
    mut item: impl FnMut(&mut Parser<'_>) -> Result<T, PolicyError>,
) -> Result<Vec<T>, PolicyError> {
    let mut items = Vec::new();
    while !parser.eat(&close) {
        items.push(item(parser)?);
        if !parser.eat(&TokenKind::Comma) {
            parser.expect(close.clone())?;
            break;
        }
    }
    Ok(items)
}

pub(crate) fn schema_to_text(schema: &Schema) -> String {
    let mut out = String::new();
    for (ns, view) in schema.namespaces() {
        let indent = if ns.is_empty() { "" } else { "  " };
        let mut lines = Vec::new();
        for (name, decl) in &view.entity_types {
            lines.push(entity_to_text(&ns, name, decl, indent));
        }
        for (name, decl) in &view.actions {
            lines.push(action_to_text(&ns, name, decl, indent));
        }
        if ns.is_empty() {
            out.push_str(&lines.concat());
        } else {
            out.push_str(&format!("namespace {ns} {{\n{}}}\n", lines.concat()));
        }
    }
    out
}

fn entity_to_text(ns: &str, name: &str, decl: &EntityTypeDecl, indent: &str) -> String {
    let mut line = format!("{indent}entity {name}");
    if !decl.member_of.is_empty() {
        line.push_str(&format!(" in {}", types_to_text(ns, &decl.member_of)));
    }
    if !decl.attributes.is_empty() {
        line.push(' ');
        line.push_str(&record_to_text(ns, &decl.attributes, indent));
    }
    line.push_str(";\n");
    line
}

fn action_to_text(ns: &str, name: &str, decl: &ActionDecl, indent: &str) -> String {
    let mut line = format!("{indent}action {}", name_to_text(name));
    if !decl.member_of.is_empty() {
        let groups = decl
            .member_of
            .iter()
            .map(|group| {
                if relative_name(ns, group.entity_type()) == "Action" {
                    format!("\"{}\"", escape(group.id()))
                } else {
                    group.to_string()
                }
            })
            .join(", ");
        line.push_str(&format!(" in [{groups}]"));
    }
    let has_applies_to = !decl.principal_types.is_empty()
        || !decl.resource_types.is_empty()
        || !decl.context.is_empty();
    if has_applies_to {
        let inner = format!("{indent}  ");
        line.push_str(" appliesTo {\n");
        line.push_str(&format!(
            "{inner}principal: {},\n",
            types_to_text(ns, &decl.principal_types)
        ));
        line.push_str(&format!(
            "{inner}resource: {},\n",
            types_to_text(ns, &decl.resource_types)
        ));
        line.push_str(&format!(
            "{inner}context: {}\n",
            record_to_text(ns, &decl.context, &inner)
        ));
        line.push_str(&format!("{indent}}}"));
    }
    line.push_str(";\n");
    line
}

fn types_to_text(ns: &str, types: &BTreeSet<String>) -> String {
    format!(
        "[{}]",
        types.iter().map(|t| relative_name(ns, t)).join(", ")
    )
}

/// One attribute per line, indented one level below `indent`.
fn record_to_text(ns: &str, attributes: &BTreeMap<String, Attribute>, indent: &str) -> String {
    if attributes.is_empty() {
        return "{}".to_string();
    }
    let mut out = String::from("{\n");
    for (name, attr) in attributes {
        out.push_str(&format!(
            "{indent}  {}{}: {},\n",
            name_to_text(name),
            if attr.required { "" } else { "?" },
            type_to_text(ns, &attr.ty)
        ));
    }
    out.push_str(indent);
    out.push('}');
    out
}

fn type_to_text(ns: &str, ty: &SchemaType) -> String {
    match ty {
        SchemaType::Entity(name) => relative_name(ns, name).to_string(),
        SchemaType::Set(element) => format!("Set<{}>", type_to_text(ns, element)),
        SchemaType::Record(attributes) => format!(
            "{{{}}}",
            attributes
                .iter()
                .map(|(name, attr)| format!(
                    "{}{}: {}",
                    name_to_text(name),
                    if attr.required { "" } else { "?" },
                    type_to_text(ns, &attr.ty)
                ))
                .join(", ")
        ),
        other => other.to_string(),
    }
}

fn name_to_text(name: &str) -> String {
    if is_ident(name) {
        name.to_string()
    } else {
        format!("\"{}\"", escape(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[test]
    fn test_schema_text_layout() {
        let schema: Schema = r#"
            namespace App {
                entity Group;
                entity User in [Group] { age: Long, "e-mail"?: String, tags: Set<{k: String}> };
                action read;
                action view in [read] appliesTo {
                    principal: User,
                    resource: [User, Group],
                    context: { mfa: Bool }
                };
            }
        "#
        .parse()
        .unwrap();

        insta::assert_snapshot!(schema.to_string(), @r#"
        namespace App {
          entity Group;
          entity User in [Group] {
            age: Long,
            "e-mail"?: String,
            tags: Set<{k: String}>,
          };
          action read;
          action view in ["read"] appliesTo {
            principal: [User],
            resource: [Group, User],
            context: {
              mfa: Bool,
            }
          };
        }
        "#);
    }

    #[test]
    fn test_printed_text_parses_back() {
        let text = r#"
            entity Org;
            namespace App {
                entity User in [Org] { org: Org, nested: { inner?: Long } };
                action "edit photo" appliesTo { principal: [User], resource: [User] };
            }
        "#;
        let schema: Schema = text.parse().unwrap();
        let reparsed: Schema = schema.to_string().parse().unwrap();
        assert_eq!(schema, reparsed);
    }

    #[test]
    fn test_multiple_names_share_a_declaration() {
        let schema: Schema = "entity A, B; action x, y appliesTo { principal: A, resource: B };"
            .parse()
            .unwrap();
        assert!(schema.entity_type("A").is_some());
        assert!(schema.entity_type("B").is_some());
        assert_eq!(schema.actions().len(), 2);
    }

    #[parameterized(
        missing_semicolon = { "entity User" },
        unknown_keyword = { "type X = Long;" },
        bad_applies_to_key = { "entity U; action a appliesTo { owner: U };" },
        unclosed_namespace = { "namespace App { entity U;" },
        duplicate_attribute = { "entity U { a: Long, a: String };" },
        unclosed_set = { "entity U { a: Set<Long };" },
    )]
    fn test_schema_syntax_errors(text: &str) {
        assert!(
            matches!(text.parse::<Schema>(), Err(PolicyError::SyntaxError { .. })),
            "{text}"
        );
    }
}
