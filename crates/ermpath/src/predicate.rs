//! Data predicates: the filter AST attached to entity path elements.
//!
//! A predicate is validated against the path (resolving its left-hand
//! name and checking the column `select` right) before it can emit SQL.
//! Validation produces a [`Resolved`] form carrying the element
//! position and column handle, so emission needs no further lookups.

use crate::name::{ColumnRef, Name};
use crate::path::EntityPath;
use models::ident::sql_literal;
use models::{
    enforce_right, ColumnId, Error, Model, RequestContext, Resource, Result, Right, TableId,
};
use serde_json::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Null,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Geq,
    Gt,
    Leq,
    Lt,
}

impl BinaryOp {
    fn sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Geq => ">=",
            BinaryOp::Gt => ">",
            BinaryOp::Leq => "<=",
            BinaryOp::Lt => "<",
        }
    }

    fn rest(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Geq => "geq",
            BinaryOp::Gt => "gt",
            BinaryOp::Leq => "leq",
            BinaryOp::Lt => "lt",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextOp {
    Regexp,
    CiRegexp,
    Ts,
}

impl TextOp {
    fn sql(self) -> &'static str {
        match self {
            TextOp::Regexp => "~",
            TextOp::CiRegexp => "~*",
            TextOp::Ts => "@@",
        }
    }

    fn rest(self) -> &'static str {
        match self {
            TextOp::Regexp => "regexp",
            TextOp::CiRegexp => "ciregexp",
            TextOp::Ts => "ts",
        }
    }
}

/// A client-supplied filter, not yet validated against a path.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Unary {
        name: Name,
        op: UnaryOp,
    },
    Binary {
        name: Name,
        op: BinaryOp,
        operand: Value,
    },
    Text {
        name: Name,
        op: TextOp,
        operand: String,
    },
    Negation(Box<Predicate>),
    Conjunction(Vec<Predicate>),
    Disjunction(Vec<Predicate>),
}

impl Predicate {
    pub fn unary(name: Name, op: UnaryOp) -> Predicate {
        Predicate::Unary { name, op }
    }

    pub fn binary(name: Name, op: BinaryOp, operand: Value) -> Predicate {
        Predicate::Binary { name, op, operand }
    }

    pub fn text(name: Name, op: TextOp, operand: impl Into<String>) -> Predicate {
        Predicate::Text {
            name,
            op,
            operand: operand.into(),
        }
    }

    /// Build a predicate from a REST operator token. Unknown operators
    /// and operand arity mismatches are client errors.
    pub fn from_op(op: &str, name: Name, operand: Option<Value>) -> Result<Predicate> {
        match op {
            "null" => {
                if operand.is_some() {
                    return Err(Error::BadData(
                        "Operator null does not accept a right-hand value.".to_string(),
                    ));
                }
                Ok(Predicate::Unary {
                    name,
                    op: UnaryOp::Null,
                })
            }
            "=" | "geq" | "gt" | "leq" | "lt" => {
                let operand = operand.ok_or_else(|| {
                    Error::BadData(format!("Operator {} requires a right-hand value.", op))
                })?;
                let op = match op {
                    "=" => BinaryOp::Eq,
                    "geq" => BinaryOp::Geq,
                    "gt" => BinaryOp::Gt,
                    "leq" => BinaryOp::Leq,
                    _ => BinaryOp::Lt,
                };
                Ok(Predicate::Binary { name, op, operand })
            }
            "regexp" | "ciregexp" | "ts" => {
                let operand = operand
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::BadData(format!(
                            "Operator {} requires a text right-hand value.",
                            op
                        ))
                    })?;
                let op = match op {
                    "regexp" => TextOp::Regexp,
                    "ciregexp" => TextOp::CiRegexp,
                    _ => TextOp::Ts,
                };
                Ok(Predicate::Text { name, op, operand })
            }
            other => Err(Error::BadData(format!("Unknown operator \"{}\".", other))),
        }
    }

    /// Resolve left-hand names against `epath` and check column access.
    ///
    /// Only text operators accept the free-text pseudo-column; every
    /// real column referenced must not be statically denied `select`.
    pub fn resolve(&self, epath: &EntityPath<'_>, ctx: Option<&RequestContext>) -> Result<Resolved> {
        match self {
            Predicate::Unary { name, op } => {
                let (column, pos) = resolve_column(name, epath, ctx, "null")?;
                Ok(Resolved::Unary {
                    pos,
                    column,
                    op: *op,
                })
            }
            Predicate::Binary { name, op, operand } => {
                let (column, pos) = resolve_column(name, epath, ctx, op.rest())?;
                Ok(Resolved::Binary {
                    pos,
                    column,
                    op: *op,
                    operand: operand.clone(),
                })
            }
            Predicate::Text { name, op, operand } => {
                let (target, pos) = name.resolve(epath)?;
                if let (ColumnRef::Column(column), Some(ctx)) = (target, ctx) {
                    enforce_right(epath.model(), Resource::Column(column), Right::Select, ctx)?;
                }
                Ok(Resolved::Text {
                    pos,
                    target,
                    op: *op,
                    operand: operand.clone(),
                })
            }
            Predicate::Negation(inner) => {
                Ok(Resolved::Negation(Box::new(inner.resolve(epath, ctx)?)))
            }
            Predicate::Conjunction(preds) => Ok(Resolved::Conjunction(
                preds
                    .iter()
                    .map(|p| p.resolve(epath, ctx))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Predicate::Disjunction(preds) => Ok(Resolved::Disjunction(
                preds
                    .iter()
                    .map(|p| p.resolve(epath, ctx))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Validate this predicate as an attribute-update constraint: only
    /// equality over an unqualified column of the path's terminal
    /// entity is permitted, and the right-hand side names an input
    /// column of the payload.
    pub fn validate_attribute_update(
        &self,
        epath: &EntityPath<'_>,
    ) -> Result<(ColumnId, String)> {
        match self {
            Predicate::Binary {
                name,
                op: BinaryOp::Eq,
                operand,
            } => {
                let (target, pos) = name.resolve(epath)?;
                if pos != epath.current_position() {
                    return Err(Error::ConflictModel(format!(
                        "Only unqualified attribute names from entity {} can be constrained in PUT.",
                        epath.model().table_display(epath.current_entity_table())
                    )));
                }
                let column = match target {
                    ColumnRef::Column(c) => c,
                    ColumnRef::Freetext(_) => {
                        return Err(Error::BadData(
                            "The text-search pseudo-column \"*\" cannot be updated.".to_string(),
                        ))
                    }
                };
                let input = operand.as_str().ok_or_else(|| {
                    Error::BadData(format!(
                        "Predicate {} must pair the attribute with an input column name.",
                        self
                    ))
                })?;
                Ok((column, input.to_string()))
            }
            _ => Err(Error::BadData(format!(
                "Predicate {} is not supported in an attribute update path filter.",
                self
            ))),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Unary { name, .. } => write!(f, "{} null", name),
            Predicate::Binary { name, op, operand } => {
                write!(f, "{} {} {}", name, op.rest(), operand)
            }
            Predicate::Text { name, op, operand } => {
                write!(f, "{} {} {}", name, op.rest(), operand)
            }
            Predicate::Negation(inner) => write!(f, "!({})", inner),
            Predicate::Conjunction(preds) => {
                write!(f, "({})", preds.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" & "))
            }
            Predicate::Disjunction(preds) => {
                write!(f, "({})", preds.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" ; "))
            }
        }
    }
}

fn resolve_column(
    name: &Name,
    epath: &EntityPath<'_>,
    ctx: Option<&RequestContext>,
    op: &str,
) -> Result<(ColumnId, usize)> {
    let (target, pos) = name.resolve(epath)?;
    let column = match target {
        ColumnRef::Column(c) => c,
        ColumnRef::Freetext(_) => {
            return Err(Error::BadData(format!(
                "Operator {} does not support the text-search pseudo-column \"*\".",
                op
            )))
        }
    };
    if let Some(ctx) = ctx {
        enforce_right(epath.model(), Resource::Column(column), Right::Select, ctx)?;
    }
    Ok((column, pos))
}

/// A predicate whose names are resolved against a specific path.
#[derive(Clone, Debug)]
pub enum Resolved {
    Unary {
        pos: usize,
        column: ColumnId,
        op: UnaryOp,
    },
    Binary {
        pos: usize,
        column: ColumnId,
        op: BinaryOp,
        operand: Value,
    },
    Text {
        pos: usize,
        target: ColumnRef,
        op: TextOp,
        operand: String,
    },
    Negation(Box<Resolved>),
    Conjunction(Vec<Resolved>),
    Disjunction(Vec<Resolved>),
}

impl Resolved {
    /// Emit a WHERE fragment. Column references use the element alias
    /// `{prefix}t{pos}`.
    pub fn sql_where(&self, model: &Model, prefix: &str) -> String {
        match self {
            Resolved::Unary { pos, column, op } => {
                let UnaryOp::Null = op;
                format!(
                    "{}t{}.{} IS NULL",
                    prefix,
                    pos,
                    model.column(*column).sql_name()
                )
            }
            Resolved::Binary {
                pos,
                column,
                op,
                operand,
            } => {
                let col = model.column(*column);
                let lname = format!("{}t{}.{}", prefix, pos, col.sql_name());
                if col.column_type.is_array() {
                    // Distribute the comparison over array elements.
                    format!(
                        "(SELECT bool_or(v {} {}) FROM unnest({}) x(v))",
                        op.sql(),
                        col.column_type.base_type().sql_literal(operand),
                        lname
                    )
                } else {
                    format!(
                        "{} {} {}",
                        lname,
                        op.sql(),
                        col.column_type.sql_literal(operand)
                    )
                }
            }
            Resolved::Text {
                pos,
                target,
                op,
                operand,
            } => text_sql_where(model, prefix, *pos, *target, *op, operand),
            Resolved::Negation(inner) => format!("NOT ({})", inner.sql_where(model, prefix)),
            Resolved::Conjunction(preds) => preds
                .iter()
                .map(|p| format!("({})", p.sql_where(model, prefix)))
                .collect::<Vec<_>>()
                .join(" AND "),
            Resolved::Disjunction(preds) => preds
                .iter()
                .map(|p| format!("({})", p.sql_where(model, prefix)))
                .collect::<Vec<_>>()
                .join(" OR "),
        }
    }
}

fn text_sql_where(
    model: &Model,
    prefix: &str,
    pos: usize,
    target: ColumnRef,
    op: TextOp,
    operand: &str,
) -> String {
    let talias = format!("{}t{}", prefix, pos);
    let lefts: Vec<String> = match target {
        ColumnRef::Column(column) => vec![format!(
            "{}.{}::text",
            talias,
            model.column(column).sql_name()
        )],
        ColumnRef::Freetext(table) => freetext_columns(model, table)
            .into_iter()
            .map(|c| format!("{}.{}::text", talias, model.column(c).sql_name()))
            .collect(),
    };
    if lefts.is_empty() {
        return "(False)".to_string();
    }

    let right = match op {
        TextOp::Ts => format!("to_tsquery({})", sql_literal(operand)),
        _ => sql_literal(operand),
    };
    let clauses: Vec<String> = lefts
        .into_iter()
        .map(|left| {
            let left = match op {
                TextOp::Ts => format!("to_tsvector({})", left),
                _ => left,
            };
            format!("({} {} {})", left, op.sql(), right)
        })
        .collect();
    if clauses.len() == 1 {
        clauses.into_iter().next().unwrap()
    } else {
        format!("({})", clauses.join(" OR "))
    }
}

/// The columns the free-text pseudo-column of `table` expands to.
fn freetext_columns(model: &Model, table: TableId) -> Vec<ColumnId> {
    model
        .table(table)
        .columns
        .iter()
        .copied()
        .filter(|c| model.column(*c).column_type.base_type().name() == "text")
        .collect()
}
