//! Dynamic ACL binding documents.
//!
//! A binding is a row-scoped authorization rule: a projection through
//! the schema graph from the bound resource's table to a final column
//! whose value is matched against the caller's roles (`acl` bindings)
//! or tested for presence (`nonnull` bindings). Documents are parsed
//! and shape-checked here; resolution of joins, filters, and the final
//! column against a live model happens in the `ermpath` crate, which
//! also assigns the `projection_type` default.

use crate::acl::{ResourceClass, Right};
use crate::error::{Error, Result};
use serde_json::Value;

/// How the projected column is evaluated at query time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectionType {
    /// The projected value must intersect the caller's role set.
    Acl,
    /// A reachable row with a non-null projected value suffices.
    NonNull,
}

impl ProjectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionType::Acl => "acl",
            ProjectionType::NonNull => "nonnull",
        }
    }
}

/// Which side of a key reference a projection join traverses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinDirection {
    /// From the referenced table to the referring table.
    Inbound,
    /// From the referring table along its foreign key.
    Outbound,
}

/// One non-terminal element of a binding projection.
#[derive(Clone, Debug, PartialEq)]
pub enum ProjectionStep {
    Join {
        direction: JoinDirection,
        /// Two-part constraint name: schema part and constraint part.
        constraint: (String, String),
        alias: Option<String>,
        /// Rewind the current entity to this alias before joining.
        context: Option<String>,
    },
    Filter(ProjectionFilter),
}

/// A filter element of a binding projection.
#[derive(Clone, Debug, PartialEq)]
pub enum ProjectionFilter {
    Conjunction {
        elements: Vec<ProjectionFilter>,
        negate: bool,
    },
    Disjunction {
        elements: Vec<ProjectionFilter>,
        negate: bool,
    },
    Leaf {
        /// Bare column name, or alias-qualified pair.
        column: Vec<String>,
        operator: String,
        operand: Value,
        negate: bool,
    },
}

/// A parsed and (once compiled) validated dynamic ACL binding.
#[derive(Clone, Debug, PartialEq)]
pub struct AclBinding {
    pub types: Vec<Right>,
    pub steps: Vec<ProjectionStep>,
    /// Terminal projection element: a column of the entity the steps
    /// lead to.
    pub column: String,
    /// `None` until projection compilation fixes the default from the
    /// projected column's type.
    pub projection_type: Option<ProjectionType>,
    pub comment: Option<String>,
}

impl AclBinding {
    /// Parse a binding document for a resource of class `class`,
    /// checking every field shape and the declared binding types.
    ///
    /// The projection itself is only shape-checked; callers must compile
    /// it against a model before the binding is considered valid.
    pub fn from_json(class: ResourceClass, binding_name: &str, doc: &Value) -> Result<AclBinding> {
        let map = doc.as_object().ok_or_else(|| {
            Error::BadData(format!(
                "ACL binding \"{}\" must be an object.",
                binding_name
            ))
        })?;

        let mut types = None;
        let mut projection = None;
        let mut projection_type = None;
        let mut comment = None;

        for (field, value) in map {
            match field.as_str() {
                "types" => types = Some(parse_types(class, binding_name, value)?),
                "projection" => projection = Some(value),
                "projection_type" => {
                    projection_type = Some(match value.as_str() {
                        Some("acl") => ProjectionType::Acl,
                        Some("nonnull") => ProjectionType::NonNull,
                        _ => {
                            return Err(Error::BadData(format!(
                                "ACL binding projection-type {} is not supported.",
                                value
                            )))
                        }
                    })
                }
                "comment" => {
                    comment = Some(
                        value
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| {
                                Error::BadData(
                                    "ACL binding comment must be of string type.".to_string(),
                                )
                            })?,
                    )
                }
                other => {
                    return Err(Error::BadData(format!(
                        "Field \"{}\" in ACL binding \"{}\" not recognized.",
                        other, binding_name
                    )))
                }
            }
        }

        let types = types.ok_or_else(|| required_field("types"))?;
        let projection = projection.ok_or_else(|| required_field("projection"))?;
        let (steps, column) = parse_projection(binding_name, projection)?;

        Ok(AclBinding {
            types,
            steps,
            column,
            projection_type,
            comment,
        })
    }

    /// Render the binding back to its document form.
    pub fn to_json(&self) -> Value {
        let mut projection: Vec<Value> = self.steps.iter().map(step_to_json).collect();
        projection.push(Value::String(self.column.clone()));
        let mut doc = serde_json::Map::new();
        doc.insert(
            "types".to_string(),
            Value::Array(
                self.types
                    .iter()
                    .map(|t| Value::String(t.as_str().to_string()))
                    .collect(),
            ),
        );
        doc.insert("projection".to_string(), Value::Array(projection));
        if let Some(pt) = self.projection_type {
            doc.insert(
                "projection_type".to_string(),
                Value::String(pt.as_str().to_string()),
            );
        }
        if let Some(comment) = &self.comment {
            doc.insert("comment".to_string(), Value::String(comment.clone()));
        }
        Value::Object(doc)
    }
}

fn required_field(field: &str) -> Error {
    Error::BadData(format!("Field \"{}\" is required for ACL bindings.", field))
}

fn parse_types(class: ResourceClass, binding_name: &str, value: &Value) -> Result<Vec<Right>> {
    let list = value.as_array().filter(|l| !l.is_empty()).ok_or_else(|| {
        Error::BadData(format!(
            "Field \"types\" in ACL binding \"{}\" must be a non-empty list of type names.",
            binding_name
        ))
    })?;
    let mut types = Vec::with_capacity(list.len());
    for t in list {
        let right = t
            .as_str()
            .and_then(|s| Right::parse(s).ok())
            .filter(|r| class.dynacl_types_supported().contains(r))
            .ok_or_else(|| {
                Error::BadData(format!(
                    "ACL binding type {} is not supported on this resource.",
                    t
                ))
            })?;
        types.push(right);
    }
    Ok(types)
}

fn parse_projection(binding_name: &str, value: &Value) -> Result<(Vec<ProjectionStep>, String)> {
    // A bare column name is sugar for a single-element projection.
    let elements: Vec<Value> = match value {
        Value::String(s) => vec![Value::String(s.clone())],
        Value::Array(a) if !a.is_empty() => a.clone(),
        _ => {
            return Err(Error::BadData(format!(
                "Projection for ACL binding \"{}\" must be a column name or non-empty list.",
                binding_name
            )))
        }
    };

    let (last, steps) = elements.split_last().expect("projection is non-empty");
    let column = last
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            Error::BadData(format!(
                "Projection for ACL binding \"{}\" must conclude with a string literal column name.",
                binding_name
            ))
        })?;

    let steps = steps
        .iter()
        .map(|elem| parse_step(binding_name, elem))
        .collect::<Result<Vec<_>>>()?;
    Ok((steps, column))
}

fn parse_step(binding_name: &str, elem: &Value) -> Result<ProjectionStep> {
    let map = elem.as_object().ok_or_else(|| {
        Error::BadData(format!(
            "Projection element {} of ACL binding \"{}\" must be an object.",
            elem, binding_name
        ))
    })?;
    if map.contains_key("inbound") || map.contains_key("outbound") {
        let (direction, name) = if let Some(name) = map.get("inbound") {
            (JoinDirection::Inbound, name)
        } else {
            (JoinDirection::Outbound, map.get("outbound").unwrap())
        };
        let constraint = parse_constraint_name(binding_name, name)?;
        let alias = parse_opt_alias(binding_name, map.get("alias"), "Alias")?;
        let context = parse_opt_alias(binding_name, map.get("context"), "Context")?;
        Ok(ProjectionStep::Join {
            direction,
            constraint,
            alias,
            context,
        })
    } else {
        Ok(ProjectionStep::Filter(parse_filter(binding_name, elem)?))
    }
}

fn parse_constraint_name(binding_name: &str, value: &Value) -> Result<(String, String)> {
    let parts = value
        .as_array()
        .filter(|a| a.len() == 2)
        .and_then(|a| {
            let schema = a[0].as_str()?;
            let name = a[1].as_str()?;
            Some((schema.to_string(), name.to_string()))
        })
        .ok_or_else(|| {
            Error::BadData(format!(
                "Foreign key name {} in ACL binding \"{}\" not valid.",
                value, binding_name
            ))
        })?;
    Ok(parts)
}

fn parse_opt_alias(
    binding_name: &str,
    value: Option<&Value>,
    kind: &str,
) -> Result<Option<String>> {
    match value {
        None => Ok(None),
        Some(v) => v.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
            Error::BadData(format!(
                "{} {} in ACL binding \"{}\" must be a string literal alias name.",
                kind, v, binding_name
            ))
        }),
    }
}

fn parse_filter(binding_name: &str, elem: &Value) -> Result<ProjectionFilter> {
    let map = elem.as_object().ok_or_else(|| {
        Error::BadData(format!(
            "Filter element {} of ACL binding \"{}\" is malformed.",
            elem, binding_name
        ))
    })?;
    let negate = map.get("negate").and_then(Value::as_bool).unwrap_or(false);

    if let Some(elements) = map.get("and") {
        let elements = parse_filter_list(binding_name, elements)?;
        return Ok(ProjectionFilter::Conjunction { elements, negate });
    }
    if let Some(elements) = map.get("or") {
        let elements = parse_filter_list(binding_name, elements)?;
        return Ok(ProjectionFilter::Disjunction { elements, negate });
    }
    if let Some(lname) = map.get("filter") {
        let column = match lname {
            Value::String(s) => vec![s.clone()],
            Value::Array(parts) if parts.len() == 2 => parts
                .iter()
                .map(|p| p.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| invalid_filter_column(binding_name, lname))?,
            _ => return Err(invalid_filter_column(binding_name, lname)),
        };
        let operator = map
            .get("operator")
            .map(|op| {
                op.as_str().map(str::to_string).ok_or_else(|| {
                    Error::BadData(format!(
                        "Unknown operator {} in ACL binding \"{}\".",
                        op, binding_name
                    ))
                })
            })
            .transpose()?
            .unwrap_or_else(|| "=".to_string());
        let operand = map.get("operand").cloned().unwrap_or(Value::String(String::new()));
        return Ok(ProjectionFilter::Leaf {
            column,
            operator,
            operand,
            negate,
        });
    }
    Err(Error::BadData(format!(
        "Filter element {} of ACL binding \"{}\" is malformed.",
        elem, binding_name
    )))
}

fn parse_filter_list(binding_name: &str, value: &Value) -> Result<Vec<ProjectionFilter>> {
    value
        .as_array()
        .ok_or_else(|| {
            Error::BadData(format!(
                "Filter element {} of ACL binding \"{}\" is malformed.",
                value, binding_name
            ))
        })?
        .iter()
        .map(|e| parse_filter(binding_name, e))
        .collect()
}

fn invalid_filter_column(binding_name: &str, lname: &Value) -> Error {
    Error::BadData(format!(
        "Invalid filter column name {} in ACL binding \"{}\".",
        lname, binding_name
    ))
}

fn step_to_json(step: &ProjectionStep) -> Value {
    match step {
        ProjectionStep::Join {
            direction,
            constraint,
            alias,
            context,
        } => {
            let mut doc = serde_json::Map::new();
            let key = match direction {
                JoinDirection::Inbound => "inbound",
                JoinDirection::Outbound => "outbound",
            };
            doc.insert(
                key.to_string(),
                serde_json::json!([constraint.0, constraint.1]),
            );
            if let Some(alias) = alias {
                doc.insert("alias".to_string(), Value::String(alias.clone()));
            }
            if let Some(context) = context {
                doc.insert("context".to_string(), Value::String(context.clone()));
            }
            Value::Object(doc)
        }
        ProjectionStep::Filter(filter) => filter_to_json(filter),
    }
}

fn filter_to_json(filter: &ProjectionFilter) -> Value {
    match filter {
        ProjectionFilter::Conjunction { elements, negate } => {
            let mut doc = serde_json::Map::new();
            doc.insert(
                "and".to_string(),
                Value::Array(elements.iter().map(filter_to_json).collect()),
            );
            if *negate {
                doc.insert("negate".to_string(), Value::Bool(true));
            }
            Value::Object(doc)
        }
        ProjectionFilter::Disjunction { elements, negate } => {
            let mut doc = serde_json::Map::new();
            doc.insert(
                "or".to_string(),
                Value::Array(elements.iter().map(filter_to_json).collect()),
            );
            if *negate {
                doc.insert("negate".to_string(), Value::Bool(true));
            }
            Value::Object(doc)
        }
        ProjectionFilter::Leaf {
            column,
            operator,
            operand,
            negate,
        } => {
            let mut doc = serde_json::Map::new();
            let column = if column.len() == 1 {
                Value::String(column[0].clone())
            } else {
                Value::Array(column.iter().cloned().map(Value::String).collect())
            };
            doc.insert("filter".to_string(), column);
            doc.insert("operator".to_string(), Value::String(operator.clone()));
            doc.insert("operand".to_string(), operand.clone());
            if *negate {
                doc.insert("negate".to_string(), Value::Bool(true));
            }
            Value::Object(doc)
        }
    }
}
