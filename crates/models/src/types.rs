//! Column type registry: base, array, and domain types resolved from
//! database introspection, plus parsing of raw default literals.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Stable identifier assigned to a type row by introspection.
pub type TypeId = String;

/// A resolved column type. Array and domain types share their element
/// and base types, so a deeply nested type is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Base {
        name: String,
    },
    Array {
        name: String,
        element: Arc<Type>,
    },
    Domain {
        name: String,
        base: Arc<Type>,
        notnull: bool,
        default: Option<Value>,
    },
}

impl Type {
    pub fn name(&self) -> &str {
        match self {
            Type::Base { name } => name,
            Type::Array { name, .. } => name,
            Type::Domain { name, .. } => name,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Type::Domain { .. })
    }

    /// Strip array and domain wrappers down to the underlying base type.
    pub fn base_type(&self) -> &Type {
        match self {
            Type::Base { .. } => self,
            Type::Array { element, .. } => element.base_type(),
            Type::Domain { base, .. } => base.base_type(),
        }
    }

    /// True when values of this type render as text in SQL.
    pub fn is_text(&self) -> bool {
        self.base_type().name() == "text"
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self.base_type().name(),
            "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "serial2" | "serial4"
                | "serial8" | "float4" | "float8" | "real" | "double precision" | "numeric"
        )
    }

    fn is_boolean(&self) -> bool {
        matches!(self.base_type().name(), "bool" | "boolean")
    }

    /// Parse a raw database default literal into a host value.
    ///
    /// Unparseable defaults yield `None`: the column is still usable, it
    /// just carries no default. Sequence-backed defaults are treated the
    /// same way since their next value is not a constant.
    pub fn default_value(&self, raw: Option<&str>) -> Option<Value> {
        let raw = raw?.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.contains("nextval(") {
            return None;
        }
        let bare = strip_cast(raw);
        if self.is_numeric() {
            if let Ok(i) = bare.parse::<i64>() {
                return Some(Value::from(i));
            }
            if let Ok(f) = bare.parse::<f64>() {
                return Some(Value::from(f));
            }
            return None;
        }
        if self.is_boolean() {
            return match bare.to_ascii_lowercase().as_str() {
                "true" | "t" => Some(Value::Bool(true)),
                "false" | "f" => Some(Value::Bool(false)),
                _ => None,
            };
        }
        let unquoted = unquote(bare)?;
        match self.base_type().name() {
            "json" | "jsonb" => serde_json::from_str(&unquoted).ok(),
            _ => Some(Value::String(unquoted)),
        }
    }

    /// Render `v` as a SQL literal of this type.
    pub fn sql_literal(&self, v: &Value) -> String {
        match v {
            Value::Number(n) if self.is_numeric() => n.to_string(),
            Value::Bool(b) if self.is_boolean() => b.to_string(),
            Value::String(s) => crate::ident::sql_literal(s),
            other => crate::ident::sql_literal(&other.to_string()),
        }
    }
}

lazy_static! {
    static ref CAST_SUFFIX: Regex = Regex::new(r"::[A-Za-z_][A-Za-z0-9_ \[\]]*$").unwrap();
}

fn strip_cast(raw: &str) -> &str {
    match CAST_SUFFIX.find(raw) {
        Some(m) => raw[..m.start()].trim(),
        None => raw,
    }
}

fn unquote(s: &str) -> Option<String> {
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        Some(s[1..s.len() - 1].replace("''", "'"))
    } else {
        None
    }
}

/// Registry of the types introspection discovered, keyed by type id.
///
/// Builders must be invoked leaf-first: a domain before its dependents,
/// an array after its element, every composite after its base. The
/// introspector orders its type query accordingly.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<TypeId, Arc<Type>>,
    by_name: BTreeMap<String, TypeId>,
    disallowed_names: BTreeSet<String>,
    disallowed: BTreeMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn new(disallowed_names: BTreeSet<String>) -> Self {
        TypeRegistry {
            disallowed_names,
            ..Default::default()
        }
    }

    fn insert(&mut self, id: TypeId, t: Type) {
        if self.disallowed_names.contains(t.name()) {
            self.disallowed.insert(id, t.name().to_string());
            return;
        }
        self.by_name.insert(t.name().to_string(), id.clone());
        self.types.insert(id, Arc::new(t));
    }

    pub fn add_base(&mut self, id: TypeId, name: &str) {
        self.insert(
            id,
            Type::Base {
                name: name.to_string(),
            },
        );
    }

    pub fn add_array(&mut self, id: TypeId, name: &str, element_id: &str) -> Result<()> {
        let element = match self.resolve_dependency(&id, name, element_id)? {
            Some(element) => element,
            None => return Ok(()),
        };
        self.insert(
            id,
            Type::Array {
                name: name.to_string(),
                element,
            },
        );
        Ok(())
    }

    pub fn add_domain(
        &mut self,
        id: TypeId,
        name: &str,
        base_id: &str,
        raw_default: Option<&str>,
        notnull: bool,
    ) -> Result<()> {
        let base = match self.resolve_dependency(&id, name, base_id)? {
            Some(base) => base,
            None => return Ok(()),
        };
        let default = base.default_value(raw_default);
        self.insert(
            id,
            Type::Domain {
                name: name.to_string(),
                base,
                notnull,
                default,
            },
        );
        Ok(())
    }

    /// Resolve a composite's element or base type. A disallowed
    /// dependency taints the composite itself (returning `None` after
    /// recording it); an unknown dependency is the caller's ordering
    /// bug.
    fn resolve_dependency(
        &mut self,
        id: &str,
        name: &str,
        dep_id: &str,
    ) -> Result<Option<Arc<Type>>> {
        if self.disallowed.contains_key(dep_id) {
            self.disallowed.insert(id.to_string(), name.to_string());
            return Ok(None);
        }
        match self.types.get(dep_id) {
            Some(t) => Ok(Some(t.clone())),
            None => Err(Error::ConflictModel(format!(
                "Requested type \"{}\" does not exist.",
                dep_id
            ))),
        }
    }

    /// Resolve a type id to its registered type.
    ///
    /// A disallowed type fails with an error naming it unless
    /// `allow_disallowed` is set, in which case it resolves to `text`
    /// so pre-existing columns remain enumerable.
    pub fn lookup(&self, id: &str, allow_disallowed: bool) -> Result<Arc<Type>> {
        if let Some(name) = self.disallowed.get(id) {
            if allow_disallowed {
                return Ok(Arc::new(Type::Base {
                    name: "text".to_string(),
                }));
            }
            return Err(Error::ConflictModel(format!(
                "Disallowed type \"{}\" requested.",
                name
            )));
        }
        self.types.get(id).cloned().ok_or_else(|| {
            Error::ConflictModel(format!("Requested type \"{}\" does not exist.", id))
        })
    }

    /// The name recorded for a disallowed type id, if any.
    pub fn disallowed_name(&self, id: &str) -> Option<&str> {
        self.disallowed.get(id).map(String::as_str)
    }

    /// Resolve a type by name, as table-creation documents reference it.
    pub fn lookup_name(&self, name: &str) -> Result<Arc<Type>> {
        if self.disallowed_names.contains(name) {
            return Err(Error::ConflictModel(format!(
                "Disallowed type \"{}\" requested.",
                name
            )));
        }
        self.by_name
            .get(name)
            .and_then(|id| self.types.get(id))
            .cloned()
            .ok_or_else(|| {
                Error::ConflictModel(format!("Requested type \"{}\" does not exist.", name))
            })
    }
}
