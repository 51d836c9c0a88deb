//! The access-decision engine.
//!
//! `has_right` produces a three-valued decision: `Some(true)` allows,
//! `Some(false)` statically denies, and `None` means the decision is
//! data-dependent and must be finished by the dynamic-ACL clauses the
//! query compiler injects into SQL. `enforce_right` treats only a
//! static deny as fatal, so indeterminate gates remain permissive until
//! row-level filtering applies.

use crate::acl::{ResourceClass, Right};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::graph::{ColumnId, KeyRefId, Model, SchemaId, TableId};
use std::collections::BTreeMap;

/// A node of the model graph that carries ACLs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Catalog,
    Schema(SchemaId),
    Table(TableId),
    Column(ColumnId),
    KeyRef(KeyRefId),
}

impl Resource {
    pub fn class(self) -> ResourceClass {
        match self {
            Resource::Catalog => ResourceClass::Catalog,
            Resource::Schema(_) => ResourceClass::Schema,
            Resource::Table(_) => ResourceClass::Table,
            Resource::Column(_) => ResourceClass::Column,
            Resource::KeyRef(_) => ResourceClass::ForeignKeyRef,
        }
    }

    /// The resource whose ownership and ACLs this resource inherits.
    /// Key references inherit from the table they refer to.
    pub fn parent(self, model: &Model) -> Option<Resource> {
        match self {
            Resource::Catalog => None,
            Resource::Schema(_) => Some(Resource::Catalog),
            Resource::Table(t) => Some(Resource::Schema(model.table(t).schema)),
            Resource::Column(c) => Some(Resource::Table(model.column(c).table)),
            Resource::KeyRef(kr) => {
                let unique = model.key_reference(kr).unique;
                Some(Resource::Table(model.unique(unique).table))
            }
        }
    }

    pub fn display(self, model: &Model) -> String {
        match self {
            Resource::Catalog => "catalog".to_string(),
            Resource::Schema(s) => format!(":{}", model.schema(s).name),
            Resource::Table(t) => model.table_display(t),
            Resource::Column(c) => model.column_display(c),
            Resource::KeyRef(kr) => model.key_reference(kr).name.to_string(),
        }
    }

    fn acl<'m>(self, model: &'m Model, right: Right) -> Option<&'m [String]> {
        let acls = match self {
            Resource::Catalog => &model.acls,
            Resource::Schema(s) => &model.schema(s).acls,
            Resource::Table(t) => &model.table(t).acls,
            Resource::Column(c) => &model.column(c).acls,
            Resource::KeyRef(kr) => &model.key_reference(kr).acls,
        };
        acls.get(right)
    }

    /// Binding types declared across this resource's dynamic bindings.
    fn dynacl_types(self, model: &Model) -> Vec<Right> {
        let dynacls = match self {
            Resource::Catalog | Resource::Schema(_) => return Vec::new(),
            Resource::Table(t) => &model.table(t).dynacls,
            Resource::Column(c) => &model.column(c).dynacls,
            Resource::KeyRef(kr) => &model.key_reference(kr).dynacls,
        };
        dynacls.values().flat_map(|b| b.types.iter().copied()).collect()
    }
}

/// Decide `right` for `resource` under the context's identity.
pub fn has_right(
    model: &Model,
    resource: Resource,
    right: Right,
    ctx: &RequestContext,
) -> Option<bool> {
    if let Some(decision) = ctx.cached(resource, right) {
        return decision;
    }
    let decision = decide(model, resource, right, ctx);
    ctx.remember(resource, right, decision);
    decision
}

fn decide(model: &Model, resource: Resource, right: Right, ctx: &RequestContext) -> Option<bool> {
    // Containers must themselves be enumerable before their members are
    // visible at all.
    let container_gate = match resource {
        Resource::Table(t) => Some(Resource::Schema(model.table(t).schema)),
        Resource::Column(c) => Some(Resource::Table(model.column(c).table)),
        _ => None,
    };
    if let Some(container) = container_gate {
        if has_right(model, container, Right::Enumerate, ctx) != Some(true) {
            return Some(false);
        }
    }

    let parent = resource.parent(model);
    let acl = resource.acl(model, right);

    if let Some(parent) = parent {
        if has_right(model, parent, Right::Owner, ctx) == Some(true) {
            // Ownership of the parent resource implies every right here.
            return Some(true);
        }
        if acl.is_none() && has_right(model, parent, right, ctx) == Some(true) {
            // No local opinion: inherit the parent's ACL decision.
            return Some(true);
        }
    }

    for sufficient in right.implied_by() {
        if has_right(model, resource, *sufficient, ctx) == Some(true) {
            return Some(true);
        }
    }

    if let Some(acl) = acl {
        if ctx.identity.holds_any(acl) {
            return Some(true);
        }
    }

    let sufficient = right.sufficient();
    if resource
        .dynacl_types(model)
        .iter()
        .any(|t| sufficient.contains(t))
    {
        // A binding may grant this right row by row.
        return None;
    }

    if let Some(parent) = parent {
        if has_right(model, parent, right, ctx).is_none() {
            return None;
        }
    }

    Some(false)
}

/// Raise `Forbidden` when the decision for `right` is a static deny.
pub fn enforce_right(
    model: &Model,
    resource: Resource,
    right: Right,
    ctx: &RequestContext,
) -> Result<()> {
    if has_right(model, resource, right, ctx) == Some(false) {
        return Err(Error::Forbidden(format!(
            "{} access on {}",
            right,
            resource.display(model)
        )));
    }
    Ok(())
}

/// Columns of `table` visible to the caller, in ordinal position
/// order. Statically denied columns are omitted; indeterminate ones
/// remain and are gated row-wise when SQL is emitted.
pub fn columns_in_order(model: &Model, table: TableId, ctx: &RequestContext) -> Vec<ColumnId> {
    model
        .table(table)
        .columns
        .iter()
        .copied()
        .filter(|c| has_right(model, Resource::Column(*c), Right::Enumerate, ctx) != Some(false))
        .collect()
}

/// The decisions reported in this resource's document, per reportable
/// right of its class.
pub fn rights_summary(
    model: &Model,
    resource: Resource,
    ctx: &RequestContext,
) -> BTreeMap<Right, Option<bool>> {
    resource
        .class()
        .rights_reported()
        .iter()
        .map(|r| (*r, has_right(model, resource, *r, ctx)))
        .collect()
}
