// This crate holds the in-memory entity-relationship catalog model:
// the introspected graph of schemas, tables, columns, keys, and
// foreign-key references, together with the authorization lattice and
// the static half of the access-decision engine. It deliberately knows
// nothing about SQL execution; database access lives in `catalog-sql`
// and query compilation in `ermpath`.

pub mod acl;
pub mod binding;
pub mod context;
pub mod doc;
pub mod error;
pub mod graph;
pub mod ident;
pub mod rights;
pub mod types;

pub use acl::{Acls, ResourceClass, Right};
pub use binding::{AclBinding, JoinDirection, ProjectionFilter, ProjectionStep, ProjectionType};
pub use context::{Identity, RequestContext};
pub use error::{Error, Result};
pub use graph::{
    ColSet, Column, ColumnId, ConstraintName, ForeignKey, ForeignKeyId, KeyRefId, KeyReference,
    Model, RefMap, ReferenceRule, Schema, SchemaId, Table, TableId, TableKind, Unique, UniqueId,
};
pub use rights::{columns_in_order, enforce_right, has_right, rights_summary, Resource};
pub use types::{Type, TypeRegistry};
