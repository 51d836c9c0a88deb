//! Model mutation: DDL against the live database paired with in-memory
//! model updates and metadata bookkeeping.
//!
//! Statements run in the caller's transaction. Each mutation fires the
//! model-change event after its DDL so the version tick is the last
//! side effect before commit; concurrent requests keep their snapshots
//! and reintrospect afterwards.

use crate::config::CatalogConfig;
use crate::store;
use crate::{db_error, model_change_event};
use models::graph::ColumnDef;
use models::ident::{sql_identifier, sql_literal, truncated_identifier};
use models::{
    enforce_right, ColumnId, ConstraintName, Error, KeyRefId, Model, ReferenceRule,
    RequestContext, Resource, Result, Right, SchemaId, TableId, TableKind, UniqueId,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct TableDoc {
    #[serde(default)]
    pub schema_name: Option<String>,
    pub table_name: String,
    #[serde(default = "TableDoc::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub column_definitions: Vec<ColumnDoc>,
    #[serde(default)]
    pub keys: Vec<KeyDoc>,
    #[serde(default)]
    pub foreign_keys: Vec<FkeyRefDoc>,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub acls: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub acl_bindings: BTreeMap<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl TableDoc {
    fn default_kind() -> String {
        "table".to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct ColumnDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: TypeDoc,
    #[serde(default = "ColumnDoc::default_nullok")]
    pub nullok: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub acls: BTreeMap<String, Vec<String>>,
}

impl ColumnDoc {
    fn default_nullok() -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
pub struct TypeDoc {
    pub typename: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyDoc {
    pub unique_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FkeyRefDoc {
    pub foreign_key_columns: Vec<ColumnRefDoc>,
    pub referenced_columns: Vec<ColumnRefDoc>,
    #[serde(default)]
    pub on_delete: Option<String>,
    #[serde(default)]
    pub on_update: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub acls: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub acl_bindings: BTreeMap<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ColumnRefDoc {
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
}

/// `"name" type [NOT NULL] [DEFAULT lit]`
fn column_sql_def(def: &ColumnDef) -> String {
    let mut out = format!("{} {}", sql_identifier(&def.name), def.column_type.name());
    if !def.nullok {
        out.push_str(" NOT NULL");
    }
    if let Some(default) = &def.default {
        out.push_str(&format!(" DEFAULT {}", def.column_type.sql_literal(default)));
    }
    out
}

async fn execute(conn: &mut sqlx::PgConnection, sql: &str) -> Result<()> {
    sqlx::query(sql).execute(&mut *conn).await.map_err(db_error)?;
    Ok(())
}

async fn comment_on(
    conn: &mut sqlx::PgConnection,
    sql_resource: &str,
    comment: Option<&str>,
) -> Result<()> {
    let comment = match comment {
        Some(c) => sql_literal(c),
        None => "NULL".to_string(),
    };
    execute(conn, &format!("COMMENT ON {} IS {};", sql_resource, comment)).await
}

pub async fn create_schema(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    name: &str,
    comment: Option<String>,
) -> Result<SchemaId> {
    enforce_right(model, Resource::Catalog, Right::Create, ctx)?;
    let id = model.add_schema(name, comment.clone(), BTreeMap::new(), Default::default())?;
    execute(conn, &format!("CREATE SCHEMA {};", sql_identifier(name))).await?;
    if comment.is_some() {
        comment_on(
            conn,
            &format!("SCHEMA {}", sql_identifier(name)),
            comment.as_deref(),
        )
        .await?;
    }
    model_change_event(conn).await?;
    Ok(id)
}

pub async fn delete_schema(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    schema: SchemaId,
) -> Result<()> {
    enforce_right(model, Resource::Schema(schema), Right::Owner, ctx)?;
    if !model.schema(schema).tables.is_empty() {
        return Err(Error::ConflictData(format!(
            "Schema {} is not empty.",
            model.schema(schema).name
        )));
    }
    store::purge_metadata(conn, model, ctx, Resource::Schema(schema)).await?;
    let name = model.schema(schema).name.clone();
    execute(conn, &format!("DROP SCHEMA {} RESTRICT;", sql_identifier(&name))).await?;
    model_change_event(conn).await?;
    model.hide_schema(&name);
    Ok(())
}

/// Create a table from its document, including keys, foreign keys, and
/// attached metadata.
pub async fn create_table(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    schema: SchemaId,
    doc: &Value,
    config: &CatalogConfig,
) -> Result<TableId> {
    let doc: TableDoc = serde_json::from_value(doc.clone())
        .map_err(|e| Error::BadData(format!("Malformed table representation: {}", e)))?;

    let schema_name = model.schema(schema).name.clone();
    if let Some(sname) = &doc.schema_name {
        if *sname != schema_name {
            return Err(Error::ConflictModel(format!(
                "JSON schema name {} does not match URL schema name {}.",
                sname, schema_name
            )));
        }
    }
    if doc.kind != "table" {
        return Err(Error::ConflictData(format!(
            "Kind \"{}\" not supported in table creation.",
            doc.kind
        )));
    }
    enforce_right(model, Resource::Schema(schema), Right::Create, ctx)?;

    let mut defs = Vec::with_capacity(doc.column_definitions.len());
    for cdoc in &doc.column_definitions {
        defs.push(column_def(model, cdoc)?);
    }

    let table = model.add_table(
        schema,
        &doc.table_name,
        TableKind::Relation,
        doc.comment.clone(),
        doc.annotations.clone(),
        Default::default(),
    )?;
    let mut column_ids = Vec::with_capacity(defs.len());
    for def in defs.iter().cloned() {
        column_ids.push(model.add_column(table, def)?);
    }

    let clauses: Vec<String> = defs.iter().map(column_sql_def).collect();
    execute(
        conn,
        &format!(
            "CREATE TABLE {}.{} (\n   {}\n);",
            sql_identifier(&schema_name),
            sql_identifier(&doc.table_name),
            clauses.join(",\n   ")
        ),
    )
    .await?;
    if doc.comment.is_some() {
        comment_on(
            conn,
            &format!("TABLE {}", model.table_sql_name(table)),
            doc.comment.as_deref(),
        )
        .await?;
    }
    model_change_event(conn).await?;

    for keydoc in &doc.keys {
        add_unique(conn, model, ctx, table, keydoc).await?;
    }
    for fkeydoc in &doc.foreign_keys {
        add_fkeyref(conn, model, ctx, table, fkeydoc).await?;
    }
    if config.require_primary_keys && !model.has_primary_key(table) {
        return Err(Error::BadData(
            "Table definitions require at least one not-null key constraint.".to_string(),
        ));
    }

    for (uri, value) in &doc.annotations {
        store::set_annotation(conn, model, ctx, Resource::Table(table), uri, value.clone())
            .await?;
    }
    for (aclname, members) in &doc.acls {
        store::set_acl(
            conn,
            model,
            ctx,
            Resource::Table(table),
            aclname,
            Some(members.clone()),
        )
        .await?;
    }
    for (name, binding) in &doc.acl_bindings {
        store::set_dynacl(
            conn,
            model,
            ctx,
            Resource::Table(table),
            name,
            Some(binding.clone()),
        )
        .await?;
    }
    for (column, cdoc) in column_ids.iter().zip(&doc.column_definitions) {
        for (uri, value) in &cdoc.annotations {
            store::set_annotation(
                conn,
                model,
                ctx,
                Resource::Column(*column),
                uri,
                value.clone(),
            )
            .await?;
        }
        for (aclname, members) in &cdoc.acls {
            store::set_acl(
                conn,
                model,
                ctx,
                Resource::Column(*column),
                aclname,
                Some(members.clone()),
            )
            .await?;
        }
    }

    Ok(table)
}

fn column_def(model: &Model, doc: &ColumnDoc) -> Result<ColumnDef> {
    let column_type = model.types.lookup_name(&doc.column_type.typename)?;
    Ok(ColumnDef {
        name: doc.name.clone(),
        nullok: doc.nullok,
        default: doc.default.clone(),
        comment: doc.comment.clone(),
        annotations: doc.annotations.clone(),
        acls: models::Acls::new(),
        column_type,
    })
}

pub async fn delete_table(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    table: TableId,
) -> Result<()> {
    enforce_right(model, Resource::Table(table), Right::Owner, ctx)?;

    // Purge metadata of dependents first, then of the table itself.
    let keyrefs: Vec<KeyRefId> = model
        .table(table)
        .fkeys
        .values()
        .flat_map(|fk| model.fkey(*fk).references.values().copied())
        .collect();
    for kr in keyrefs {
        store::purge_metadata(conn, model, ctx, Resource::KeyRef(kr)).await?;
        model.unlink_fkey_reference(kr);
    }
    let columns: Vec<ColumnId> = model.table(table).columns.clone();
    for column in columns {
        store::purge_metadata(conn, model, ctx, Resource::Column(column)).await?;
    }
    store::purge_metadata(conn, model, ctx, Resource::Table(table)).await?;

    let kind = model.table(table).kind;
    execute(
        conn,
        &format!("DROP {} {};", kind.sql_keyword(), model.table_sql_name(table)),
    )
    .await?;
    model_change_event(conn).await?;
    model.unlink_table(table);
    Ok(())
}

/// Add a column on the rightmost position of `table`.
pub async fn add_column(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    table: TableId,
    doc: &Value,
) -> Result<ColumnId> {
    enforce_right(model, Resource::Table(table), Right::Owner, ctx)?;
    let doc: ColumnDoc = serde_json::from_value(doc.clone())
        .map_err(|e| Error::BadData(format!("Malformed column representation: {}", e)))?;
    let def = column_def(model, &doc)?;

    execute(
        conn,
        &format!(
            "ALTER TABLE {} ADD COLUMN {};",
            model.table_sql_name(table),
            column_sql_def(&def)
        ),
    )
    .await?;
    model_change_event(conn).await?;

    let column = model.add_column(table, def)?;
    if doc.comment.is_some() {
        comment_on(
            conn,
            &format!(
                "COLUMN {}.{}",
                model.table_sql_name(table),
                sql_identifier(&doc.name)
            ),
            doc.comment.as_deref(),
        )
        .await?;
    }
    for (uri, value) in &doc.annotations {
        store::set_annotation(conn, model, ctx, Resource::Column(column), uri, value.clone())
            .await?;
    }
    for (aclname, members) in &doc.acls {
        store::set_acl(
            conn,
            model,
            ctx,
            Resource::Column(column),
            aclname,
            Some(members.clone()),
        )
        .await?;
    }
    Ok(column)
}

/// Drop a column, pre-deleting any key or foreign key that covers it.
pub async fn delete_column(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    table: TableId,
    cname: &str,
) -> Result<()> {
    enforce_right(model, Resource::Table(table), Right::Owner, ctx)?;
    let column = model.lookup_column(table, cname)?;

    let (uniques, keyrefs) = model.constraints_covering(column);
    for kr in keyrefs {
        store::purge_metadata(conn, model, ctx, Resource::KeyRef(kr)).await?;
        model.unlink_fkey_reference(kr);
    }
    for unique in uniques {
        model.unlink_unique(unique);
    }
    store::purge_metadata(conn, model, ctx, Resource::Column(column)).await?;

    execute(
        conn,
        &format!(
            "ALTER TABLE {} DROP COLUMN {};",
            model.table_sql_name(table),
            sql_identifier(cname)
        ),
    )
    .await?;
    model_change_event(conn).await?;
    model.unlink_column(column);
    Ok(())
}

/// Add a unique constraint described by `doc` to `table`.
pub async fn add_unique(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    table: TableId,
    doc: &KeyDoc,
) -> Result<UniqueId> {
    enforce_right(model, Resource::Table(table), Right::Owner, ctx)?;
    let cols = doc
        .unique_columns
        .iter()
        .map(|name| model.lookup_column(table, name))
        .collect::<Result<Vec<_>>>()?;

    let table_name = model.table(table).name.clone();
    let schema_name = model.schema(model.table(table).schema).name.clone();
    let constraint = unique_constraint_name(&table_name, &doc.unique_columns);
    execute(
        conn,
        &format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
            model.table_sql_name(table),
            sql_identifier(&constraint),
            doc.unique_columns
                .iter()
                .map(|c| sql_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    )
    .await?;
    model_change_event(conn).await?;

    model.add_unique(
        cols,
        ConstraintName::new(schema_name, constraint),
        false,
        None,
        BTreeMap::new(),
    )
}

/// Add a foreign-key reference constraint whose referring columns live
/// on `table`.
pub async fn add_fkeyref(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    table: TableId,
    doc: &FkeyRefDoc,
) -> Result<KeyRefId> {
    enforce_right(model, Resource::Table(table), Right::Owner, ctx)?;

    let fk_cols = resolve_column_refs(model, &doc.foreign_key_columns)?;
    let pk_cols = resolve_column_refs(model, &doc.referenced_columns)?;
    if fk_cols.iter().any(|c| model.column(*c).table != table) {
        return Err(Error::ConflictModel(format!(
            "Foreign-key columns must belong to table {}.",
            model.table_display(table)
        )));
    }
    let pk_table = match pk_cols.first() {
        Some(c) => model.column(*c).table,
        None => {
            return Err(Error::BadData(
                "Foreign-key representation requires referenced columns.".to_string(),
            ))
        }
    };

    let on_delete = ReferenceRule::parse(doc.on_delete.as_deref().unwrap_or("NO ACTION"));
    let on_update = ReferenceRule::parse(doc.on_update.as_deref().unwrap_or("NO ACTION"));

    let table_name = model.table(table).name.clone();
    let schema_name = model.schema(model.table(table).schema).name.clone();
    let fk_names: Vec<String> = doc
        .foreign_key_columns
        .iter()
        .map(|c| c.column_name.clone())
        .collect();
    let constraint = fkey_constraint_name(&table_name, &fk_names);

    execute(
        conn,
        &format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) \
             ON DELETE {} ON UPDATE {};",
            model.table_sql_name(table),
            sql_identifier(&constraint),
            fk_names
                .iter()
                .map(|c| sql_identifier(c))
                .collect::<Vec<_>>()
                .join(", "),
            model.table_sql_name(pk_table),
            doc.referenced_columns
                .iter()
                .map(|c| sql_identifier(&c.column_name))
                .collect::<Vec<_>>()
                .join(", "),
            on_delete.as_str(),
            on_update.as_str()
        ),
    )
    .await?;
    model_change_event(conn).await?;

    let keyref = model.add_fkey_reference(
        fk_cols,
        pk_cols,
        ConstraintName::new(schema_name, constraint),
        false,
        on_delete,
        on_update,
        doc.comment.clone(),
        doc.annotations.clone(),
        Default::default(),
    )?;

    for (aclname, members) in &doc.acls {
        store::set_acl(
            conn,
            model,
            ctx,
            Resource::KeyRef(keyref),
            aclname,
            Some(members.clone()),
        )
        .await?;
    }
    for (name, binding) in &doc.acl_bindings {
        store::set_dynacl(
            conn,
            model,
            ctx,
            Resource::KeyRef(keyref),
            name,
            Some(binding.clone()),
        )
        .await?;
    }
    Ok(keyref)
}

fn resolve_column_refs(model: &Model, refs: &[ColumnRefDoc]) -> Result<Vec<ColumnId>> {
    refs.iter()
        .map(|r| {
            let schema = model.lookup_schema(&r.schema_name)?;
            let table = model.lookup_table(schema, &r.table_name)?;
            model.lookup_column(table, &r.column_name)
        })
        .collect()
}

/// Deterministic generated name for a unique constraint.
pub fn unique_constraint_name(table: &str, columns: &[String]) -> String {
    let joined = columns.join("_");
    truncated_identifier(&[table, "_", &joined, "_key"])
}

/// Deterministic generated name for a foreign-key constraint.
pub fn fkey_constraint_name(table: &str, columns: &[String]) -> String {
    let joined = columns.join("_");
    truncated_identifier(&[table, "_", &joined, "_fkey"])
}

/// Set or clear the SQL comment of a schema, table, or column.
pub async fn set_comment(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    comment: Option<String>,
) -> Result<()> {
    enforce_right(model, resource, Right::Owner, ctx)?;
    let sql_resource = match resource {
        Resource::Schema(s) => format!("SCHEMA {}", sql_identifier(&model.schema(s).name)),
        Resource::Table(t) => format!("TABLE {}", model.table_sql_name(t)),
        Resource::Column(c) => {
            let column = model.column(c);
            format!(
                "COLUMN {}.{}",
                model.table_sql_name(column.table),
                sql_identifier(&column.name)
            )
        }
        _ => {
            return Err(Error::BadData(
                "Comments are not supported on this resource.".to_string(),
            ))
        }
    };
    comment_on(conn, &sql_resource, comment.as_deref()).await?;
    model_change_event(conn).await?;
    match resource {
        Resource::Schema(s) => model.schema_mut(s).comment = comment,
        Resource::Table(t) => model.table_mut(t).comment = comment,
        Resource::Column(c) => model.column_mut(c).comment = comment,
        _ => unreachable!(),
    }
    Ok(())
}
