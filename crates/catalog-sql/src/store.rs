//! The auxiliary metadata store: annotations, ACLs, and dynamic ACL
//! bindings persisted in `model_<restype>_<kind>` tables keyed by the
//! resource's identifying tuple.
//!
//! Writes are idempotent upserts (UPDATE returning the old value, then
//! INSERT when nothing matched) and every write fires the model-change
//! event. The in-memory model is updated alongside so the mutating
//! request observes its own writes; other requests reintrospect.

use crate::{db_error, model_change_event, STORAGE_SCHEMA};
use models::ident::sql_identifier;
use models::{
    enforce_right, AclBinding, Acls, Error, Model, RequestContext, Resource, Result, Right,
};
use serde_json::Value;
use sqlx::Row;

/// The storage identity of one resource: its type token and the
/// ordered key-column values that locate its metadata rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub restype: &'static str,
    pub columns: &'static [&'static str],
    pub values: Vec<String>,
}

impl ResourceKey {
    fn storage_table(&self, kind: &str) -> String {
        format!(
            "{}.{}",
            STORAGE_SCHEMA,
            sql_identifier(&format!("model_{}_{}", self.restype, kind))
        )
    }
}

/// Compute the storage key of `resource` from its identifying tuple.
pub fn resource_key(model: &Model, resource: Resource) -> ResourceKey {
    let class = resource.class();
    let values = match resource {
        Resource::Catalog => Vec::new(),
        Resource::Schema(s) => vec![model.schema(s).name.clone()],
        Resource::Table(t) => {
            let table = model.table(t);
            vec![model.schema(table.schema).name.clone(), table.name.clone()]
        }
        Resource::Column(c) => {
            let column = model.column(c);
            let table = model.table(column.table);
            vec![
                model.schema(table.schema).name.clone(),
                table.name.clone(),
                column.name.clone(),
            ]
        }
        Resource::KeyRef(kr) => {
            let keyref = model.key_reference(kr);
            let fk_table = model.table(model.fkey(keyref.fkey).table);
            vec![
                model.schema(fk_table.schema).name.clone(),
                fk_table.name.clone(),
                keyref.name.schema.clone(),
                keyref.name.name.clone(),
            ]
        }
    };
    ResourceKey {
        restype: class.restype(),
        columns: class.keying_columns(),
        values,
    }
}

/// UPDATE ... RETURNING the previous value; `$last` is the new value.
fn upsert_update_sql(table: &str, key_cols: &[&str], name_col: &str, value_col: &str, cast: &str) -> String {
    let mut wheres = Vec::new();
    let mut cols: Vec<&str> = key_cols.to_vec();
    cols.push(name_col);
    for (i, col) in cols.iter().enumerate() {
        let col = sql_identifier(col);
        wheres.push(format!(
            "new.{col} = old.{col} AND new.{col} = ${n}",
            col = col,
            n = i + 1
        ));
    }
    format!(
        "UPDATE {table} new SET {value} = ${n}{cast} FROM {table} old WHERE {wheres} \
         RETURNING old.{value} AS prior;",
        table = table,
        value = sql_identifier(value_col),
        n = cols.len() + 1,
        cast = cast,
        wheres = wheres.join(" AND ")
    )
}

fn upsert_insert_sql(table: &str, key_cols: &[&str], name_col: &str, value_col: &str, cast: &str) -> String {
    let mut cols: Vec<&str> = key_cols.to_vec();
    cols.push(name_col);
    let placeholders: Vec<String> = (1..=cols.len()).map(|n| format!("${}", n)).collect();
    format!(
        "INSERT INTO {table} ({cols}, {value}) VALUES ({placeholders}, ${n}{cast});",
        table = table,
        cols = cols
            .iter()
            .map(|c| sql_identifier(c))
            .collect::<Vec<_>>()
            .join(", "),
        value = sql_identifier(value_col),
        placeholders = placeholders.join(", "),
        n = cols.len() + 1,
        cast = cast
    )
}

/// DELETE rows for the resource; with a name the delete is pointwise,
/// without one it purges the whole kind.
fn delete_sql(table: &str, key_cols: &[&str], name_col: Option<&str>) -> String {
    let mut cols: Vec<&str> = key_cols.to_vec();
    cols.extend(name_col);
    let wheres: Vec<String> = cols
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ${}", sql_identifier(col), i + 1))
        .collect();
    if wheres.is_empty() {
        format!("DELETE FROM {};", table)
    } else {
        format!("DELETE FROM {} WHERE {};", table, wheres.join(" AND "))
    }
}

/// A value headed into (or out of) auxiliary storage: annotation and
/// binding documents are jsonb, ACL member lists are text arrays.
#[derive(Debug, Clone)]
enum StoreValue {
    Json(Value),
    TextArray(Vec<String>),
}

impl StoreValue {
    fn cast(&self) -> &'static str {
        match self {
            StoreValue::Json(_) => "::jsonb",
            StoreValue::TextArray(_) => "::text[]",
        }
    }

    fn bind<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match self {
            StoreValue::Json(v) => query.bind(v.clone()),
            StoreValue::TextArray(v) => query.bind(v.clone()),
        }
    }

    fn prior(&self, row: &sqlx::postgres::PgRow) -> sqlx::Result<Value> {
        match self {
            StoreValue::Json(_) => row.try_get("prior"),
            StoreValue::TextArray(_) => {
                let members: Vec<String> = row.try_get("prior")?;
                Ok(Value::Array(members.into_iter().map(Value::String).collect()))
            }
        }
    }
}

async fn upsert(
    conn: &mut sqlx::PgConnection,
    key: &ResourceKey,
    kind: &str,
    name_col: &str,
    name: &str,
    value_col: &str,
    value: StoreValue,
) -> Result<Option<Value>> {
    model_change_event(conn).await?;
    let table = key.storage_table(kind);

    let update = upsert_update_sql(&table, key.columns, name_col, value_col, value.cast());
    let mut query = sqlx::query(&update);
    for v in &key.values {
        query = query.bind(v);
    }
    query = value.bind(query.bind(name));
    if let Some(row) = query.fetch_optional(&mut *conn).await.map_err(db_error)? {
        return Ok(Some(value.prior(&row).map_err(db_error)?));
    }

    let insert = upsert_insert_sql(&table, key.columns, name_col, value_col, value.cast());
    let mut query = sqlx::query(&insert);
    for v in &key.values {
        query = query.bind(v);
    }
    value
        .bind(query.bind(name))
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(None)
}

async fn delete(
    conn: &mut sqlx::PgConnection,
    key: &ResourceKey,
    kind: &str,
    name_col: Option<(&str, &str)>,
) -> Result<()> {
    model_change_event(conn).await?;
    let sql = delete_sql(&key.storage_table(kind), key.columns, name_col.map(|(c, _)| c));
    let mut query = sqlx::query(&sql);
    for v in &key.values {
        query = query.bind(v);
    }
    if let Some((_, name)) = name_col {
        query = query.bind(name);
    }
    query.execute(&mut *conn).await.map_err(db_error)?;
    Ok(())
}

fn annotations_mut<'m>(
    model: &'m mut Model,
    resource: Resource,
) -> &'m mut std::collections::BTreeMap<String, Value> {
    match resource {
        Resource::Catalog => &mut model.annotations,
        Resource::Schema(s) => &mut model.schema_mut(s).annotations,
        Resource::Table(t) => &mut model.table_mut(t).annotations,
        Resource::Column(c) => &mut model.column_mut(c).annotations,
        Resource::KeyRef(kr) => &mut model.key_reference_mut(kr).annotations,
    }
}

fn acls_mut(model: &mut Model, resource: Resource) -> Result<&mut Acls> {
    match resource {
        Resource::Catalog => Ok(&mut model.acls),
        Resource::Schema(s) => Ok(&mut model.schema_mut(s).acls),
        Resource::Table(t) => Ok(&mut model.table_mut(t).acls),
        Resource::Column(c) => Ok(&mut model.column_mut(c).acls),
        Resource::KeyRef(kr) => Ok(&mut model.key_reference_mut(kr).acls),
    }
}

fn dynacls_mut(
    model: &mut Model,
    resource: Resource,
) -> Result<&mut std::collections::BTreeMap<String, AclBinding>> {
    match resource {
        Resource::Table(t) => Ok(&mut model.table_mut(t).dynacls),
        Resource::Column(c) => Ok(&mut model.column_mut(c).dynacls),
        Resource::KeyRef(kr) => Ok(&mut model.key_reference_mut(kr).dynacls),
        Resource::Catalog | Resource::Schema(_) => Err(Error::BadData(
            "ACL bindings are not supported on this resource.".to_string(),
        )),
    }
}

/// Read an annotation, with a 404-shaped miss.
pub fn get_annotation<'m>(
    model: &'m Model,
    resource: Resource,
    uri: &str,
) -> Result<&'m Value> {
    let annotations = match resource {
        Resource::Catalog => &model.annotations,
        Resource::Schema(s) => &model.schema(s).annotations,
        Resource::Table(t) => &model.table(t).annotations,
        Resource::Column(c) => &model.column(c).annotations,
        Resource::KeyRef(kr) => &model.key_reference(kr).annotations,
    };
    annotations.get(uri).ok_or_else(|| {
        Error::NotFound(format!(
            "annotation \"{}\" on {}",
            uri,
            resource.display(model)
        ))
    })
}

/// Set an annotation, returning the previous value when updating.
pub async fn set_annotation(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    uri: &str,
    value: Value,
) -> Result<Option<Value>> {
    enforce_right(model, resource, Right::Owner, ctx)?;
    let key = resource_key(model, resource);
    let prior = upsert(
        conn,
        &key,
        "annotation",
        "annotation_uri",
        uri,
        "annotation_value",
        StoreValue::Json(value.clone()),
    )
    .await?;
    annotations_mut(model, resource).insert(uri.to_string(), value);
    Ok(prior)
}

/// Delete one annotation, or purge all of them when `uri` is `None`.
pub async fn delete_annotation(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    uri: Option<&str>,
) -> Result<()> {
    enforce_right(model, resource, Right::Owner, ctx)?;
    if let Some(uri) = uri {
        get_annotation(model, resource, uri)?;
    }
    let key = resource_key(model, resource);
    delete(conn, &key, "annotation", uri.map(|u| ("annotation_uri", u))).await?;
    match uri {
        Some(uri) => {
            annotations_mut(model, resource).remove(uri);
        }
        None => annotations_mut(model, resource).clear(),
    }
    Ok(())
}

/// Read an ACL by name. Unsupported names on this resource class are
/// 404s; supported-but-unset ACLs read as `None`.
pub fn get_acl<'m>(
    model: &'m Model,
    resource: Resource,
    aclname: &str,
) -> Result<Option<&'m [String]>> {
    let right = supported_acl(model, resource, aclname)
        .map_err(|_| not_found_acl(model, resource, aclname))?;
    let acls = match resource {
        Resource::Catalog => &model.acls,
        Resource::Schema(s) => &model.schema(s).acls,
        Resource::Table(t) => &model.table(t).acls,
        Resource::Column(c) => &model.column(c).acls,
        Resource::KeyRef(kr) => &model.key_reference(kr).acls,
    };
    Ok(acls.get(right))
}

fn supported_acl(model: &Model, resource: Resource, aclname: &str) -> Result<Right> {
    let right = Right::parse(aclname)?;
    if !resource.class().supports_acl(right) {
        return Err(not_found_acl(model, resource, aclname));
    }
    Ok(right)
}

fn not_found_acl(model: &Model, resource: Resource, aclname: &str) -> Error {
    Error::NotFound(format!(
        "ACL {} on {}",
        aclname,
        resource.display(model)
    ))
}

/// Set an ACL, returning the previous member list when updating.
///
/// `members = None` deletes instead. The owner check runs before and
/// after the in-memory update: a write that would disown the caller is
/// refused.
pub async fn set_acl(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    aclname: &str,
    members: Option<Vec<String>>,
) -> Result<Option<Value>> {
    let members = match members {
        Some(members) => members,
        None => {
            delete_acl(conn, model, ctx, resource, Some(aclname), false).await?;
            return Ok(None);
        }
    };

    enforce_right(model, resource, Right::Owner, ctx)?;
    let right = supported_acl(model, resource, aclname).map_err(|_| {
        Error::ConflictData(format!(
            "ACL name {} not supported on {}.",
            aclname,
            resource.display(model)
        ))
    })?;

    let prior_members = acls_mut(model, resource)?.get(right).map(<[String]>::to_vec);
    acls_mut(model, resource)?.set(right, members.clone());
    ctx.invalidate();
    if let Err(err) = enforce_right(model, resource, Right::Owner, ctx) {
        // Roll the in-memory change back; the caller may not disown.
        match prior_members {
            Some(prior) => acls_mut(model, resource)?.set(right, prior),
            None => {
                acls_mut(model, resource)?.remove(right);
            }
        }
        ctx.invalidate();
        return Err(err);
    }

    let key = resource_key(model, resource);
    upsert(
        conn,
        &key,
        "acl",
        "acl",
        aclname,
        "members",
        StoreValue::TextArray(members),
    )
    .await
}

/// Delete one ACL, or purge all of them when `aclname` is `None`.
/// Purging skips the disownment check; it is used by cascading resource
/// deletion.
pub async fn delete_acl(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    aclname: Option<&str>,
    purging: bool,
) -> Result<()> {
    enforce_right(model, resource, Right::Owner, ctx)?;
    let right = match aclname {
        Some(aclname) => Some(supported_acl(model, resource, aclname)?),
        None => None,
    };

    let prior = acls_mut(model, resource)?.clone();
    match right {
        Some(right) => {
            acls_mut(model, resource)?.remove(right);
        }
        None => acls_mut(model, resource)?.clear(),
    }
    ctx.invalidate();
    if !purging {
        if let Err(err) = enforce_right(model, resource, Right::Owner, ctx) {
            *acls_mut(model, resource)? = prior;
            ctx.invalidate();
            return Err(err);
        }
    }

    let key = resource_key(model, resource);
    delete(conn, &key, "acl", aclname.map(|a| ("acl", a))).await
}

/// Validate, persist, and attach a dynamic ACL binding. The binding is
/// compiled against the live model before anything is written, so a bad
/// projection fails the PUT rather than a later query.
pub async fn set_dynacl(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    name: &str,
    binding_doc: Option<Value>,
) -> Result<Option<Value>> {
    let binding_doc = match binding_doc {
        Some(doc) => doc,
        None => {
            delete_dynacl(conn, model, ctx, resource, Some(name)).await?;
            return Ok(None);
        }
    };

    enforce_right(model, resource, Right::Owner, ctx)?;
    let binding = ermpath::compile_binding(model, resource, name, &binding_doc, Some(ctx))?;

    let key = resource_key(model, resource);
    let prior = upsert(
        conn,
        &key,
        "dynacl",
        "binding_name",
        name,
        "binding",
        StoreValue::Json(binding_doc),
    )
    .await?;
    dynacls_mut(model, resource)?.insert(name.to_string(), binding);
    Ok(prior)
}

/// Delete one binding, or purge all of them when `name` is `None`.
pub async fn delete_dynacl(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
    name: Option<&str>,
) -> Result<()> {
    enforce_right(model, resource, Right::Owner, ctx)?;
    let key = resource_key(model, resource);
    delete(conn, &key, "dynacl", name.map(|n| ("binding_name", n))).await?;
    match name {
        Some(name) => {
            dynacls_mut(model, resource)?.remove(name);
        }
        None => dynacls_mut(model, resource)?.clear(),
    }
    Ok(())
}

/// Purge every metadata kind for a resource ahead of its deletion.
pub async fn purge_metadata(
    conn: &mut sqlx::PgConnection,
    model: &mut Model,
    ctx: &RequestContext,
    resource: Resource,
) -> Result<()> {
    delete_annotation(conn, model, ctx, resource, None).await?;
    delete_acl(conn, model, ctx, resource, None, true).await?;
    if matches!(
        resource,
        Resource::Table(_) | Resource::Column(_) | Resource::KeyRef(_)
    ) {
        delete_dynacl(conn, model, ctx, resource, None).await?;
    }
    Ok(())
}
