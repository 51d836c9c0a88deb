//! Row shapes of the introspection views, and their fetchers.
//!
//! Fetching is separated from model assembly so the builder in
//! `introspect` stays pure: tests feed it synthetic rows and never
//! touch a database.

use crate::{db_error, STORAGE_SCHEMA};
use chrono::{DateTime, Utc};
use models::Result;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct SchemaRow {
    pub rid: String,
    pub name: String,
    pub comment: Option<String>,
    pub annotations: Value,
    pub acls: Value,
}

#[derive(Debug, Clone)]
pub struct TypeRow {
    pub rid: String,
    pub type_name: String,
    pub array_element_type_rid: Option<String>,
    pub domain_element_type_rid: Option<String>,
    pub domain_notnull: bool,
    pub domain_default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableRow {
    pub rid: String,
    pub schema_rid: String,
    pub name: String,
    pub kind: String,
    pub comment: Option<String>,
    pub annotations: Value,
    pub acls: Value,
    /// Column documents in ordinal order, as a JSON array.
    pub column_documents: Value,
}

/// One column document inside `TableRow::column_documents`.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDoc {
    #[serde(rename = "RID")]
    pub rid: String,
    pub column_name: String,
    pub type_rid: String,
    pub not_null: bool,
    #[serde(default)]
    pub column_default: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub annotations: Value,
    #[serde(default)]
    pub acls: Value,
}

#[derive(Debug, Clone)]
pub struct KeyRow {
    pub rid: String,
    /// Empty for pseudo keys, which are not owned by a database schema.
    pub constraint_schema: String,
    pub constraint_name: Option<String>,
    pub column_rids: Vec<String>,
    pub comment: Option<String>,
    pub annotations: Value,
    pub pseudo: bool,
}

#[derive(Debug, Clone)]
pub struct FkeyRow {
    pub rid: String,
    pub constraint_schema: String,
    pub constraint_name: Option<String>,
    pub fk_column_rids: Vec<String>,
    pub pk_column_rids: Vec<String>,
    pub delete_rule: String,
    pub update_rule: String,
    pub comment: Option<String>,
    pub annotations: Value,
    pub acls: Value,
    pub pseudo: bool,
}

/// Which resource class a dynamic-binding row attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynaclTarget {
    Table,
    Column,
    Fkey,
}

#[derive(Debug, Clone)]
pub struct DynaclRow {
    pub target: DynaclTarget,
    pub resource_rid: String,
    pub binding_name: String,
    pub binding: Value,
}

/// Everything one introspection pass reads, in one consistent snapshot.
#[derive(Debug, Clone)]
pub struct IntrospectionRows {
    pub version: DateTime<Utc>,
    pub catalog_annotations: Value,
    pub catalog_acls: Value,
    pub schemas: Vec<SchemaRow>,
    pub types: Vec<TypeRow>,
    pub tables: Vec<TableRow>,
    pub keys: Vec<KeyRow>,
    pub fkeys: Vec<FkeyRow>,
    pub dynacls: Vec<DynaclRow>,
}

pub async fn current_model_version(conn: &mut sqlx::PgConnection) -> Result<DateTime<Utc>> {
    let row = sqlx::query(&format!(
        "SELECT COALESCE((SELECT mlm.ts FROM {}.model_last_modified mlm \
         ORDER BY mlm.ts DESC LIMIT 1), now()) AS ts;",
        STORAGE_SCHEMA
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;
    row.try_get("ts").map_err(db_error)
}

/// Read the full introspection snapshot from the current transaction.
pub async fn fetch_introspection_rows(
    conn: &mut sqlx::PgConnection,
) -> Result<IntrospectionRows> {
    let version = current_model_version(conn).await?;

    let row = sqlx::query(&format!(
        "SELECT \
           COALESCE((SELECT jsonb_object_agg(a.annotation_uri, a.annotation_value) \
                     FROM {0}.known_catalog_annotations a), '{{}}'::jsonb) AS annotations, \
           COALESCE((SELECT jsonb_object_agg(a.acl, to_jsonb(a.members)) \
                     FROM {0}.known_catalog_acls a), '{{}}'::jsonb) AS acls;",
        STORAGE_SCHEMA
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;
    let catalog_annotations: Value = row.try_get("annotations").map_err(db_error)?;
    let catalog_acls: Value = row.try_get("acls").map_err(db_error)?;

    let schemas = sqlx::query(&format!(
        "SELECT rid, name, comment, annotations, acls FROM {}.known_schemas_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .into_iter()
    .map(schema_row)
    .collect::<sqlx::Result<Vec<_>>>()
    .map_err(db_error)?;

    let types = sqlx::query(&format!(
        "SELECT rid, type_name, array_element_type_rid, domain_element_type_rid, \
                COALESCE(domain_notnull, False) AS domain_notnull, domain_default \
         FROM {}.known_types;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .into_iter()
    .map(type_row)
    .collect::<sqlx::Result<Vec<_>>>()
    .map_err(db_error)?;

    let tables = sqlx::query(&format!(
        "SELECT rid, schema_rid, name, kind, comment, annotations, acls, column_documents \
         FROM {}.known_tables_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .into_iter()
    .map(table_row)
    .collect::<sqlx::Result<Vec<_>>>()
    .map_err(db_error)?;

    let mut keys = Vec::new();
    for row in sqlx::query(&format!(
        "SELECT rid, schema_name, constraint_name, column_rids, comment, annotations \
         FROM {}.known_keys_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    {
        keys.push(key_row(row, false).map_err(db_error)?);
    }
    for row in sqlx::query(&format!(
        "SELECT rid, constraint_name, column_rids, comment, annotations \
         FROM {}.known_pseudo_keys_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    {
        keys.push(key_row(row, true).map_err(db_error)?);
    }

    let mut fkeys = Vec::new();
    for row in sqlx::query(&format!(
        "SELECT rid, schema_name, constraint_name, fk_column_rids, pk_column_rids, \
                delete_rule, update_rule, comment, annotations, acls \
         FROM {}.known_fkeys_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    {
        fkeys.push(fkey_row(row, false).map_err(db_error)?);
    }
    for row in sqlx::query(&format!(
        "SELECT rid, constraint_name, fk_column_rids, pk_column_rids, \
                comment, annotations, acls \
         FROM {}.known_pseudo_fkeys_denorm;",
        STORAGE_SCHEMA
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    {
        fkeys.push(fkey_row(row, true).map_err(db_error)?);
    }

    let mut dynacls = Vec::new();
    for (view, rid_col, target) in [
        ("known_table_dynacls", "table_rid", DynaclTarget::Table),
        ("known_column_dynacls", "column_rid", DynaclTarget::Column),
        ("known_fkey_dynacls", "fkey_rid", DynaclTarget::Fkey),
        ("known_pseudo_fkey_dynacls", "fkey_rid", DynaclTarget::Fkey),
    ] {
        for row in sqlx::query(&format!(
            "SELECT {} AS resource_rid, binding_name, binding FROM {}.{};",
            rid_col, STORAGE_SCHEMA, view
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?
        {
            dynacls.push(
                dynacl_row(row, target).map_err(db_error)?,
            );
        }
    }

    Ok(IntrospectionRows {
        version,
        catalog_annotations,
        catalog_acls,
        schemas,
        types,
        tables,
        keys,
        fkeys,
        dynacls,
    })
}

fn schema_row(row: PgRow) -> sqlx::Result<SchemaRow> {
    Ok(SchemaRow {
        rid: row.try_get("rid")?,
        name: row.try_get("name")?,
        comment: row.try_get("comment")?,
        annotations: row.try_get("annotations")?,
        acls: row.try_get("acls")?,
    })
}

fn type_row(row: PgRow) -> sqlx::Result<TypeRow> {
    Ok(TypeRow {
        rid: row.try_get("rid")?,
        type_name: row.try_get("type_name")?,
        array_element_type_rid: row.try_get("array_element_type_rid")?,
        domain_element_type_rid: row.try_get("domain_element_type_rid")?,
        domain_notnull: row.try_get("domain_notnull")?,
        domain_default: row.try_get("domain_default")?,
    })
}

fn table_row(row: PgRow) -> sqlx::Result<TableRow> {
    Ok(TableRow {
        rid: row.try_get("rid")?,
        schema_rid: row.try_get("schema_rid")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        comment: row.try_get("comment")?,
        annotations: row.try_get("annotations")?,
        acls: row.try_get("acls")?,
        column_documents: row.try_get("column_documents")?,
    })
}

fn key_row(row: PgRow, pseudo: bool) -> sqlx::Result<KeyRow> {
    Ok(KeyRow {
        rid: row.try_get("rid")?,
        constraint_schema: if pseudo {
            String::new()
        } else {
            row.try_get("schema_name")?
        },
        constraint_name: row.try_get("constraint_name")?,
        column_rids: row.try_get("column_rids")?,
        comment: row.try_get("comment")?,
        annotations: row.try_get("annotations")?,
        pseudo,
    })
}

fn fkey_row(row: PgRow, pseudo: bool) -> sqlx::Result<FkeyRow> {
    Ok(FkeyRow {
        rid: row.try_get("rid")?,
        constraint_schema: if pseudo {
            String::new()
        } else {
            row.try_get("schema_name")?
        },
        constraint_name: row.try_get("constraint_name")?,
        fk_column_rids: row.try_get("fk_column_rids")?,
        pk_column_rids: row.try_get("pk_column_rids")?,
        delete_rule: if pseudo {
            "NO ACTION".to_string()
        } else {
            row.try_get("delete_rule")?
        },
        update_rule: if pseudo {
            "NO ACTION".to_string()
        } else {
            row.try_get("update_rule")?
        },
        comment: row.try_get("comment")?,
        annotations: row.try_get("annotations")?,
        acls: row.try_get("acls")?,
        pseudo,
    })
}

fn dynacl_row(row: PgRow, target: DynaclTarget) -> sqlx::Result<DynaclRow> {
    Ok(DynaclRow {
        target,
        resource_rid: row.try_get("resource_rid")?,
        binding_name: row.try_get("binding_name")?,
        binding: row.try_get("binding")?,
    })
}
