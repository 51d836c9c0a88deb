//! Single-pass catalog introspection: assemble a [`Model`] snapshot
//! from the introspection views.
//!
//! Cross-references between passes always go by stable row id, never by
//! name, so self-referential foreign keys and other cycles resolve
//! naturally: columns are interned before any constraint mentions them.

use crate::config::CatalogConfig;
use crate::rows::{self, ColumnDoc, DynaclTarget, IntrospectionRows, TypeRow};
use models::graph::ColumnDef;
use models::{
    Acls, ColumnId, ConstraintName, Error, KeyRefId, Model, ReferenceRule, Resource, Result,
    TableId, TableKind, TypeRegistry,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Introspect the catalog visible to `conn` into a fresh model
/// snapshot.
pub async fn introspect(
    conn: &mut sqlx::PgConnection,
    config: &CatalogConfig,
) -> Result<Model> {
    let rows = rows::fetch_introspection_rows(conn).await?;
    tracing::debug!(
        schemas = rows.schemas.len(),
        tables = rows.tables.len(),
        keys = rows.keys.len(),
        fkeys = rows.fkeys.len(),
        "introspected catalog snapshot"
    );
    build_model(rows, config)
}

/// Assemble a model from already-fetched introspection rows.
pub fn build_model(rows: IntrospectionRows, config: &CatalogConfig) -> Result<Model> {
    let mut model = Model::new(
        rows.version,
        json_map(&rows.catalog_annotations),
        Acls::from_json(&rows.catalog_acls),
    );
    model.types = register_types(&rows.types, config)?;

    let mut schema_ids: BTreeMap<String, _> = BTreeMap::new();
    for s in &rows.schemas {
        let id = model.add_schema(
            &s.name,
            s.comment.clone(),
            json_map(&s.annotations),
            Acls::from_json(&s.acls),
        )?;
        schema_ids.insert(s.rid.clone(), id);
    }

    let mut table_ids: BTreeMap<String, TableId> = BTreeMap::new();
    let mut column_ids: BTreeMap<String, ColumnId> = BTreeMap::new();
    for t in &rows.tables {
        let schema = *schema_ids.get(&t.schema_rid).ok_or_else(|| {
            Error::ConflictModel(format!(
                "Requested schema \"{}\" does not exist.",
                t.schema_rid
            ))
        })?;
        let schema_name = model.schema(schema).name.clone();
        let table = model.add_table(
            schema,
            &t.name,
            TableKind::parse(&t.kind)?,
            t.comment.clone(),
            json_map(&t.annotations),
            Acls::from_json(&t.acls),
        )?;
        table_ids.insert(t.rid.clone(), table);

        let docs: Vec<ColumnDoc> =
            serde_json::from_value(t.column_documents.clone()).map_err(|e| {
                Error::BadData(format!(
                    "Introspection of table \"{}\".\"{}\" failed: {}",
                    schema_name, t.name, e
                ))
            })?;
        for doc in docs {
            let column_type = match model.types.lookup(&doc.type_rid, false) {
                Ok(t) => t,
                Err(err) => {
                    return Err(match model.types.disallowed_name(&doc.type_rid) {
                        Some(tname) => Error::ConflictModel(format!(
                            "Disallowed type \"{}\" requested for column \"{}\".\"{}\".\"{}\".",
                            tname, schema_name, t.name, doc.column_name
                        )),
                        None => err,
                    })
                }
            };
            let default = column_type.default_value(doc.column_default.as_deref());
            let column = model.add_column(
                table,
                ColumnDef {
                    name: doc.column_name.clone(),
                    column_type,
                    nullok: !doc.not_null,
                    default,
                    comment: doc.comment.clone(),
                    annotations: json_map(&doc.annotations),
                    acls: Acls::from_json(&doc.acls),
                },
            )?;
            column_ids.insert(doc.rid.clone(), column);
        }
    }

    for k in &rows.keys {
        let cols = match intern_columns(&column_ids, &k.column_rids) {
            Some(cols) => cols,
            // An endpoint outside the loaded model: not our constraint.
            None => continue,
        };
        model.add_unique(
            cols,
            constraint_name(k.pseudo, &k.constraint_schema, &k.constraint_name, &k.rid),
            k.pseudo,
            k.comment.clone(),
            json_map(&k.annotations),
        )?;
    }

    let mut keyref_ids: BTreeMap<String, KeyRefId> = BTreeMap::new();
    for f in &rows.fkeys {
        let fk_cols = match intern_columns(&column_ids, &f.fk_column_rids) {
            Some(cols) => cols,
            None => continue,
        };
        let pk_cols = match intern_columns(&column_ids, &f.pk_column_rids) {
            Some(cols) => cols,
            None => continue,
        };
        let id = model.add_fkey_reference(
            fk_cols,
            pk_cols,
            constraint_name(f.pseudo, &f.constraint_schema, &f.constraint_name, &f.rid),
            f.pseudo,
            ReferenceRule::parse(&f.delete_rule),
            ReferenceRule::parse(&f.update_rule),
            f.comment.clone(),
            json_map(&f.annotations),
            Acls::from_json(&f.acls),
        )?;
        keyref_ids.insert(f.rid.clone(), id);
    }

    for d in &rows.dynacls {
        if !d.binding.is_object() && !d.binding.is_string() {
            // A false binding suppresses an inherited one; nothing to
            // compile.
            tracing::debug!(binding = %d.binding_name, "skipping disabled ACL binding");
            continue;
        }
        let resource = match d.target {
            DynaclTarget::Table => match table_ids.get(&d.resource_rid) {
                Some(t) => Resource::Table(*t),
                None => continue,
            },
            DynaclTarget::Column => match column_ids.get(&d.resource_rid) {
                Some(c) => Resource::Column(*c),
                None => continue,
            },
            DynaclTarget::Fkey => match keyref_ids.get(&d.resource_rid) {
                Some(kr) => Resource::KeyRef(*kr),
                None => continue,
            },
        };
        let binding =
            ermpath::compile_binding(&model, resource, &d.binding_name, &d.binding, None)?;
        let name = d.binding_name.clone();
        match resource {
            Resource::Table(t) => {
                model.table_mut(t).dynacls.insert(name, binding);
            }
            Resource::Column(c) => {
                model.column_mut(c).dynacls.insert(name, binding);
            }
            Resource::KeyRef(kr) => {
                model.key_reference_mut(kr).dynacls.insert(name, binding);
            }
            Resource::Catalog | Resource::Schema(_) => unreachable!(),
        }
    }

    if config.hide_internal_schemas {
        for name in &config.internal_schemas {
            model.hide_schema(name);
        }
    }

    model.check_primary_keys(config.require_primary_keys)?;
    Ok(model)
}

/// Register types leaf-first regardless of row order: bases, then
/// composites as their dependencies appear.
fn register_types(type_rows: &[TypeRow], config: &CatalogConfig) -> Result<TypeRegistry> {
    let mut registry = TypeRegistry::new(config.disallowed_types.clone());
    let mut pending: Vec<&TypeRow> = Vec::new();
    for row in type_rows {
        if row.array_element_type_rid.is_none() && row.domain_element_type_rid.is_none() {
            registry.add_base(row.rid.clone(), &row.type_name);
        } else {
            pending.push(row);
        }
    }
    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();
        for row in pending {
            let registered = if let Some(elem) = &row.array_element_type_rid {
                registry
                    .add_array(row.rid.clone(), &row.type_name, elem)
                    .is_ok()
            } else {
                let base = row.domain_element_type_rid.as_ref().unwrap();
                registry
                    .add_domain(
                        row.rid.clone(),
                        &row.type_name,
                        base,
                        row.domain_default.as_deref(),
                        row.domain_notnull,
                    )
                    .is_ok()
            };
            if !registered {
                still_pending.push(row);
            }
        }
        if still_pending.len() == before {
            return Err(Error::ConflictModel(format!(
                "Requested type \"{}\" does not exist.",
                still_pending[0]
                    .array_element_type_rid
                    .as_deref()
                    .or(still_pending[0].domain_element_type_rid.as_deref())
                    .unwrap_or("?")
            )));
        }
        pending = still_pending;
    }
    Ok(registry)
}

fn intern_columns(
    column_ids: &BTreeMap<String, ColumnId>,
    rids: &[String],
) -> Option<Vec<ColumnId>> {
    rids.iter().map(|rid| column_ids.get(rid).copied()).collect()
}

fn constraint_name(
    pseudo: bool,
    schema: &str,
    name: &Option<String>,
    rid: &str,
) -> ConstraintName {
    if pseudo {
        ConstraintName::pseudo(name.clone().unwrap_or_else(|| rid.to_string()))
    } else {
        ConstraintName::new(schema, name.clone().unwrap_or_default())
    }
}

fn json_map(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::rows::{DynaclRow, FkeyRow, KeyRow, SchemaRow, TableRow};
    use serde_json::json;

    pub fn type_rows() -> Vec<TypeRow> {
        vec![
            TypeRow {
                rid: "ty-text".into(),
                type_name: "text".into(),
                array_element_type_rid: None,
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
            TypeRow {
                rid: "ty-int8".into(),
                type_name: "int8".into(),
                array_element_type_rid: None,
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
            // Deliberately listed before its element type is needed to
            // exercise dependency-ordered registration.
            TypeRow {
                rid: "ty-markdown".into(),
                type_name: "markdown".into(),
                array_element_type_rid: None,
                domain_element_type_rid: Some("ty-text".into()),
                domain_notnull: false,
                domain_default: None,
            },
            TypeRow {
                rid: "ty-text-arr".into(),
                type_name: "text[]".into(),
                array_element_type_rid: Some("ty-text".into()),
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
        ]
    }

    pub fn column_doc(rid: &str, name: &str, type_rid: &str, not_null: bool) -> Value {
        json!({
            "RID": rid,
            "column_name": name,
            "type_rid": type_rid,
            "not_null": not_null,
            "column_default": null,
            "comment": null,
            "annotations": {},
            "acls": {},
        })
    }

    /// The catalog of the standard two-table model, as raw rows:
    /// S.T1(id pk, name, tags) and S.T2(id pk, t1id -> T1.id, owner_id)
    /// with one select binding over T2.owner_id.
    pub fn sample_rows() -> IntrospectionRows {
        IntrospectionRows {
            version: chrono::DateTime::from_timestamp(1_700_000_000, 0)
                .expect("valid timestamp")
                .with_timezone(&chrono::Utc),
            catalog_annotations: json!({"tag:example.com,2024:display": {"name": "demo"}}),
            catalog_acls: json!({"owner": ["admin"], "enumerate": ["*"], "select": ["*"]}),
            schemas: vec![SchemaRow {
                rid: "s1".into(),
                name: "S".into(),
                comment: Some("demo schema".into()),
                annotations: json!({}),
                acls: json!({}),
            }],
            types: type_rows(),
            tables: vec![
                TableRow {
                    rid: "t1".into(),
                    schema_rid: "s1".into(),
                    name: "T1".into(),
                    kind: "r".into(),
                    comment: None,
                    annotations: json!({}),
                    acls: json!({}),
                    column_documents: json!([
                        column_doc("c-t1-id", "id", "ty-int8", true),
                        column_doc("c-t1-name", "name", "ty-markdown", false),
                        column_doc("c-t1-tags", "tags", "ty-text-arr", false),
                    ]),
                },
                TableRow {
                    rid: "t2".into(),
                    schema_rid: "s1".into(),
                    name: "T2".into(),
                    kind: "r".into(),
                    comment: None,
                    annotations: json!({}),
                    acls: json!({}),
                    column_documents: json!([
                        column_doc("c-t2-id", "id", "ty-int8", true),
                        column_doc("c-t2-t1id", "t1id", "ty-int8", false),
                        column_doc("c-t2-owner", "owner_id", "ty-text", false),
                    ]),
                },
            ],
            keys: vec![
                KeyRow {
                    rid: "k1".into(),
                    constraint_schema: "S".into(),
                    constraint_name: Some("T1_id_key".into()),
                    column_rids: vec!["c-t1-id".into()],
                    comment: None,
                    annotations: json!({}),
                    pseudo: false,
                },
                KeyRow {
                    rid: "k2".into(),
                    constraint_schema: "S".into(),
                    constraint_name: Some("T2_id_key".into()),
                    column_rids: vec!["c-t2-id".into()],
                    comment: None,
                    annotations: json!({}),
                    pseudo: false,
                },
            ],
            fkeys: vec![FkeyRow {
                rid: "fk1".into(),
                constraint_schema: "S".into(),
                constraint_name: Some("T2_t1id_fkey".into()),
                fk_column_rids: vec!["c-t2-t1id".into()],
                pk_column_rids: vec!["c-t1-id".into()],
                delete_rule: "CASCADE".into(),
                update_rule: "NO ACTION".into(),
                comment: None,
                annotations: json!({}),
                acls: json!({}),
                pseudo: false,
            }],
            dynacls: vec![DynaclRow {
                target: DynaclTarget::Table,
                resource_rid: "t2".into(),
                binding_name: "owner_rows".into(),
                binding: json!({
                    "types": ["select"],
                    "projection": ["owner_id"],
                    "projection_type": "acl",
                }),
            }],
        }
    }
}
