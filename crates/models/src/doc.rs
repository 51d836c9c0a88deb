//! Canonical JSON documents for model resources.
//!
//! Documents are what the request layer returns for model reads and
//! what round-trips through catalog dumps: serializing the same model
//! twice yields identical documents, map ordering included, because all
//! containers iterate in name order.

use crate::acl::Right;
use crate::context::RequestContext;
use crate::graph::{ColumnId, KeyRefId, Model, SchemaId, TableId, UniqueId};
use crate::rights::{columns_in_order, has_right, rights_summary, Resource};
use crate::types::Type;
use serde_json::{json, Map, Value};

pub fn model_doc(model: &Model, ctx: &RequestContext) -> Value {
    let mut schemas = Map::new();
    for (id, schema) in model.schemas() {
        if has_right(model, Resource::Schema(id), Right::Enumerate, ctx) == Some(false) {
            continue;
        }
        schemas.insert(schema.name.clone(), schema_doc(model, id, ctx));
    }
    let mut doc = json!({
        "schemas": schemas,
        "annotations": model.annotations,
        "rights": rights_doc(model, Resource::Catalog, ctx),
    });
    if has_right(model, Resource::Catalog, Right::Owner, ctx) == Some(true) {
        doc["acls"] = serde_json::to_value(&model.acls).expect("acls serialize");
    }
    doc
}

pub fn schema_doc(model: &Model, id: SchemaId, ctx: &RequestContext) -> Value {
    let schema = model.schema(id);
    let mut tables = Map::new();
    for (name, table) in &schema.tables {
        if has_right(model, Resource::Table(*table), Right::Enumerate, ctx) == Some(false) {
            continue;
        }
        tables.insert(name.clone(), table_doc(model, *table, ctx));
    }
    let mut doc = json!({
        "schema_name": schema.name,
        "comment": schema.comment,
        "annotations": schema.annotations,
        "rights": rights_doc(model, Resource::Schema(id), ctx),
        "tables": tables,
    });
    if has_right(model, Resource::Schema(id), Right::Owner, ctx) == Some(true) {
        doc["acls"] = serde_json::to_value(&schema.acls).expect("acls serialize");
    }
    doc
}

pub fn table_doc(model: &Model, id: TableId, ctx: &RequestContext) -> Value {
    let table = model.table(id);
    let columns: Vec<Value> = columns_in_order(model, id, ctx)
        .into_iter()
        .map(|c| column_doc(model, c, ctx))
        .collect();
    let keys: Vec<Value> = table
        .uniques
        .values()
        .map(|u| key_doc(model, *u))
        .collect();
    let foreign_keys: Vec<Value> = table
        .fkeys
        .values()
        .flat_map(|fk| model.fkey(*fk).references.values())
        .filter(|kr| {
            has_right(model, Resource::KeyRef(**kr), Right::Enumerate, ctx) != Some(false)
        })
        .map(|kr| key_reference_doc(model, *kr, ctx))
        .collect();

    let mut doc = json!({
        "schema_name": model.schema(table.schema).name,
        "table_name": table.name,
        "kind": table.kind.as_str(),
        "comment": table.comment,
        "annotations": table.annotations,
        "rights": rights_doc(model, Resource::Table(id), ctx),
        "column_definitions": columns,
        "keys": keys,
        "foreign_keys": foreign_keys,
    });
    if has_right(model, Resource::Table(id), Right::Owner, ctx) == Some(true) {
        doc["acls"] = serde_json::to_value(&table.acls).expect("acls serialize");
        doc["acl_bindings"] = dynacls_doc(table.dynacls.iter());
    }
    doc
}

pub fn column_doc(model: &Model, id: ColumnId, ctx: &RequestContext) -> Value {
    let column = model.column(id);
    let mut doc = json!({
        "name": column.name,
        "type": type_doc(&column.column_type),
        "nullok": column.nullok,
        "default": column.default,
        "comment": column.comment,
        "annotations": column.annotations,
        "rights": rights_doc(model, Resource::Column(id), ctx),
    });
    if has_right(model, Resource::Table(column.table), Right::Owner, ctx) == Some(true) {
        doc["acls"] = serde_json::to_value(&column.acls).expect("acls serialize");
        doc["acl_bindings"] = dynacls_doc(column.dynacls.iter());
    }
    doc
}

pub fn key_doc(model: &Model, id: UniqueId) -> Value {
    let unique = model.unique(id);
    json!({
        "names": [[unique.name.schema, unique.name.name]],
        "unique_columns": unique
            .columns
            .iter()
            .map(|c| model.column(c).name.clone())
            .collect::<Vec<_>>(),
        "comment": unique.comment,
        "annotations": unique.annotations,
    })
}

pub fn key_reference_doc(model: &Model, id: KeyRefId, ctx: &RequestContext) -> Value {
    let kr = model.key_reference(id);
    let fk_table = model.fkey(kr.fkey).table;
    let pk_table = model.unique(kr.unique).table;
    let col_ref = |table: TableId, col: ColumnId| {
        json!({
            "schema_name": model.schema(model.table(table).schema).name,
            "table_name": model.table(table).name,
            "column_name": model.column(col).name,
        })
    };
    let mut doc = json!({
        "names": [[kr.name.schema, kr.name.name]],
        "foreign_key_columns": kr
            .ref_map
            .pairs()
            .map(|(f, _)| col_ref(fk_table, f))
            .collect::<Vec<_>>(),
        "referenced_columns": kr
            .ref_map
            .pairs()
            .map(|(_, p)| col_ref(pk_table, p))
            .collect::<Vec<_>>(),
        "on_delete": kr.on_delete.as_str(),
        "on_update": kr.on_update.as_str(),
        "comment": kr.comment,
        "annotations": kr.annotations,
        "rights": rights_doc(model, Resource::KeyRef(id), ctx),
    });
    if has_right(model, Resource::KeyRef(id), Right::Owner, ctx) == Some(true) {
        doc["acls"] = serde_json::to_value(&kr.acls).expect("acls serialize");
        doc["acl_bindings"] = dynacls_doc(kr.dynacls.iter());
    }
    doc
}

pub fn type_doc(t: &Type) -> Value {
    match t {
        Type::Base { name } => json!({ "typename": name }),
        Type::Array { name, element } => json!({
            "typename": name,
            "is_array": true,
            "base_type": type_doc(element),
        }),
        Type::Domain {
            name,
            base,
            notnull,
            default,
        } => json!({
            "typename": name,
            "is_domain": true,
            "base_type": type_doc(base),
            "notnull": notnull,
            "default": default,
        }),
    }
}

fn rights_doc(model: &Model, resource: Resource, ctx: &RequestContext) -> Value {
    let mut doc = Map::new();
    for (right, decision) in rights_summary(model, resource, ctx) {
        doc.insert(
            right.as_str().to_string(),
            decision.map(Value::Bool).unwrap_or(Value::Null),
        );
    }
    Value::Object(doc)
}

fn dynacls_doc<'a>(bindings: impl Iterator<Item = (&'a String, &'a crate::AclBinding)>) -> Value {
    let mut doc = Map::new();
    for (name, binding) in bindings {
        doc.insert(name.clone(), binding.to_json());
    }
    Value::Object(doc)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::Right;
    use crate::context::Identity;
    use crate::graph::fixtures::{allow, two_table_model};

    #[test]
    fn documents_are_stable() {
        let mut model = two_table_model();
        allow(&mut model, Right::Owner, &["alice"]);
        let ctx = RequestContext::new(Identity::new(["alice"]));
        let a = model_doc(&model, &ctx);

        let mut again = two_table_model();
        allow(&mut again, Right::Owner, &["alice"]);
        let ctx2 = RequestContext::new(Identity::new(["alice"]));
        let b = model_doc(&again, &ctx2);

        assert_eq!(a, b);
    }

    #[test]
    fn acls_hidden_from_non_owners() {
        let mut model = two_table_model();
        allow(&mut model, Right::Owner, &["alice"]);
        allow(&mut model, Right::Enumerate, &["*"]);
        allow(&mut model, Right::Select, &["*"]);

        let bob = RequestContext::new(Identity::new(["bob"]));
        let doc = model_doc(&model, &bob);
        assert!(doc.get("acls").is_none());
        let t1 = &doc["schemas"]["S"]["tables"]["T1"];
        assert!(t1.get("acls").is_none());
        assert_eq!(t1["rights"]["select"], Value::Bool(true));
        assert_eq!(t1["rights"]["owner"], Value::Bool(false));

        let alice = RequestContext::new(Identity::new(["alice"]));
        let doc = model_doc(&model, &alice);
        assert!(doc.get("acls").is_some());
        assert!(doc["schemas"]["S"]["tables"]["T1"].get("acl_bindings").is_some());
    }

    #[test]
    fn table_doc_shape() {
        let mut model = two_table_model();
        allow(&mut model, Right::Owner, &["alice"]);
        let ctx = RequestContext::new(Identity::new(["alice"]));
        let s = model.lookup_schema("S").unwrap();
        let t2 = model.lookup_table(s, "T2").unwrap();
        let doc = table_doc(&model, t2, &ctx);

        assert_eq!(doc["table_name"], "T2");
        assert_eq!(doc["kind"], "table");
        let cols: Vec<&str> = doc["column_definitions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(cols, vec!["id", "t1id", "owner_id"]);

        let fkeys = doc["foreign_keys"].as_array().unwrap();
        assert_eq!(fkeys.len(), 1);
        assert_eq!(
            fkeys[0]["foreign_key_columns"][0]["column_name"],
            "t1id"
        );
        assert_eq!(fkeys[0]["referenced_columns"][0]["table_name"], "T1");
        assert_eq!(fkeys[0]["on_delete"], "NO ACTION");
    }

    #[test]
    fn array_type_doc_nests() {
        let model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        let tags = model.lookup_column(t1, "tags").unwrap();
        let doc = type_doc(&model.column(tags).column_type);
        assert_eq!(doc["typename"], "text[]");
        assert_eq!(doc["is_array"], true);
        assert_eq!(doc["base_type"]["typename"], "text");
    }
}
