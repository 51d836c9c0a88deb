// End-to-end checks over the public crate APIs: raw introspection rows
// in, authorization decisions and compiled SQL out.

use catalog_sql::rows::{DynaclRow, DynaclTarget, IntrospectionRows, KeyRow};
use catalog_sql::{build_model, CatalogConfig};
use ermpath::{entity_path_from_sql, EntityPath, Name, Predicate, TextOp};
use models::{
    doc, has_right, Identity, Model, RequestContext, Resource, Right, TableId,
};
use serde_json::json;

fn sample_rows() -> IntrospectionRows {
    // S.T1(id pk, name, value) and S.T2(id pk, t1id -> T1.id, owner_id,
    // tags text[]), everything enumerable, catalog owned by alice.
    let column = |rid: &str, name: &str, type_rid: &str, not_null: bool| {
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
    };
    IntrospectionRows {
        version: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        catalog_annotations: json!({}),
        catalog_acls: json!({"owner": ["alice"], "enumerate": ["*"]}),
        schemas: vec![catalog_sql::rows::SchemaRow {
            rid: "s1".into(),
            name: "S".into(),
            comment: None,
            annotations: json!({}),
            acls: json!({}),
        }],
        types: vec![
            catalog_sql::rows::TypeRow {
                rid: "ty-text".into(),
                type_name: "text".into(),
                array_element_type_rid: None,
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
            catalog_sql::rows::TypeRow {
                rid: "ty-int8".into(),
                type_name: "int8".into(),
                array_element_type_rid: None,
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
            catalog_sql::rows::TypeRow {
                rid: "ty-text-arr".into(),
                type_name: "text[]".into(),
                array_element_type_rid: Some("ty-text".into()),
                domain_element_type_rid: None,
                domain_notnull: false,
                domain_default: None,
            },
        ],
        tables: vec![
            catalog_sql::rows::TableRow {
                rid: "t1".into(),
                schema_rid: "s1".into(),
                name: "T1".into(),
                kind: "r".into(),
                comment: None,
                annotations: json!({}),
                acls: json!({}),
                column_documents: json!([
                    column("c-t1-id", "id", "ty-int8", true),
                    column("c-t1-name", "name", "ty-text", false),
                    column("c-t1-value", "value", "ty-text", false),
                ]),
            },
            catalog_sql::rows::TableRow {
                rid: "t2".into(),
                schema_rid: "s1".into(),
                name: "T2".into(),
                kind: "r".into(),
                comment: None,
                annotations: json!({}),
                acls: json!({}),
                column_documents: json!([
                    column("c-t2-id", "id", "ty-int8", true),
                    column("c-t2-t1id", "t1id", "ty-int8", false),
                    column("c-t2-owner", "owner_id", "ty-text", false),
                    column("c-t2-tags", "tags", "ty-text-arr", false),
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
        fkeys: vec![catalog_sql::rows::FkeyRow {
            rid: "fk1".into(),
            constraint_schema: "S".into(),
            constraint_name: Some("T2_t1id_fkey".into()),
            fk_column_rids: vec!["c-t2-t1id".into()],
            pk_column_rids: vec!["c-t1-id".into()],
            delete_rule: "NO ACTION".into(),
            update_rule: "NO ACTION".into(),
            comment: None,
            annotations: json!({}),
            acls: json!({}),
            pseudo: false,
        }],
        dynacls: vec![],
    }
}

fn lookup(model: &Model, table: &str) -> TableId {
    let s = model.lookup_schema("S").unwrap();
    model.lookup_table(s, table).unwrap()
}

#[test]
fn ownership_inherits_and_outsiders_are_denied() {
    let model = build_model(sample_rows(), &CatalogConfig::default()).unwrap();
    let t1 = lookup(&model, "T1");

    let alice = RequestContext::new(Identity::new(["alice"]));
    assert_eq!(
        has_right(&model, Resource::Table(t1), Right::Owner, &alice),
        Some(true)
    );

    let bob = RequestContext::new(Identity::new(["bob"]));
    assert_eq!(
        has_right(&model, Resource::Table(t1), Right::Select, &bob),
        Some(false)
    );
}

#[test]
fn write_grants_imply_insert() {
    let mut model = build_model(sample_rows(), &CatalogConfig::default()).unwrap();
    let t1 = lookup(&model, "T1");
    model
        .table_mut(t1)
        .acls
        .set(Right::Write, vec!["grp1".to_string()]);

    let grp1 = RequestContext::new(Identity::new(["grp1"]));
    assert_eq!(
        has_right(&model, Resource::Table(t1), Right::Insert, &grp1),
        Some(true)
    );
}

#[test]
fn dynamic_binding_gates_select_sql() {
    let mut rows = sample_rows();
    rows.dynacls.push(DynaclRow {
        target: DynaclTarget::Table,
        resource_rid: "t2".into(),
        binding_name: "owner_rows".into(),
        binding: json!({
            "types": ["select"],
            "projection": ["owner_id"],
            "projection_type": "acl",
        }),
    });
    let model = build_model(rows, &CatalogConfig::default()).unwrap();
    let t2 = lookup(&model, "T2");

    let x = RequestContext::new(Identity::new(["x"]));
    assert_eq!(has_right(&model, Resource::Table(t2), Right::Select, &x), None);

    let epath = EntityPath::new(&model, t2, None);
    assert_eq!(
        entity_path_from_sql(&epath, &x, Right::Select, "").unwrap(),
        "(SELECT * FROM \"S\".\"T2\" s WHERE (s.\"owner_id\" = ANY(ARRAY['x','*']))) AS t0"
    );
}

#[test]
fn ciregexp_filters_compile() {
    let model = build_model(sample_rows(), &CatalogConfig::default()).unwrap();
    let t1 = lookup(&model, "T1");
    let alice = RequestContext::new(Identity::new(["alice"]));

    let mut epath = EntityPath::new(&model, t1, None);
    epath
        .add_filter(
            Predicate::text(Name::bare("name"), TextOp::CiRegexp, "^a"),
            Some(&alice),
        )
        .unwrap();
    assert_eq!(
        epath.sql_where("").unwrap(),
        "((t0.\"name\"::text ~* '^a'))"
    );
}

#[test]
fn array_equality_distributes() {
    let model = build_model(sample_rows(), &CatalogConfig::default()).unwrap();
    let t2 = lookup(&model, "T2");
    let alice = RequestContext::new(Identity::new(["alice"]));

    let mut epath = EntityPath::new(&model, t2, None);
    epath
        .add_filter(
            Predicate::binary(Name::bare("tags"), ermpath::BinaryOp::Eq, json!("red")),
            Some(&alice),
        )
        .unwrap();
    assert_eq!(
        epath.sql_where("").unwrap(),
        "((SELECT bool_or(v = 'red') FROM unnest(t0.\"tags\") x(v)))"
    );
}

#[test]
fn duplicate_unique_constraints_abort_introspection() {
    let mut rows = sample_rows();
    rows.keys.push(KeyRow {
        rid: "k3".into(),
        constraint_schema: "S".into(),
        constraint_name: Some("T1_id_also".into()),
        column_rids: vec!["c-t1-id".into()],
        comment: None,
        annotations: json!({}),
        pseudo: false,
    });
    match build_model(rows, &CatalogConfig::default()) {
        Err(models::Error::ConflictModel(msg)) => {
            assert!(msg.contains("T1_id_also"), "{}", msg);
            assert!(msg.contains("T1_id_key"), "{}", msg);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn model_documents_round_trip_stably() {
    let model = build_model(sample_rows(), &CatalogConfig::default()).unwrap();
    let again = build_model(sample_rows(), &CatalogConfig::default()).unwrap();

    let alice = RequestContext::new(Identity::new(["alice"]));
    let alice2 = RequestContext::new(Identity::new(["alice"]));
    assert_eq!(doc::model_doc(&model, &alice), doc::model_doc(&again, &alice2));
}
