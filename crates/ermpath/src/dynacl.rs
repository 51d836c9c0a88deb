//! Dynamic-ACL compilation: resolving binding projections against the
//! model and emitting the row- and column-gating SQL the authorization
//! engine injects into query plans.

use crate::name::Name;
use crate::path::{EntityPath, RefOp};
use crate::predicate::Predicate;
use models::ident::sql_literal;
use models::{
    columns_in_order, enforce_right, has_right, AclBinding, ColumnId, Error, Identity,
    JoinDirection, KeyRefId, Model, ProjectionFilter, ProjectionStep, ProjectionType,
    RequestContext, Resource, Result, Right, TableId,
};
use serde_json::Value;

/// Parse and compile a binding document against `model`, resolving its
/// projection from the table of the bound `resource` and fixing the
/// projection-type default from the projected column.
///
/// With a request context, filter columns are checked for `select`;
/// without one (introspection) rights checks are deferred.
pub fn compile_binding(
    model: &Model,
    resource: Resource,
    binding_name: &str,
    doc: &Value,
    ctx: Option<&RequestContext>,
) -> Result<AclBinding> {
    let mut binding = AclBinding::from_json(resource.class(), binding_name, doc)?;
    let (_epath, column) = projection_path(model, &binding, resource, binding_name, ctx)?;

    let base_type = model.column(column).column_type.base_type();
    match binding.projection_type {
        None => {
            binding.projection_type = Some(if base_type.name() == "text" {
                ProjectionType::Acl
            } else {
                ProjectionType::NonNull
            });
        }
        Some(ProjectionType::Acl) if base_type.name() != "text" => {
            return Err(Error::ConflictModel(format!(
                "ACL binding projection type \"acl\" not allowed for column {} in ACL binding {}.",
                model.column_display(column),
                binding_name
            )));
        }
        Some(_) => (),
    }
    tracing::debug!(
        binding = binding_name,
        column = %model.column_display(column),
        "compiled ACL binding projection"
    );
    Ok(binding)
}

/// The table a binding's projection is rooted at.
fn binding_base_table(model: &Model, resource: Resource) -> Result<TableId> {
    match resource {
        Resource::Table(t) => Ok(t),
        Resource::Column(c) => Ok(model.column(c).table),
        Resource::KeyRef(kr) => {
            let unique = model.key_reference(kr).unique;
            Ok(model.unique(unique).table)
        }
        Resource::Catalog | Resource::Schema(_) => Err(Error::BadData(
            "ACL bindings are not supported on this resource.".to_string(),
        )),
    }
}

/// Walk a binding projection into an entity path rooted at the bound
/// resource's table, returning the path and the projected column.
fn projection_path<'m>(
    model: &'m Model,
    binding: &AclBinding,
    resource: Resource,
    binding_name: &str,
    ctx: Option<&RequestContext>,
) -> Result<(EntityPath<'m>, ColumnId)> {
    let base = binding_base_table(model, resource)?;
    let mut epath = EntityPath::new(model, base, Some("base"));

    for step in &binding.steps {
        match step {
            ProjectionStep::Join {
                direction,
                constraint,
                alias,
                context,
            } => {
                if let Some(context) = context {
                    epath.set_context(context)?;
                }
                let here = epath.current_entity_table();
                let keyref = find_connected_keyref(model, here, *direction, constraint)
                    .ok_or_else(|| {
                        Error::ConflictModel(format!(
                            "No foreign key ({}, {}) found connected to table {} in ACL binding {}.",
                            constraint.0,
                            constraint.1,
                            model.table_display(here),
                            binding_name
                        ))
                    })?;
                let refop = match direction {
                    JoinDirection::Inbound => RefOp::Inbound,
                    JoinDirection::Outbound => RefOp::Outbound,
                };
                epath.add_link(keyref, refop, alias.as_deref())?;
            }
            ProjectionStep::Filter(filter) => {
                let pred = filter_predicate(filter)?;
                epath.add_filter(pred, ctx)?;
            }
        }
    }

    let column = model.lookup_column(epath.current_entity_table(), &binding.column)?;
    Ok((epath, column))
}

/// Find a key reference with the given constraint name connected to
/// `table` in the requested direction.
fn find_connected_keyref(
    model: &Model,
    table: TableId,
    direction: JoinDirection,
    constraint: &(String, String),
) -> Option<KeyRefId> {
    let matches = |kr: KeyRefId| {
        let name = &model.key_reference(kr).name;
        name.schema == constraint.0 && name.name == constraint.1
    };
    match direction {
        JoinDirection::Inbound => model
            .table(table)
            .uniques
            .values()
            .flat_map(|u| model.unique(*u).table_references.values())
            .flatten()
            .copied()
            .find(|kr| matches(*kr)),
        JoinDirection::Outbound => model
            .table(table)
            .fkeys
            .values()
            .flat_map(|fk| model.fkey(*fk).references.values())
            .copied()
            .find(|kr| matches(*kr)),
    }
}

fn filter_predicate(filter: &ProjectionFilter) -> Result<Predicate> {
    let pred = match filter {
        ProjectionFilter::Conjunction { elements, negate } => {
            let inner = elements
                .iter()
                .map(filter_predicate)
                .collect::<Result<Vec<_>>>()?;
            negated(Predicate::Conjunction(inner), *negate)
        }
        ProjectionFilter::Disjunction { elements, negate } => {
            let inner = elements
                .iter()
                .map(filter_predicate)
                .collect::<Result<Vec<_>>>()?;
            negated(Predicate::Disjunction(inner), *negate)
        }
        ProjectionFilter::Leaf {
            column,
            operator,
            operand,
            negate,
        } => {
            let name = Name::from_parts(column.clone())?;
            let operand = if operator == "null" {
                None
            } else {
                Some(operand.clone())
            };
            negated(Predicate::from_op(operator, name, operand)?, *negate)
        }
    };
    Ok(pred)
}

fn negated(pred: Predicate, negate: bool) -> Predicate {
    if negate {
        Predicate::Negation(Box::new(pred))
    } else {
        pred
    }
}

/// The caller's role set as a SQL array literal: sorted explicit roles,
/// then the wildcard.
fn roles_array(identity: &Identity) -> String {
    format!(
        "ARRAY[{}]",
        identity
            .roles_with_wildcard()
            .iter()
            .map(|r| sql_literal(r))
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Compile one binding into a boolean clause over the gated row, which
/// is aliased `outer_alias` in the surrounding query.
///
/// A single-element projection collapses to a direct test of the gated
/// row's own column; anything longer emits a correlated EXISTS subquery
/// whose inner elements are aliased `{outer_alias}t{pos}` and whose
/// base element is pinned to the gated row by a non-null key.
fn binding_clause(
    model: &Model,
    resource: Resource,
    binding_name: &str,
    binding: &AclBinding,
    outer_alias: &str,
    identity: &Identity,
) -> Result<String> {
    let (epath, column) = projection_path(model, binding, resource, binding_name, None)?;
    let col = model.column(column);

    let projection_type = binding.projection_type.unwrap_or(ProjectionType::NonNull);
    let test = |lname: String| match projection_type {
        ProjectionType::Acl => {
            if col.column_type.is_array() {
                format!("{} && {}", lname, roles_array(identity))
            } else {
                format!("{} = ANY({})", lname, roles_array(identity))
            }
        }
        ProjectionType::NonNull => format!("{} IS NOT NULL", lname),
    };

    let trivial_path =
        epath.elements().len() == 1 && epath.elements()[0].filters.is_empty();
    if trivial_path {
        return Ok(test(format!("{}.{}", outer_alias, col.sql_name())));
    }

    let base = epath.elements()[0].table;
    let key = model.shortest_nonnull_key(base).ok_or_else(|| {
        Error::RuntimeError(format!(
            "Table {} has no non-nullable key to pin ACL binding {}.",
            model.table_display(base),
            binding_name
        ))
    })?;
    let pin = model
        .unique(key)
        .columns
        .iter()
        .map(|c| {
            format!(
                "({}.{} = {}t0.{})",
                outer_alias,
                model.column(c).sql_name(),
                outer_alias,
                model.column(c).sql_name()
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut where_parts = vec![pin];
    if let Some(filters) = epath.sql_where(outer_alias) {
        where_parts.push(filters);
    }
    where_parts.push(test(format!(
        "{}t{}.{}",
        outer_alias,
        epath.current_position(),
        col.sql_name()
    )));

    Ok(format!(
        "EXISTS (SELECT 1 FROM {} WHERE {})",
        epath.sql_from(outer_alias),
        where_parts.join(" AND ")
    ))
}

/// Clauses of every binding on `resource` whose declared types can
/// satisfy `access_type`, each evaluated over the row alias
/// `outer_alias`.
pub fn dynacl_clauses(
    model: &Model,
    resource: Resource,
    access_type: Right,
    outer_alias: &str,
    identity: &Identity,
) -> Result<Vec<String>> {
    let dynacls = match resource {
        Resource::Table(t) => &model.table(t).dynacls,
        Resource::Column(c) => &model.column(c).dynacls,
        Resource::KeyRef(kr) => &model.key_reference(kr).dynacls,
        Resource::Catalog | Resource::Schema(_) => return Ok(Vec::new()),
    };
    let sufficient = access_type.sufficient();
    let mut clauses = Vec::new();
    for (name, binding) in dynacls {
        if binding.types.iter().any(|t| sufficient.contains(t)) {
            clauses.push(binding_clause(
                model,
                resource,
                name,
                binding,
                outer_alias,
                identity,
            )?);
        }
    }
    Ok(clauses)
}

/// How a table reference is rewritten when dynamic authorization is in
/// play.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GateMode {
    /// Keep only rows the caller may access.
    Positive,
    /// Keep only rows the caller may NOT access.
    Negative,
    /// Keep only rows where the caller may NOT access this column.
    TestColumn(ColumnId),
}

/// Rewrite a reference to `table` as a gated subquery, aliased `alias`.
///
/// Binding clauses come from `source` when given (e.g. a key reference
/// being probed) and from the table itself otherwise. Inside the
/// subquery the candidate row is aliased `s`.
pub fn gated_table_sql(
    model: &Model,
    table: TableId,
    ctx: &RequestContext,
    access_type: Right,
    alias: &str,
    mode: GateMode,
    source: Option<Resource>,
) -> Result<String> {
    Ok(format!(
        "{} AS {}",
        gated_table_subquery(model, table, ctx, access_type, mode, source)?,
        models::ident::sql_identifier(alias)
    ))
}

fn gated_table_subquery(
    model: &Model,
    table: TableId,
    ctx: &RequestContext,
    access_type: Right,
    mode: GateMode,
    source: Option<Resource>,
) -> Result<String> {
    let source = source.unwrap_or(Resource::Table(table));
    let tsql = model.table_sql_name(table);

    if let GateMode::TestColumn(column) = mode {
        let clause = column_negative_clause(model, column, "s", access_type, ctx)?;
        return Ok(format!("(SELECT * FROM {} s WHERE ({}))", tsql, clause));
    }

    let clauses = dynacl_clauses(model, source, access_type, "s", &ctx.identity)?;
    match mode {
        GateMode::Positive => {
            let selection = positive_selection(model, table, ctx, access_type)?;
            let gate = match clauses.len() {
                0 => "False".to_string(),
                1 => clauses.into_iter().next().unwrap(),
                _ => clauses
                    .iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            };
            Ok(format!(
                "(SELECT {} FROM {} s WHERE ({}))",
                selection, tsql, gate
            ))
        }
        GateMode::Negative => {
            let gate = if clauses.is_empty() {
                "True".to_string()
            } else {
                clauses
                    .iter()
                    .map(|c| format!("COALESCE(NOT ({}), True)", c))
                    .collect::<Vec<_>>()
                    .join(" AND ")
            };
            Ok(format!("(SELECT * FROM {} s WHERE ({}))", tsql, gate))
        }
        GateMode::TestColumn(_) => unreachable!("handled above"),
    }
}

/// The SELECT list of a positive gate: `*` while no visible column
/// needs its own gating, else per-column gated expressions.
fn positive_selection(
    model: &Model,
    table: TableId,
    ctx: &RequestContext,
    access_type: Right,
) -> Result<String> {
    let columns = columns_in_order(model, table, ctx);
    let plain = columns.iter().all(|c| {
        model.column(*c).dynacls.is_empty()
            && has_right(model, Resource::Column(*c), access_type, ctx) != Some(false)
    });
    if plain {
        return Ok("*".to_string());
    }
    let exprs = columns
        .into_iter()
        .map(|c| gated_column_sql(model, c, "s", access_type, ctx))
        .collect::<Result<Vec<_>>>()?;
    Ok(exprs.join(", "))
}

/// Projection expression for one column under dynamic authorization:
/// NULL when statically denied, a CASE over the column's own binding
/// clauses when it carries bindings, and the plain column otherwise. A
/// table-level indeterminacy needs no column expression: the row gate
/// has already vetted any row this projection sees.
pub fn gated_column_sql(
    model: &Model,
    column: ColumnId,
    talias: &str,
    access_type: Right,
    ctx: &RequestContext,
) -> Result<String> {
    let col = model.column(column);
    match has_right(model, Resource::Column(column), access_type, ctx) {
        Some(true) => Ok(format!("{}.{}", talias, col.sql_name())),
        Some(false) => Ok(format!("NULL AS {}", col.sql_name())),
        None if col.dynacls.is_empty() => Ok(format!("{}.{}", talias, col.sql_name())),
        None => {
            let gate = or_clauses(dynacl_clauses(
                model,
                Resource::Column(column),
                access_type,
                talias,
                &ctx.identity,
            )?);
            match gate {
                None => Ok(format!("NULL AS {}", col.sql_name())),
                Some(gate) => Ok(format!(
                    "CASE WHEN ({}) THEN {}.{} ELSE NULL END AS {}",
                    gate,
                    talias,
                    col.sql_name(),
                    col.sql_name()
                )),
            }
        }
    }
}

fn column_negative_clause(
    model: &Model,
    column: ColumnId,
    talias: &str,
    access_type: Right,
    ctx: &RequestContext,
) -> Result<String> {
    match has_right(model, Resource::Column(column), access_type, ctx) {
        Some(true) => Ok("False".to_string()),
        Some(false) => Ok("True".to_string()),
        None => {
            // An indeterminate column defends with its own bindings, or
            // with its table's when the indeterminacy was inherited.
            let col = model.column(column);
            let resource = if col.dynacls.is_empty() {
                Resource::Table(col.table)
            } else {
                Resource::Column(column)
            };
            let gate = or_clauses(dynacl_clauses(
                model,
                resource,
                access_type,
                talias,
                &ctx.identity,
            )?);
            match gate {
                None => Ok("True".to_string()),
                Some(gate) => Ok(format!("COALESCE(NOT ({}), True)", gate)),
            }
        }
    }
}

fn or_clauses(clauses: Vec<String>) -> Option<String> {
    match clauses.len() {
        0 => None,
        1 => clauses.into_iter().next(),
        _ => Some(
            clauses
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" OR "),
        ),
    }
}

/// Emit the FROM clause of `epath` with authorization applied: each
/// element's table must not be statically denied `access_type`, and
/// indeterminate tables are replaced by positive gated subqueries.
pub fn entity_path_from_sql(
    epath: &EntityPath<'_>,
    ctx: &RequestContext,
    access_type: Right,
    prefix: &str,
) -> Result<String> {
    let model = epath.model();
    let mut exprs = Vec::with_capacity(epath.elements().len());
    for elem in epath.elements() {
        enforce_right(model, Resource::Table(elem.table), access_type, ctx)?;
        let expr = match has_right(model, Resource::Table(elem.table), access_type, ctx) {
            None => gated_table_subquery(model, elem.table, ctx, access_type, GateMode::Positive, None)?,
            _ => model.table_sql_name(elem.table),
        };
        exprs.push(expr);
    }
    Ok(epath.sql_from_exprs(prefix, &exprs))
}

/// Full SELECT fragment for the path's current entity: authorized FROM
/// clause, conjoined filters, and the current element's row projected.
pub fn entity_select_sql(
    epath: &EntityPath<'_>,
    ctx: &RequestContext,
    access_type: Right,
    prefix: &str,
) -> Result<String> {
    let from = entity_path_from_sql(epath, ctx, access_type, prefix)?;
    let mut sql = format!(
        "SELECT {}t{}.* FROM {}",
        prefix,
        epath.current_position(),
        from
    );
    if let Some(filters) = epath.sql_where(prefix) {
        sql.push_str(" WHERE ");
        sql.push_str(&filters);
    }
    Ok(sql)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::predicate::tests_support::sample_model;
    use models::{Identity, ResourceClass};
    use serde_json::json;

    fn lookup(model: &Model, table: &str) -> TableId {
        let s = model.lookup_schema("S").unwrap();
        model.lookup_table(s, table).unwrap()
    }

    fn attach_owner_binding(model: &mut Model) -> TableId {
        let t2 = lookup(model, "T2");
        // Cut static select inheritance so the binding governs access.
        model.table_mut(t2).acls.set(Right::Select, Vec::new());
        let binding = compile_binding(
            model,
            Resource::Table(t2),
            "owner_rows",
            &json!({"types": ["select"], "projection": ["owner_id"], "projection_type": "acl"}),
            None,
        )
        .unwrap();
        model
            .table_mut(t2)
            .dynacls
            .insert("owner_rows".to_string(), binding);
        t2
    }

    #[test]
    fn compiles_trivial_projection_and_defaults_type() {
        let model = sample_model();
        let t2 = lookup(&model, "T2");

        // text column: defaults to acl.
        let binding = compile_binding(
            &model,
            Resource::Table(t2),
            "b",
            &json!({"types": ["select"], "projection": "owner_id"}),
            None,
        )
        .unwrap();
        assert_eq!(binding.projection_type, Some(ProjectionType::Acl));

        // non-text column: defaults to nonnull, and acl is rejected.
        let binding = compile_binding(
            &model,
            Resource::Table(t2),
            "b",
            &json!({"types": ["select"], "projection": "t1id"}),
            None,
        )
        .unwrap();
        assert_eq!(binding.projection_type, Some(ProjectionType::NonNull));

        match compile_binding(
            &model,
            Resource::Table(t2),
            "b",
            &json!({"types": ["select"], "projection": "t1id", "projection_type": "acl"}),
            None,
        ) {
            Err(Error::ConflictModel(msg)) => assert!(msg.contains("acl"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_projection_column_is_a_conflict() {
        let model = sample_model();
        let t2 = lookup(&model, "T2");
        match compile_binding(
            &model,
            Resource::Table(t2),
            "b",
            &json!({"types": ["select"], "projection": "no_such_column"}),
            None,
        ) {
            Err(Error::ConflictModel(msg)) => assert!(msg.contains("no_such_column"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn joined_projection_resolves_constraint_names() {
        let model = sample_model();
        let t1 = lookup(&model, "T1");

        // Inbound from T1 through T2's fkey, then project T2.owner_id.
        let binding = compile_binding(
            &model,
            Resource::Table(t1),
            "via_children",
            &json!({
                "types": ["select"],
                "projection": [{"inbound": ["S", "T2_t1id_fkey"]}, "owner_id"],
            }),
            None,
        )
        .unwrap();
        assert_eq!(binding.steps.len(), 1);

        match compile_binding(
            &model,
            Resource::Table(t1),
            "nope",
            &json!({
                "types": ["select"],
                "projection": [{"inbound": ["S", "no_such_fkey"]}, "owner_id"],
            }),
            None,
        ) {
            Err(Error::ConflictModel(msg)) => assert!(msg.contains("no_such_fkey"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn select_gate_wraps_table_scenario() {
        let mut model = sample_model();
        let t2 = attach_owner_binding(&mut model);
        let ctx = RequestContext::new(Identity::new(["x"]));

        assert_eq!(
            has_right(&model, Resource::Table(t2), Right::Select, &ctx),
            None
        );

        let epath = EntityPath::new(&model, t2, None);
        let sql = entity_path_from_sql(&epath, &ctx, Right::Select, "").unwrap();
        assert_eq!(
            sql,
            "(SELECT * FROM \"S\".\"T2\" s WHERE (s.\"owner_id\" = ANY(ARRAY['x','*']))) AS t0"
        );
    }

    #[test]
    fn array_valued_acl_projection_uses_overlap() {
        let mut model = sample_model();
        let t1 = lookup(&model, "T1");
        let binding = compile_binding(
            &model,
            Resource::Table(t1),
            "tag_grants",
            &json!({"types": ["select"], "projection": "tags", "projection_type": "acl"}),
            None,
        )
        .unwrap();
        model
            .table_mut(t1)
            .dynacls
            .insert("tag_grants".to_string(), binding);

        let identity = Identity::new(["x"]);
        let clauses =
            dynacl_clauses(&model, Resource::Table(t1), Right::Select, "s", &identity).unwrap();
        assert_eq!(clauses, vec!["s.\"tags\" && ARRAY['x','*']".to_string()]);
    }

    #[test]
    fn joined_binding_emits_correlated_exists() {
        let mut model = sample_model();
        let t1 = lookup(&model, "T1");
        let binding = compile_binding(
            &model,
            Resource::Table(t1),
            "via_children",
            &json!({
                "types": ["select"],
                "projection": [{"inbound": ["S", "T2_t1id_fkey"]}, "owner_id"],
            }),
            None,
        )
        .unwrap();
        model
            .table_mut(t1)
            .dynacls
            .insert("via_children".to_string(), binding);

        let identity = Identity::new(["x"]);
        let clauses =
            dynacl_clauses(&model, Resource::Table(t1), Right::Select, "s", &identity).unwrap();
        assert_eq!(
            clauses,
            vec![
                "EXISTS (SELECT 1 FROM \"S\".\"T1\" AS st0 JOIN \"S\".\"T2\" AS st1 \
                 ON (st0.\"id\" = st1.\"t1id\") WHERE (s.\"id\" = st0.\"id\") \
                 AND st1.\"owner_id\" = ANY(ARRAY['x','*']))"
                    .to_string()
            ]
        );
    }

    #[test]
    fn bindings_or_together_and_filter_by_type() {
        let mut model = sample_model();
        let t2 = attach_owner_binding(&mut model);
        let nonnull = compile_binding(
            &model,
            Resource::Table(t2),
            "has_parent",
            &json!({"types": ["update"], "projection": "t1id"}),
            None,
        )
        .unwrap();
        model
            .table_mut(t2)
            .dynacls
            .insert("has_parent".to_string(), nonnull);

        let identity = Identity::new(["x"]);
        // select: the update binding also applies, since holding update
        // implies select.
        let clauses =
            dynacl_clauses(&model, Resource::Table(t2), Right::Select, "s", &identity).unwrap();
        assert_eq!(
            clauses,
            vec![
                "s.\"t1id\" IS NOT NULL".to_string(),
                "s.\"owner_id\" = ANY(ARRAY['x','*'])".to_string(),
            ]
        );

        // update: the select binding cannot satisfy it.
        let clauses =
            dynacl_clauses(&model, Resource::Table(t2), Right::Update, "s", &identity).unwrap();
        assert_eq!(clauses, vec!["s.\"t1id\" IS NOT NULL".to_string()]);

        let ctx = RequestContext::new(Identity::new(["x"]));
        let sql = gated_table_sql(
            &model,
            t2,
            &ctx,
            Right::Select,
            "t0",
            GateMode::Positive,
            None,
        )
        .unwrap();
        assert_eq!(
            sql,
            "(SELECT * FROM \"S\".\"T2\" s WHERE ((s.\"t1id\" IS NOT NULL) OR \
             (s.\"owner_id\" = ANY(ARRAY['x','*'])))) AS \"t0\""
        );
    }

    #[test]
    fn negative_gate_coalesces() {
        let mut model = sample_model();
        let t2 = attach_owner_binding(&mut model);
        let ctx = RequestContext::new(Identity::new(["x"]));
        let sql = gated_table_sql(
            &model,
            t2,
            &ctx,
            Right::Select,
            "t0",
            GateMode::Negative,
            None,
        )
        .unwrap();
        assert_eq!(
            sql,
            "(SELECT * FROM \"S\".\"T2\" s WHERE (COALESCE(NOT (s.\"owner_id\" = ANY(ARRAY['x','*'])), True))) AS \"t0\""
        );
    }

    #[test]
    fn column_with_own_binding_projects_through_case() {
        let mut model = sample_model();
        let t2 = lookup(&model, "T2");
        let owner_id = model.lookup_column(t2, "owner_id").unwrap();
        // Shadow the catalog-wide select grant so the binding governs.
        model
            .column_mut(owner_id)
            .acls
            .set(Right::Select, Vec::new());
        let binding = compile_binding(
            &model,
            Resource::Column(owner_id),
            "self_read",
            &json!({"types": ["select"], "projection": "owner_id", "projection_type": "acl"}),
            None,
        )
        .unwrap();
        model
            .column_mut(owner_id)
            .dynacls
            .insert("self_read".to_string(), binding);
        let ctx = RequestContext::new(Identity::new(["x"]));

        assert_eq!(
            has_right(&model, Resource::Column(owner_id), Right::Select, &ctx),
            None
        );
        let sql = gated_column_sql(&model, owner_id, "s", Right::Select, &ctx).unwrap();
        assert_eq!(
            sql,
            "CASE WHEN (s.\"owner_id\" = ANY(ARRAY['x','*'])) THEN s.\"owner_id\" ELSE NULL END AS \"owner_id\""
        );

        // The positive table gate now projects an explicit column list.
        let gated = gated_table_sql(
            &model,
            t2,
            &ctx,
            Right::Select,
            "t0",
            GateMode::Positive,
            None,
        )
        .unwrap();
        assert!(gated.starts_with("(SELECT s.\"id\", s.\"t1id\", CASE WHEN "), "{}", gated);

        // And a negative column probe coalesces over the same clause.
        let probe = gated_table_sql(
            &model,
            t2,
            &ctx,
            Right::Select,
            "t0",
            GateMode::TestColumn(owner_id),
            None,
        )
        .unwrap();
        assert_eq!(
            probe,
            "(SELECT * FROM \"S\".\"T2\" s WHERE (COALESCE(NOT (s.\"owner_id\" = ANY(ARRAY['x','*'])), True))) AS \"t0\""
        );
    }

    #[test]
    fn statically_denied_table_is_forbidden_in_paths() {
        let mut model = sample_model();
        // Shadow the catalog-wide select grant on T1 only.
        let t1 = lookup(&model, "T1");
        model.table_mut(t1).acls.set(Right::Select, Vec::new());

        let ctx = RequestContext::new(Identity::new(["x"]));
        let epath = EntityPath::new(&model, t1, None);
        match entity_path_from_sql(&epath, &ctx, Right::Select, "") {
            Err(Error::Forbidden(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn filtered_projection_joins_filters_into_exists() {
        let mut model = sample_model();
        let t2 = lookup(&model, "T2");
        let binding = compile_binding(
            &model,
            Resource::Table(t2),
            "live_owner",
            &json!({
                "types": ["select"],
                "projection": [
                    {"filter": "t1id", "operator": "null", "negate": true},
                    "owner_id",
                ],
            }),
            None,
        )
        .unwrap();
        model
            .table_mut(t2)
            .dynacls
            .insert("live_owner".to_string(), binding);

        let identity = Identity::new(["x"]);
        let clauses =
            dynacl_clauses(&model, Resource::Table(t2), Right::Select, "s", &identity).unwrap();
        assert_eq!(
            clauses,
            vec![
                "EXISTS (SELECT 1 FROM \"S\".\"T2\" AS st0 WHERE (s.\"id\" = st0.\"id\") \
                 AND (NOT (st0.\"t1id\" IS NULL)) \
                 AND st0.\"owner_id\" = ANY(ARRAY['x','*']))"
                    .to_string()
            ]
        );
    }

    #[test]
    fn entity_select_projects_current_entity() {
        let model = sample_model();
        let t1 = lookup(&model, "T1");
        let t2 = lookup(&model, "T2");
        let keyref = *model
            .table(t2)
            .fkeys
            .values()
            .next()
            .map(|fk| model.fkey(*fk).references.values().next().unwrap())
            .unwrap();
        let ctx = RequestContext::new(Identity::new(["x"]));

        let mut epath = EntityPath::new(&model, t1, None);
        epath.add_link(keyref, crate::RefOp::Inbound, None).unwrap();
        epath
            .add_filter(
                Predicate::unary(Name::bare("t1id"), crate::UnaryOp::Null),
                Some(&ctx),
            )
            .unwrap();

        assert_eq!(
            entity_select_sql(&epath, &ctx, Right::Select, "").unwrap(),
            "SELECT t1.* FROM \"S\".\"T1\" AS t0 JOIN \"S\".\"T2\" AS t1 \
             ON (t0.\"id\" = t1.\"t1id\") WHERE (t1.\"t1id\" IS NULL)"
        );
    }

    #[test]
    fn binding_types_validated_against_resource_class() {
        let model = sample_model();
        let t2 = lookup(&model, "T2");
        // "insert" is not a supported binding type for tables.
        match compile_binding(
            &model,
            Resource::Table(t2),
            "b",
            &json!({"types": ["insert"], "projection": "owner_id"}),
            None,
        ) {
            Err(Error::BadData(msg)) => assert!(msg.contains("not supported"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ResourceClass::Table.dynacl_types_supported(),
            &[Right::Owner, Right::Update, Right::Delete, Right::Select]
        );
    }
}
