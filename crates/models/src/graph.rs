//! The in-memory catalog model: a flat arena of schemas, tables,
//! columns, keys, and foreign-key references linked by integer handles.
//!
//! Tables reference themselves through foreign keys and every record
//! carries a back-reference to its container, so the graph is cyclic.
//! Handles keep the arena free of ownership cycles and make snapshot
//! replacement atomic: a request pins one `Model` value and never
//! observes another request's mutations.

use crate::acl::Acls;
use crate::binding::AclBinding;
use crate::error::{Error, Result};
use crate::ident::{display_quote, enforce_63byte_id, sql_identifier};
use crate::types::{Type, TypeRegistry};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

handle_type!(
    /// Handle of a [`Schema`] in its model arena.
    SchemaId
);
handle_type!(
    /// Handle of a [`Table`] in its model arena.
    TableId
);
handle_type!(
    /// Handle of a [`Column`] in its model arena.
    ColumnId
);
handle_type!(
    /// Handle of a [`Unique`] key in its model arena.
    UniqueId
);
handle_type!(
    /// Handle of a [`ForeignKey`] in its model arena.
    ForeignKeyId
);
handle_type!(
    /// Handle of a [`KeyReference`] in its model arena.
    KeyRefId
);

/// An order-independent set of columns identifying a key or foreign key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColSet(Vec<ColumnId>);

impl ColSet {
    pub fn new(mut cols: Vec<ColumnId>) -> ColSet {
        cols.sort();
        cols.dedup();
        ColSet(cols)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, col: ColumnId) -> bool {
        self.0.binary_search(&col).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.0.iter().copied()
    }
}

/// An ordered bijection from foreign-key columns to referenced key
/// columns.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefMap(Vec<(ColumnId, ColumnId)>);

impl RefMap {
    /// Pair up foreign-key and referenced columns. The pairing must be
    /// a bijection over sets of equal cardinality.
    pub fn from_pairs(fk_cols: &[ColumnId], pk_cols: &[ColumnId]) -> Result<RefMap> {
        if fk_cols.len() != pk_cols.len() {
            return Err(Error::ConflictModel(
                "Foreign-key and referenced column lists differ in length.".to_string(),
            ));
        }
        let mut pairs: Vec<_> = fk_cols.iter().copied().zip(pk_cols.iter().copied()).collect();
        pairs.sort();
        let distinct_fk = pairs.iter().map(|(f, _)| f).collect::<BTreeSet<_>>().len();
        let distinct_pk = pairs.iter().map(|(_, p)| p).collect::<BTreeSet<_>>().len();
        if distinct_fk != pairs.len() || distinct_pk != pairs.len() {
            return Err(Error::ConflictModel(
                "Foreign-key reference map is not a bijection.".to_string(),
            ));
        }
        Ok(RefMap(pairs))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (ColumnId, ColumnId)> + '_ {
        self.0.iter().copied()
    }

    pub fn fk_colset(&self) -> ColSet {
        ColSet::new(self.0.iter().map(|(f, _)| *f).collect())
    }

    pub fn pk_colset(&self) -> ColSet {
        ColSet::new(self.0.iter().map(|(_, p)| *p).collect())
    }

    pub fn get(&self, fk_col: ColumnId) -> Option<ColumnId> {
        self.0
            .iter()
            .find(|(f, _)| *f == fk_col)
            .map(|(_, p)| *p)
    }
}

/// Constraint name as a (schema, name) pair. Pseudo constraints are not
/// database-enforced and use an empty schema part.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConstraintName {
    pub schema: String,
    pub name: String,
}

impl ConstraintName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> ConstraintName {
        ConstraintName {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn pseudo(name: impl Into<String>) -> ConstraintName {
        ConstraintName {
            schema: String::new(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ConstraintName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", display_quote(&self.schema), display_quote(&self.name))
    }
}

/// What the database says a table is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableKind {
    Relation,
    View,
    Foreign,
}

impl TableKind {
    pub fn parse(s: &str) -> Result<TableKind> {
        match s {
            "r" | "table" => Ok(TableKind::Relation),
            "v" | "view" => Ok(TableKind::View),
            "f" | "foreign_table" => Ok(TableKind::Foreign),
            other => Err(Error::ConflictData(format!(
                "Table kind \"{}\" not supported.",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TableKind::Relation => "table",
            TableKind::View => "view",
            TableKind::Foreign => "foreign_table",
        }
    }

    pub fn sql_keyword(self) -> &'static str {
        match self {
            TableKind::Relation => "TABLE",
            TableKind::View => "VIEW",
            TableKind::Foreign => "FOREIGN TABLE",
        }
    }
}

/// Action declared for a referential-integrity event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ReferenceRule {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferenceRule {
    pub fn parse(s: &str) -> ReferenceRule {
        match s {
            "RESTRICT" => ReferenceRule::Restrict,
            "CASCADE" => ReferenceRule::Cascade,
            "SET NULL" => ReferenceRule::SetNull,
            "SET DEFAULT" => ReferenceRule::SetDefault,
            _ => ReferenceRule::NoAction,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceRule::NoAction => "NO ACTION",
            ReferenceRule::Restrict => "RESTRICT",
            ReferenceRule::Cascade => "CASCADE",
            ReferenceRule::SetNull => "SET NULL",
            ReferenceRule::SetDefault => "SET DEFAULT",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Schema {
    pub name: String,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
    pub tables: BTreeMap<String, TableId>,
}

#[derive(Clone, Debug)]
pub struct Table {
    pub schema: SchemaId,
    pub name: String,
    pub kind: TableKind,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
    pub dynacls: BTreeMap<String, AclBinding>,
    /// Columns in ordinal position order.
    pub columns: Vec<ColumnId>,
    pub columns_by_name: BTreeMap<String, ColumnId>,
    pub uniques: BTreeMap<ColSet, UniqueId>,
    pub fkeys: BTreeMap<ColSet, ForeignKeyId>,
}

impl Table {
    /// True when the table can be targeted by SQL data mutation.
    pub fn writable_kind(&self) -> bool {
        self.kind == TableKind::Relation
    }
}

#[derive(Clone, Debug)]
pub struct Column {
    pub table: TableId,
    pub name: String,
    pub position: u32,
    pub column_type: Arc<Type>,
    pub nullok: bool,
    pub default: Option<Value>,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
    pub dynacls: BTreeMap<String, AclBinding>,
}

impl Column {
    pub fn sql_name(&self) -> String {
        sql_identifier(&self.name)
    }
}

#[derive(Clone, Debug)]
pub struct Unique {
    pub table: TableId,
    pub columns: ColSet,
    pub name: ConstraintName,
    pub pseudo: bool,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    /// Referring table to the key references arriving from it.
    pub table_references: BTreeMap<TableId, BTreeSet<KeyRefId>>,
}

#[derive(Clone, Debug)]
pub struct ForeignKey {
    pub table: TableId,
    pub columns: ColSet,
    /// Reference constraints sharing this column set, by reference map.
    pub references: BTreeMap<RefMap, KeyRefId>,
    /// Referenced table to the key references leading to it.
    pub table_references: BTreeMap<TableId, BTreeSet<KeyRefId>>,
}

#[derive(Clone, Debug)]
pub struct KeyReference {
    pub fkey: ForeignKeyId,
    pub unique: UniqueId,
    pub ref_map: RefMap,
    pub on_delete: ReferenceRule,
    pub on_update: ReferenceRule,
    pub name: ConstraintName,
    pub pseudo: bool,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
    pub dynacls: BTreeMap<String, AclBinding>,
}

/// Definition of a column being added to a table.
#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: Arc<Type>,
    pub nullok: bool,
    pub default: Option<Value>,
    pub comment: Option<String>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
}

/// The root of the catalog model.
#[derive(Clone, Debug)]
pub struct Model {
    /// Monotonic snapshot version; advanced by committed mutations.
    pub version: DateTime<Utc>,
    pub annotations: BTreeMap<String, Value>,
    pub acls: Acls,
    pub types: TypeRegistry,
    schemas: Vec<Schema>,
    tables: Vec<Table>,
    columns: Vec<Column>,
    uniques: Vec<Unique>,
    fkeys: Vec<ForeignKey>,
    references: Vec<KeyReference>,
    schemas_by_name: BTreeMap<String, SchemaId>,
    /// Schemas removed from name lookup, kept in the arena so their
    /// constraints remain resolvable.
    hidden_schemas: BTreeMap<String, SchemaId>,
}

impl Model {
    pub fn new(version: DateTime<Utc>, annotations: BTreeMap<String, Value>, acls: Acls) -> Model {
        Model {
            version,
            annotations,
            acls,
            types: TypeRegistry::default(),
            schemas: Vec::new(),
            tables: Vec::new(),
            columns: Vec::new(),
            uniques: Vec::new(),
            fkeys: Vec::new(),
            references: Vec::new(),
            schemas_by_name: BTreeMap::new(),
            hidden_schemas: BTreeMap::new(),
        }
    }

    // Infallible arena accessors. Handles are only minted by this model,
    // so indexing is in-bounds by construction.

    pub fn schema(&self, id: SchemaId) -> &Schema {
        &self.schemas[id.index()]
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.index()]
    }

    pub fn column(&self, id: ColumnId) -> &Column {
        &self.columns[id.index()]
    }

    pub fn unique(&self, id: UniqueId) -> &Unique {
        &self.uniques[id.index()]
    }

    pub fn fkey(&self, id: ForeignKeyId) -> &ForeignKey {
        &self.fkeys[id.index()]
    }

    pub fn key_reference(&self, id: KeyRefId) -> &KeyReference {
        &self.references[id.index()]
    }

    pub fn schema_mut(&mut self, id: SchemaId) -> &mut Schema {
        &mut self.schemas[id.index()]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.index()]
    }

    pub fn column_mut(&mut self, id: ColumnId) -> &mut Column {
        &mut self.columns[id.index()]
    }

    pub fn key_reference_mut(&mut self, id: KeyRefId) -> &mut KeyReference {
        &mut self.references[id.index()]
    }

    pub fn schemas(&self) -> impl Iterator<Item = (SchemaId, &Schema)> {
        self.schemas_by_name.values().map(|id| (*id, self.schema(*id)))
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.schemas()
            .flat_map(|(_, s)| s.tables.values())
            .map(|id| (*id, self.table(*id)))
    }

    // Named lookups with alt-map semantics: a missing key is a model
    // conflict the boundary reports as 409, not a generic error.

    pub fn lookup_schema(&self, name: &str) -> Result<SchemaId> {
        self.schemas_by_name.get(name).copied().ok_or_else(|| {
            Error::ConflictModel(format!("Requested schema {} does not exist.", name))
        })
    }

    pub fn lookup_table(&self, schema: SchemaId, name: &str) -> Result<TableId> {
        self.schema(schema).tables.get(name).copied().ok_or_else(|| {
            Error::ConflictModel(format!(
                "Requested table {} does not exist in schema {}.",
                name,
                self.schema(schema).name
            ))
        })
    }

    pub fn lookup_column(&self, table: TableId, name: &str) -> Result<ColumnId> {
        self.table(table)
            .columns_by_name
            .get(name)
            .copied()
            .ok_or_else(|| {
                Error::ConflictModel(format!(
                    "Requested column {} does not exist in table {}.",
                    name,
                    self.table(table).name
                ))
            })
    }

    pub fn lookup_unique(&self, table: TableId, colset: &ColSet) -> Result<UniqueId> {
        self.table(table).uniques.get(colset).copied().ok_or_else(|| {
            Error::ConflictModel(format!(
                "Requested key ({}) does not exist in table {}.",
                self.colset_names(colset),
                self.table(table).name
            ))
        })
    }

    pub fn lookup_fkey(&self, table: TableId, colset: &ColSet) -> Result<ForeignKeyId> {
        self.table(table).fkeys.get(colset).copied().ok_or_else(|| {
            Error::ConflictModel(format!(
                "Requested foreign-key ({}) does not exist in table {}.",
                self.colset_names(colset),
                self.table(table).name
            ))
        })
    }

    pub fn colset_names(&self, colset: &ColSet) -> String {
        colset.iter().map(|c| self.column(c).name.as_str()).join(",")
    }

    /// Human-readable resource name, e.g. `:schema:table:column`.
    pub fn column_display(&self, id: ColumnId) -> String {
        let col = self.column(id);
        format!("{}:{}", self.table_display(col.table), display_quote(&col.name))
    }

    pub fn table_display(&self, id: TableId) -> String {
        let table = self.table(id);
        format!(
            ":{}:{}",
            display_quote(&self.schema(table.schema).name),
            display_quote(&table.name)
        )
    }

    /// Schema-qualified SQL name of a table.
    pub fn table_sql_name(&self, id: TableId) -> String {
        let table = self.table(id);
        format!(
            "{}.{}",
            sql_identifier(&self.schema(table.schema).name),
            sql_identifier(&table.name)
        )
    }

    // Construction. The introspector and DDL layer build models through
    // these; they enforce identifier limits and name/constraint
    // uniqueness as they go.

    pub fn add_schema(
        &mut self,
        name: &str,
        comment: Option<String>,
        annotations: BTreeMap<String, Value>,
        acls: Acls,
    ) -> Result<SchemaId> {
        enforce_63byte_id(name, "Schema")?;
        if self.schemas_by_name.contains_key(name) {
            return Err(Error::ConflictModel(format!(
                "Schema {} already exists.",
                name
            )));
        }
        let id = SchemaId(self.schemas.len() as u32);
        self.schemas.push(Schema {
            name: name.to_string(),
            comment,
            annotations,
            acls,
            tables: BTreeMap::new(),
        });
        self.schemas_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn add_table(
        &mut self,
        schema: SchemaId,
        name: &str,
        kind: TableKind,
        comment: Option<String>,
        annotations: BTreeMap<String, Value>,
        acls: Acls,
    ) -> Result<TableId> {
        enforce_63byte_id(name, "Table")?;
        if self.schema(schema).tables.contains_key(name) {
            return Err(Error::ConflictModel(format!(
                "Table {} already exists in schema {}.",
                name,
                self.schema(schema).name
            )));
        }
        let id = TableId(self.tables.len() as u32);
        self.tables.push(Table {
            schema,
            name: name.to_string(),
            kind,
            comment,
            annotations,
            acls,
            dynacls: BTreeMap::new(),
            columns: Vec::new(),
            columns_by_name: BTreeMap::new(),
            uniques: BTreeMap::new(),
            fkeys: BTreeMap::new(),
        });
        self.schema_mut(schema).tables.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn add_column(&mut self, table: TableId, def: ColumnDef) -> Result<ColumnId> {
        enforce_63byte_id(&def.name, "Column")?;
        if self.table(table).columns_by_name.contains_key(&def.name) {
            return Err(Error::ConflictModel(format!(
                "Column {} already exists in table {}.",
                def.name,
                self.table(table).name
            )));
        }
        let position = self.table(table).columns.len() as u32;
        let id = ColumnId(self.columns.len() as u32);
        self.columns.push(Column {
            table,
            name: def.name.clone(),
            position,
            column_type: def.column_type,
            nullok: def.nullok,
            default: def.default,
            comment: def.comment,
            annotations: def.annotations,
            acls: def.acls,
            dynacls: BTreeMap::new(),
        });
        let t = self.table_mut(table);
        t.columns.push(id);
        t.columns_by_name.insert(def.name, id);
        Ok(id)
    }

    /// Register a unique constraint. Two distinct constraints over the
    /// same column set are a model conflict naming both.
    pub fn add_unique(
        &mut self,
        cols: Vec<ColumnId>,
        name: ConstraintName,
        pseudo: bool,
        comment: Option<String>,
        annotations: BTreeMap<String, Value>,
    ) -> Result<UniqueId> {
        let table = self.columns_table(&cols)?;
        let colset = ColSet::new(cols);
        if let Some(existing) = self.table(table).uniques.get(&colset) {
            return Err(Error::ConflictModel(format!(
                "Duplicate constraint {} collides with {}.",
                name,
                self.unique(*existing).name
            )));
        }
        let id = UniqueId(self.uniques.len() as u32);
        self.uniques.push(Unique {
            table,
            columns: colset.clone(),
            name,
            pseudo,
            comment,
            annotations,
            table_references: BTreeMap::new(),
        });
        self.table_mut(table).uniques.insert(colset, id);
        Ok(id)
    }

    /// Register a foreign-key reference constraint, creating the
    /// covering [`ForeignKey`] on first use of its column set. The
    /// referenced key must already exist. Two constraints with the same
    /// reference map are a model conflict naming both.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fkey_reference(
        &mut self,
        fk_cols: Vec<ColumnId>,
        pk_cols: Vec<ColumnId>,
        name: ConstraintName,
        pseudo: bool,
        on_delete: ReferenceRule,
        on_update: ReferenceRule,
        comment: Option<String>,
        annotations: BTreeMap<String, Value>,
        acls: Acls,
    ) -> Result<KeyRefId> {
        let fk_table = self.columns_table(&fk_cols)?;
        let pk_table = self.columns_table(&pk_cols)?;
        let ref_map = RefMap::from_pairs(&fk_cols, &pk_cols)?;

        let pk_colset = ColSet::new(pk_cols);
        let unique = self.lookup_unique(pk_table, &pk_colset)?;

        let fk_colset = ColSet::new(fk_cols);
        let fkey = match self.table(fk_table).fkeys.get(&fk_colset) {
            Some(id) => *id,
            None => {
                let id = ForeignKeyId(self.fkeys.len() as u32);
                self.fkeys.push(ForeignKey {
                    table: fk_table,
                    columns: fk_colset.clone(),
                    references: BTreeMap::new(),
                    table_references: BTreeMap::new(),
                });
                self.table_mut(fk_table).fkeys.insert(fk_colset, id);
                id
            }
        };

        if let Some(existing) = self.fkey(fkey).references.get(&ref_map) {
            return Err(Error::ConflictModel(format!(
                "Duplicate constraint {} collides with {}.",
                name,
                self.key_reference(*existing).name
            )));
        }

        let id = KeyRefId(self.references.len() as u32);
        self.references.push(KeyReference {
            fkey,
            unique,
            ref_map: ref_map.clone(),
            on_delete,
            on_update,
            name,
            pseudo,
            comment,
            annotations,
            acls,
            dynacls: BTreeMap::new(),
        });
        self.fkeys[fkey.index()].references.insert(ref_map, id);
        self.fkeys[fkey.index()]
            .table_references
            .entry(pk_table)
            .or_default()
            .insert(id);
        self.uniques[unique.index()]
            .table_references
            .entry(fk_table)
            .or_default()
            .insert(id);
        Ok(id)
    }

    fn columns_table(&self, cols: &[ColumnId]) -> Result<TableId> {
        let tables: BTreeSet<TableId> = cols.iter().map(|c| self.column(*c).table).collect();
        match tables.into_iter().exactly_one() {
            Ok(table) => Ok(table),
            Err(_) => Err(Error::ConflictModel(
                "Constraint columns must belong to exactly one table.".to_string(),
            )),
        }
    }

    /// Is any unique of `table` a primary key, i.e. free of nullable
    /// members?
    pub fn has_primary_key(&self, table: TableId) -> bool {
        self.table(table)
            .uniques
            .values()
            .any(|u| self.is_primary_key(*u))
    }

    pub fn is_primary_key(&self, unique: UniqueId) -> bool {
        self.unique(unique)
            .columns
            .iter()
            .all(|c| !self.column(c).nullok)
    }

    /// A non-null key of `table` suitable for pinning rows, preferring
    /// the smallest.
    pub fn shortest_nonnull_key(&self, table: TableId) -> Option<UniqueId> {
        self.table(table)
            .uniques
            .values()
            .copied()
            .filter(|u| self.is_primary_key(*u))
            .min_by_key(|u| self.unique(*u).columns.len())
    }

    /// Verify that every visible relation has a primary key.
    pub fn check_primary_keys(&self, require: bool) -> Result<()> {
        for (id, table) in self.tables() {
            if table.kind == TableKind::Relation && !self.has_primary_key(id) {
                if require {
                    return Err(Error::RuntimeError(format!(
                        "Table {} lacks primary key.",
                        self.table_display(id)
                    )));
                }
                tracing::warn!(table = %self.table_display(id), "table lacks primary key");
            }
        }
        Ok(())
    }

    /// Remove `name` from schema lookup while keeping its contents in
    /// the arena. Hidden schemas do not appear in enumeration.
    pub fn hide_schema(&mut self, name: &str) {
        if let Some(id) = self.schemas_by_name.remove(name) {
            self.hidden_schemas.insert(name.to_string(), id);
        }
    }

    pub fn hidden_schema(&self, name: &str) -> Option<SchemaId> {
        self.hidden_schemas.get(name).copied()
    }

    // In-memory unlinking after DDL. Arena records stay allocated but
    // become unreachable through name and constraint maps, which is all
    // snapshot readers consult.

    pub fn unlink_table(&mut self, table: TableId) {
        let (schema, name) = {
            let t = self.table(table);
            (t.schema, t.name.clone())
        };
        self.schema_mut(schema).tables.remove(&name);
    }

    pub fn unlink_column(&mut self, column: ColumnId) {
        let (table, name) = {
            let c = self.column(column);
            (c.table, c.name.clone())
        };
        let t = self.table_mut(table);
        t.columns.retain(|c| *c != column);
        t.columns_by_name.remove(&name);
    }

    pub fn unlink_unique(&mut self, unique: UniqueId) {
        let (table, colset) = {
            let u = self.unique(unique);
            (u.table, u.columns.clone())
        };
        self.table_mut(table).uniques.remove(&colset);
    }

    pub fn unlink_fkey_reference(&mut self, keyref: KeyRefId) {
        let (fkey, unique, ref_map) = {
            let kr = self.key_reference(keyref);
            (kr.fkey, kr.unique, kr.ref_map.clone())
        };
        let (fk_table, pk_table) = (self.fkey(fkey).table, self.unique(unique).table);
        {
            let fk = &mut self.fkeys[fkey.index()];
            fk.references.remove(&ref_map);
            if let Some(set) = fk.table_references.get_mut(&pk_table) {
                set.remove(&keyref);
                if set.is_empty() {
                    fk.table_references.remove(&pk_table);
                }
            }
        }
        if let Some(set) = self.uniques[unique.index()]
            .table_references
            .get_mut(&fk_table)
        {
            set.remove(&keyref);
            if set.is_empty() {
                self.uniques[unique.index()].table_references.remove(&fk_table);
            }
        }
        // Drop the covering foreign key once its last reference is gone.
        if self.fkey(fkey).references.is_empty() {
            let colset = self.fkey(fkey).columns.clone();
            self.table_mut(fk_table).fkeys.remove(&colset);
        }
    }

    /// Keys and foreign keys of `table` covering `column`, which must be
    /// unlinked before the column itself is dropped.
    pub fn constraints_covering(&self, column: ColumnId) -> (Vec<UniqueId>, Vec<KeyRefId>) {
        let table = self.column(column).table;
        let uniques = self
            .table(table)
            .uniques
            .iter()
            .filter(|(colset, _)| colset.contains(column))
            .map(|(_, id)| *id)
            .collect();
        let keyrefs = self
            .table(table)
            .fkeys
            .iter()
            .filter(|(colset, _)| colset.contains(column))
            .flat_map(|(_, id)| self.fkey(*id).references.values().copied())
            .collect();
        (uniques, keyrefs)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::acl::Right;
    use std::collections::BTreeSet;

    /// A two-table model: S.T1(id pk, name unique, value, tags text[])
    /// and S.T2(id pk, t1id -> T1.id, owner_id).
    pub fn two_table_model() -> Model {
        let mut model = Model::new(Utc::now(), BTreeMap::new(), Acls::new());
        let mut types = TypeRegistry::new(BTreeSet::new());
        types.add_base("t-text".to_string(), "text");
        types.add_base("t-int8".to_string(), "int8");
        types
            .add_array("t-text-arr".to_string(), "text[]", "t-text")
            .unwrap();
        model.types = types;

        let text = model.types.lookup("t-text", false).unwrap();
        let int8 = model.types.lookup("t-int8", false).unwrap();
        let text_arr = model.types.lookup("t-text-arr", false).unwrap();

        let s = model
            .add_schema("S", None, BTreeMap::new(), Acls::new())
            .unwrap();
        let t1 = model
            .add_table(s, "T1", TableKind::Relation, None, BTreeMap::new(), Acls::new())
            .unwrap();
        let t1_id = model.add_column(t1, column("id", int8.clone(), false)).unwrap();
        let t1_name = model
            .add_column(t1, column("name", text.clone(), false))
            .unwrap();
        model.add_column(t1, column("value", text.clone(), true)).unwrap();
        model
            .add_column(t1, column("tags", text_arr, true))
            .unwrap();
        model
            .add_unique(
                vec![t1_id],
                ConstraintName::new("S", "T1_id_key"),
                false,
                None,
                BTreeMap::new(),
            )
            .unwrap();
        model
            .add_unique(
                vec![t1_name],
                ConstraintName::new("S", "T1_name_key"),
                false,
                None,
                BTreeMap::new(),
            )
            .unwrap();

        let t2 = model
            .add_table(s, "T2", TableKind::Relation, None, BTreeMap::new(), Acls::new())
            .unwrap();
        let t2_id = model.add_column(t2, column("id", int8.clone(), false)).unwrap();
        let t2_t1id = model
            .add_column(t2, column("t1id", int8, true))
            .unwrap();
        model
            .add_column(t2, column("owner_id", text, true))
            .unwrap();
        model
            .add_unique(
                vec![t2_id],
                ConstraintName::new("S", "T2_id_key"),
                false,
                None,
                BTreeMap::new(),
            )
            .unwrap();
        model
            .add_fkey_reference(
                vec![t2_t1id],
                vec![t1_id],
                ConstraintName::new("S", "T2_t1id_fkey"),
                false,
                ReferenceRule::NoAction,
                ReferenceRule::NoAction,
                None,
                BTreeMap::new(),
                Acls::new(),
            )
            .unwrap();
        model
    }

    pub fn column(name: &str, column_type: Arc<Type>, nullok: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            column_type,
            nullok,
            default: None,
            comment: None,
            annotations: BTreeMap::new(),
            acls: Acls::new(),
        }
    }

    pub fn allow(model: &mut Model, right: Right, roles: &[&str]) {
        model
            .acls
            .set(right, roles.iter().map(|r| r.to_string()).collect());
    }
}

#[cfg(test)]
mod test {
    use super::fixtures::two_table_model;
    use super::*;

    #[test]
    fn alt_map_lookup_errors() {
        let model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();

        match model.lookup_schema("missing") {
            Err(Error::ConflictModel(msg)) => {
                assert_eq!(msg, "Requested schema missing does not exist.")
            }
            other => panic!("unexpected {:?}", other),
        }
        match model.lookup_column(t1, "nope") {
            Err(Error::ConflictModel(msg)) => {
                assert_eq!(msg, "Requested column nope does not exist in table T1.")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_key_collision_names_both() {
        let mut model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        let id = model.lookup_column(t1, "id").unwrap();

        match model.add_unique(
            vec![id],
            ConstraintName::new("S", "T1_id_key2"),
            false,
            None,
            BTreeMap::new(),
        ) {
            Err(Error::ConflictModel(msg)) => {
                assert!(msg.contains("T1_id_key2"), "{}", msg);
                assert!(msg.contains("T1_id_key"), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_reference_map_collides() {
        let mut model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        let t2 = model.lookup_table(s, "T2").unwrap();
        let t1_id = model.lookup_column(t1, "id").unwrap();
        let t2_t1id = model.lookup_column(t2, "t1id").unwrap();

        match model.add_fkey_reference(
            vec![t2_t1id],
            vec![t1_id],
            ConstraintName::pseudo("again"),
            true,
            ReferenceRule::NoAction,
            ReferenceRule::NoAction,
            None,
            BTreeMap::new(),
            Acls::new(),
        ) {
            Err(Error::ConflictModel(msg)) => {
                assert!(msg.contains("again"), "{}", msg);
                assert!(msg.contains("T2_t1id_fkey"), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reference_map_invariants() {
        let model = two_table_model();
        for kr in model
            .tables()
            .flat_map(|(_, t)| t.fkeys.values())
            .flat_map(|fk| model.fkey(*fk).references.values())
        {
            let kr = model.key_reference(*kr);
            let fk = model.fkey(kr.fkey);
            let unique = model.unique(kr.unique);
            assert_eq!(kr.ref_map.len(), fk.columns.len());
            assert_eq!(kr.ref_map.len(), unique.columns.len());
            assert_eq!(kr.ref_map.fk_colset(), fk.columns);
            assert_eq!(kr.ref_map.pk_colset(), unique.columns);
            for (f, p) in kr.ref_map.pairs() {
                assert_eq!(model.column(f).table, fk.table);
                assert_eq!(model.column(p).table, unique.table);
            }
        }
    }

    #[test]
    fn key_colsets_are_subsets_of_their_table() {
        let model = two_table_model();
        for (id, table) in model.tables() {
            for (colset, unique) in &table.uniques {
                assert_eq!(&model.unique(*unique).columns, colset);
                for c in colset.iter() {
                    assert_eq!(model.column(c).table, id);
                }
            }
        }
    }

    #[test]
    fn primary_keys() {
        let model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        assert!(model.has_primary_key(t1));
        assert!(model.check_primary_keys(true).is_ok());

        let key = model.shortest_nonnull_key(t1).unwrap();
        assert_eq!(model.unique(key).columns.len(), 1);
    }

    #[test]
    fn missing_primary_key_is_fatal_when_required() {
        let mut model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let text = model.types.lookup("t-text", false).unwrap();
        let t3 = model
            .add_table(s, "T3", TableKind::Relation, None, BTreeMap::new(), Acls::new())
            .unwrap();
        model
            .add_column(t3, fixtures::column("v", text, true))
            .unwrap();

        match model.check_primary_keys(true) {
            Err(Error::RuntimeError(msg)) => assert!(msg.contains("T3"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
        assert!(model.check_primary_keys(false).is_ok());
    }

    #[test]
    fn column_cascade_discovery_and_unlink() {
        let mut model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        let t2 = model.lookup_table(s, "T2").unwrap();
        let t1_id = model.lookup_column(t1, "id").unwrap();

        // T1.id is covered by its key and referenced by T2's fkey.
        let (uniques, keyrefs) = model.constraints_covering(t1_id);
        assert_eq!(uniques.len(), 1);
        assert!(keyrefs.is_empty());

        let t2_t1id = model.lookup_column(t2, "t1id").unwrap();
        let (_, keyrefs) = model.constraints_covering(t2_t1id);
        assert_eq!(keyrefs.len(), 1);

        let keyref = keyrefs[0];
        model.unlink_fkey_reference(keyref);
        assert!(model.table(t2).fkeys.is_empty());
        assert!(model.unique(model.table(t1).uniques.values().next().copied().unwrap())
            .table_references
            .is_empty());

        model.unlink_column(t2_t1id);
        assert!(model.lookup_column(t2, "t1id").is_err());
        assert_eq!(model.table(t2).columns.len(), 2);
    }

    #[test]
    fn hidden_schemas_leave_lookup() {
        let mut model = two_table_model();
        model.hide_schema("S");
        assert!(model.lookup_schema("S").is_err());
        assert!(model.hidden_schema("S").is_some());
        assert_eq!(model.tables().count(), 0);
    }

    #[test]
    fn array_base_types_are_scalar() {
        let model = two_table_model();
        let s = model.lookup_schema("S").unwrap();
        let t1 = model.lookup_table(s, "T1").unwrap();
        let tags = model.lookup_column(t1, "tags").unwrap();
        let t = &model.column(tags).column_type;
        assert!(t.is_array());
        assert!(!t.base_type().is_array());
    }
}
