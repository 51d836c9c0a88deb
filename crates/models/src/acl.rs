//! The named-right lattice, ACL containers, and the static capability
//! tables describing which ACLs, reportable rights, and dynamic binding
//! types each resource class supports.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A symbolic permission name.
///
/// Rights form a lattice: holding a higher right implies holding the
/// lower rights listed by [`Right::implied_by`]'s transpose.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Right {
    Owner,
    Create,
    Write,
    Insert,
    Update,
    Delete,
    Select,
    Enumerate,
}

impl Right {
    pub const ALL: [Right; 8] = [
        Right::Owner,
        Right::Create,
        Right::Write,
        Right::Insert,
        Right::Update,
        Right::Delete,
        Right::Select,
        Right::Enumerate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Right::Owner => "owner",
            Right::Create => "create",
            Right::Write => "write",
            Right::Insert => "insert",
            Right::Update => "update",
            Right::Delete => "delete",
            Right::Select => "select",
            Right::Enumerate => "enumerate",
        }
    }

    /// Parse a right name as clients spell it.
    pub fn parse(s: &str) -> Result<Right> {
        Right::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| Error::BadData(format!("Unknown access right \"{}\".", s)))
    }

    /// The distinct rights whose holders implicitly hold `self`.
    pub fn implied_by(self) -> &'static [Right] {
        use Right::*;
        match self {
            Owner => &[],
            Create => &[Owner],
            Write => &[Owner],
            Insert => &[Owner, Write],
            Update => &[Owner, Write],
            Delete => &[Owner, Write],
            Select => &[Owner, Write, Update, Delete],
            Enumerate => &[Owner, Create, Write, Insert, Update, Delete, Select],
        }
    }

    /// `self` together with every right sufficient for it.
    pub fn sufficient(self) -> Vec<Right> {
        let mut out = vec![self];
        out.extend_from_slice(self.implied_by());
        out
    }
}

impl std::fmt::Display for Right {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static-ACL storage on one resource: right name to member role list.
///
/// A missing entry means "no local opinion" and defers to parent
/// inheritance; an empty list is an explicit empty ACL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acls(BTreeMap<Right, Vec<String>>);

impl Acls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, right: Right) -> Option<&[String]> {
        self.0.get(&right).map(Vec::as_slice)
    }

    pub fn set(&mut self, right: Right, members: Vec<String>) {
        self.0.insert(right, members);
    }

    pub fn remove(&mut self, right: Right) -> Option<Vec<String>> {
        self.0.remove(&right)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Right, &[String])> {
        self.0.iter().map(|(r, m)| (*r, m.as_slice()))
    }

    /// Parse an ACL map document, dropping entries with unknown names.
    pub fn from_json(doc: &serde_json::Value) -> Acls {
        let mut acls = Acls::new();
        if let Some(map) = doc.as_object() {
            for (name, members) in map {
                let right = match Right::parse(name) {
                    Ok(r) => r,
                    Err(_) => {
                        tracing::warn!(acl = %name, "dropping unrecognized ACL name");
                        continue;
                    }
                };
                let members = members
                    .as_array()
                    .map(|m| {
                        m.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                acls.set(right, members);
            }
        }
        acls
    }
}

/// The classes of model resource that carry metadata. Each class has a
/// fixed set of supported ACL names, reportable rights, dynamic binding
/// types, and auxiliary-storage keying columns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceClass {
    Catalog,
    Schema,
    Table,
    Column,
    ForeignKeyRef,
}

impl ResourceClass {
    /// Resource-type token used to name auxiliary storage tables.
    pub fn restype(self) -> &'static str {
        match self {
            ResourceClass::Catalog => "catalog",
            ResourceClass::Schema => "schema",
            ResourceClass::Table => "table",
            ResourceClass::Column => "column",
            ResourceClass::ForeignKeyRef => "fkeyref",
        }
    }

    /// ACL names which may be read or written on this class.
    pub fn acls_supported(self) -> &'static [Right] {
        use Right::*;
        match self {
            ResourceClass::Catalog => &[
                Owner, Create, Write, Insert, Update, Delete, Select, Enumerate,
            ],
            ResourceClass::Schema => &[
                Owner, Create, Write, Insert, Update, Delete, Select, Enumerate,
            ],
            ResourceClass::Table => &[Owner, Write, Insert, Update, Delete, Select, Enumerate],
            ResourceClass::Column => &[Write, Insert, Update, Delete, Select, Enumerate],
            ResourceClass::ForeignKeyRef => &[Owner, Write, Insert, Update, Enumerate],
        }
    }

    /// Rights whose decisions are reported in resource documents.
    pub fn rights_reported(self) -> &'static [Right] {
        use Right::*;
        match self {
            ResourceClass::Catalog => &[Owner, Create],
            ResourceClass::Schema => &[Owner, Create],
            ResourceClass::Table => &[Owner, Insert, Update, Delete, Select],
            ResourceClass::Column => &[Insert, Update, Delete, Select],
            ResourceClass::ForeignKeyRef => &[Insert, Update],
        }
    }

    /// Binding types which may appear in a dynamic ACL binding bound to
    /// this class. Empty means the class cannot carry bindings.
    pub fn dynacl_types_supported(self) -> &'static [Right] {
        use Right::*;
        match self {
            ResourceClass::Catalog | ResourceClass::Schema => &[],
            ResourceClass::Table => &[Owner, Update, Delete, Select],
            ResourceClass::Column => &[Owner, Update, Delete, Select],
            ResourceClass::ForeignKeyRef => &[Owner, Insert, Update],
        }
    }

    /// Names of the auxiliary-storage key columns for this class, in
    /// storage order. Values are supplied by the metadata store from the
    /// identifying tuple of the concrete resource.
    pub fn keying_columns(self) -> &'static [&'static str] {
        match self {
            ResourceClass::Catalog => &[],
            ResourceClass::Schema => &["schema_name"],
            ResourceClass::Table => &["schema_name", "table_name"],
            ResourceClass::Column => &["schema_name", "table_name", "column_name"],
            ResourceClass::ForeignKeyRef => &[
                "from_schema_name",
                "from_table_name",
                "constraint_schema_name",
                "constraint_name",
            ],
        }
    }

    pub fn supports_acl(self, right: Right) -> bool {
        self.acls_supported().contains(&right)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn lattice_shape() {
        assert!(Right::Owner.implied_by().is_empty());
        for right in Right::ALL {
            if right != Right::Owner {
                assert!(right.implied_by().contains(&Right::Owner));
            }
            assert!(right.sufficient().contains(&right));
        }
        assert!(Right::Insert.implied_by().contains(&Right::Write));
        assert!(!Right::Insert.implied_by().contains(&Right::Select));
        assert!(Right::Enumerate.implied_by().contains(&Right::Select));
    }

    #[test]
    fn parse_round_trip() {
        for right in Right::ALL {
            assert_eq!(Right::parse(right.as_str()).unwrap(), right);
        }
        assert!(Right::parse("admin").is_err());
    }

    #[test]
    fn acls_from_json_drops_unknown() {
        let acls = Acls::from_json(&json!({
            "select": ["grp1", "*"],
            "bogus": ["x"],
        }));
        assert_eq!(acls.get(Right::Select), Some(&["grp1".to_string(), "*".to_string()][..]));
        assert_eq!(acls.iter().count(), 1);
    }

    #[test]
    fn class_tables_are_consistent() {
        for class in [
            ResourceClass::Catalog,
            ResourceClass::Schema,
            ResourceClass::Table,
            ResourceClass::Column,
            ResourceClass::ForeignKeyRef,
        ] {
            for right in class.rights_reported() {
                assert!(
                    class.supports_acl(*right),
                    "{:?} reports unsupported {:?}",
                    class,
                    right
                );
            }
            for right in class.dynacl_types_supported() {
                assert!(Right::ALL.contains(right));
            }
        }
    }
}
