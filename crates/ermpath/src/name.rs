//! Column name resolution against an entity path.

use crate::path::EntityPath;
use models::{ColumnId, Error, Result, TableId};

/// The free-text pseudo-column, usable with text-search operators.
pub const FREETEXT: &str = "*";

/// A column name as written by a client: bare, or qualified by a path
/// alias bound earlier in the path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name {
    parts: Vec<String>,
}

impl Name {
    pub fn bare(column: impl Into<String>) -> Name {
        Name {
            parts: vec![column.into()],
        }
    }

    pub fn qualified(alias: impl Into<String>, column: impl Into<String>) -> Name {
        Name {
            parts: vec![alias.into(), column.into()],
        }
    }

    pub fn from_parts(parts: Vec<String>) -> Result<Name> {
        match parts.len() {
            1 | 2 => Ok(Name { parts }),
            _ => Err(Error::BadData(format!(
                "Invalid name with {} parts.",
                parts.len()
            ))),
        }
    }

    pub fn column_part(&self) -> &str {
        self.parts.last().expect("names have at least one part")
    }

    /// Resolve against `epath`: bare names bind to the current entity,
    /// qualified names to the aliased element.
    pub fn resolve(&self, epath: &EntityPath<'_>) -> Result<(ColumnRef, usize)> {
        let (elem_pos, column) = match self.parts.as_slice() {
            [column] => (epath.current_position(), column.as_str()),
            [alias, column] => (epath.alias_position(alias)?, column.as_str()),
            _ => unreachable!("names have one or two parts"),
        };
        let table = epath.element(elem_pos).table;
        let column = if column == FREETEXT {
            ColumnRef::Freetext(table)
        } else {
            ColumnRef::Column(epath.model().lookup_column(table, column)?)
        };
        Ok((column, elem_pos))
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.parts.join(":"))
    }
}

/// A resolved column target: a real column, or the free-text
/// pseudo-column of an entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColumnRef {
    Column(ColumnId),
    Freetext(TableId),
}
