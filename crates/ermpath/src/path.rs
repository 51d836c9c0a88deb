//! The entity path: a join-structured query rooted at a table, built
//! incrementally by URL parsing and by dynamic-ACL projection
//! compilation, and the canonical IR for SQL generation.

use crate::predicate::{Predicate, Resolved};
use models::{Error, KeyRefId, Model, RequestContext, Result, TableId};
use std::collections::BTreeMap;

/// Orientation of a joined key reference: `=@` follows a foreign key
/// outbound to the table it references, `@=` follows it inbound from
/// the referencing table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefOp {
    Outbound,
    Inbound,
}

#[derive(Clone, Debug)]
pub struct Link {
    pub keyref: KeyRefId,
    pub refop: RefOp,
    /// Position of the element this join departs from. Context rewinds
    /// make this differ from `pos - 1`.
    pub from: usize,
}

/// One table occurrence in the path. Its SQL alias is `t{pos}`, under
/// an optional prefix owned by the emitter.
#[derive(Clone, Debug)]
pub struct PathElement {
    pub pos: u32,
    pub table: TableId,
    pub alias: Option<String>,
    pub link: Option<Link>,
    pub filters: Vec<Resolved>,
}

pub struct EntityPath<'m> {
    model: &'m Model,
    elements: Vec<PathElement>,
    aliases: BTreeMap<String, usize>,
    cursor: usize,
}

impl<'m> EntityPath<'m> {
    /// Start a path at its base entity.
    pub fn new(model: &'m Model, table: TableId, alias: Option<&str>) -> EntityPath<'m> {
        let mut aliases = BTreeMap::new();
        if let Some(alias) = alias {
            aliases.insert(alias.to_string(), 0);
        }
        EntityPath {
            model,
            elements: vec![PathElement {
                pos: 0,
                table,
                alias: alias.map(str::to_string),
                link: None,
                filters: Vec::new(),
            }],
            aliases,
            cursor: 0,
        }
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn element(&self, pos: usize) -> &PathElement {
        &self.elements[pos]
    }

    pub fn current_position(&self) -> usize {
        self.cursor
    }

    pub fn current_entity_table(&self) -> TableId {
        self.elements[self.cursor].table
    }

    pub fn alias_position(&self, alias: &str) -> Result<usize> {
        self.aliases.get(alias).copied().ok_or_else(|| {
            Error::ConflictModel(format!("Alias {} is not bound in entity path.", alias))
        })
    }

    /// Append a joined element along `keyref`, which must connect to
    /// the current entity in the direction given by `refop`. The new
    /// element becomes current.
    pub fn add_link(&mut self, keyref: KeyRefId, refop: RefOp, alias: Option<&str>) -> Result<()> {
        let kr = self.model.key_reference(keyref);
        let fk_table = self.model.fkey(kr.fkey).table;
        let pk_table = self.model.unique(kr.unique).table;
        let here = self.current_entity_table();

        let target = match refop {
            RefOp::Outbound if fk_table == here => pk_table,
            RefOp::Inbound if pk_table == here => fk_table,
            _ => {
                return Err(Error::ConflictModel(format!(
                    "Foreign key {} is not connected to table {}.",
                    kr.name,
                    self.model.table_display(here)
                )))
            }
        };

        let pos = self.elements.len();
        if let Some(alias) = alias {
            if self.aliases.insert(alias.to_string(), pos).is_some() {
                return Err(Error::BadData(format!(
                    "Alias {} bound more than once in entity path.",
                    alias
                )));
            }
        }
        self.elements.push(PathElement {
            pos: pos as u32,
            table: target,
            alias: alias.map(str::to_string),
            link: Some(Link {
                keyref,
                refop,
                from: self.cursor,
            }),
            filters: Vec::new(),
        });
        self.cursor = pos;
        Ok(())
    }

    /// Rewind the current entity to a previously bound alias, so
    /// subsequent joins branch from there.
    pub fn set_context(&mut self, alias: &str) -> Result<()> {
        self.cursor = self.alias_position(alias)?;
        Ok(())
    }

    /// Validate `pred` against the current entity and attach it there.
    ///
    /// With a request context, referenced columns are checked for the
    /// `select` right; without one (model-load compilation) the check
    /// is deferred to request time.
    pub fn add_filter(&mut self, pred: Predicate, ctx: Option<&RequestContext>) -> Result<()> {
        let resolved = pred.resolve(self, ctx)?;
        self.elements[self.cursor].filters.push(resolved);
        Ok(())
    }

    /// The SQL join condition of the element at `pos`, if it is linked.
    fn link_condition(&self, pos: usize, prefix: &str) -> Option<String> {
        let elem = &self.elements[pos];
        let link = elem.link.as_ref()?;
        let kr = self.model.key_reference(link.keyref);
        let conds: Vec<String> = kr
            .ref_map
            .pairs()
            .map(|(fk_col, pk_col)| {
                let (left, right) = match link.refop {
                    RefOp::Outbound => (fk_col, pk_col),
                    RefOp::Inbound => (pk_col, fk_col),
                };
                format!(
                    "{}t{}.{} = {}t{}.{}",
                    prefix,
                    link.from,
                    self.model.column(left).sql_name(),
                    prefix,
                    pos,
                    self.model.column(right).sql_name(),
                )
            })
            .collect();
        Some(conds.join(" AND "))
    }

    /// Emit the FROM clause with plain (ungated) table references.
    /// Elements are aliased `{prefix}t{pos}`.
    pub fn sql_from(&self, prefix: &str) -> String {
        let exprs: Vec<String> = self
            .elements
            .iter()
            .map(|e| self.model.table_sql_name(e.table))
            .collect();
        self.sql_from_exprs(prefix, &exprs)
    }

    /// Emit the FROM clause with a caller-chosen table expression per
    /// element. The dynamic-authorization emitter substitutes gated
    /// subqueries through this.
    pub fn sql_from_exprs(&self, prefix: &str, exprs: &[String]) -> String {
        assert_eq!(exprs.len(), self.elements.len());
        let mut out = String::new();
        for pos in 0..self.elements.len() {
            if pos == 0 {
                out.push_str(&format!("{} AS {}t0", exprs[0], prefix));
            } else {
                let cond = self
                    .link_condition(pos, prefix)
                    .expect("non-base elements are linked");
                out.push_str(&format!(
                    " JOIN {} AS {}t{} ON ({})",
                    exprs[pos], prefix, pos, cond
                ));
            }
        }
        out
    }

    /// Conjoin every attached filter into a WHERE fragment.
    pub fn sql_where(&self, prefix: &str) -> Option<String> {
        let clauses: Vec<String> = self
            .elements
            .iter()
            .flat_map(|e| e.filters.iter())
            .map(|f| format!("({})", f.sql_where(self.model, prefix)))
            .collect();
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}
