// Entity-path query compilation: the join-structured intermediate
// representation built from parsed URLs and dynamic-ACL projections,
// predicate validation against a catalog model, and emission of SQL
// FROM/WHERE fragments with authorization clauses injected inline.

pub mod dynacl;
pub mod name;
pub mod path;
pub mod predicate;

pub use dynacl::{
    compile_binding, dynacl_clauses, entity_path_from_sql, entity_select_sql, gated_column_sql,
    gated_table_sql, GateMode,
};
pub use name::{ColumnRef, Name};
pub use path::{EntityPath, PathElement, RefOp};
pub use predicate::{BinaryOp, Predicate, TextOp, UnaryOp};
