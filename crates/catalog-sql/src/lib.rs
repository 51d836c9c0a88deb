// Database access for the catalog model: snapshot introspection of the
// known_* views, the auxiliary metadata store for annotations / ACLs /
// dynamic bindings, and DDL mutation helpers. Everything here runs
// inside the caller's transaction; the model-change event is always the
// last side effect so the version tick publishes a complete snapshot.

pub mod config;
pub mod ddl;
pub mod introspect;
pub mod rows;
pub mod store;

pub use config::CatalogConfig;
pub use introspect::{build_model, introspect};

/// The reserved schema holding introspection views and auxiliary
/// metadata tables.
pub const STORAGE_SCHEMA: &str = "_ermcat";

/// Advance the model version. Every mutation fires this after its own
/// statements, making the tick the transaction's final side effect.
pub async fn model_change_event(conn: &mut sqlx::PgConnection) -> models::Result<()> {
    sqlx::query(&format!("SELECT {}.model_change_event();", STORAGE_SCHEMA))
        .execute(conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

/// Map driver failures onto the model error taxonomy. Database errors
/// at this layer are invariant violations, not client mistakes.
pub(crate) fn db_error(err: sqlx::Error) -> models::Error {
    models::Error::RuntimeError(format!("database error: {}", err))
}
