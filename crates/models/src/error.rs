/// Error is the taxonomy shared by every catalog model operation.
/// The request boundary maps each variant onto an HTTP status via
/// [`Error::status`]; nothing in this workspace retries a failed
/// validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed client input: invalid binding documents, bad projection
    /// columns, unknown operators, oversized identifiers.
    #[error("bad request data: {0}")]
    BadData(String),
    /// The request names a model entity which does not exist, or collides
    /// with an existing constraint or name.
    #[error("model conflict: {0}")]
    ConflictModel(String),
    /// The request violates data or referential integrity.
    #[error("data conflict: {0}")]
    ConflictData(String),
    /// An ACL or annotation name is not defined on the resource.
    #[error("not found: {0}")]
    NotFound(String),
    /// The authorization engine statically denied a required right.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// An internal invariant does not hold, e.g. a table lacks a primary
    /// key where one is required.
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl Error {
    /// The HTTP status code the request boundary reports for this error.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadData(_) => 400,
            Error::ConflictModel(_) => 409,
            Error::ConflictData(_) => 409,
            Error::NotFound(_) => 404,
            Error::Forbidden(_) => 403,
            Error::RuntimeError(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn statuses() {
        for (err, status) in [
            (Error::BadData("x".to_string()), 400),
            (Error::ConflictModel("x".to_string()), 409),
            (Error::ConflictData("x".to_string()), 409),
            (Error::NotFound("x".to_string()), 404),
            (Error::Forbidden("x".to_string()), 403),
            (Error::RuntimeError("x".to_string()), 500),
        ] {
            assert_eq!(err.status(), status);
        }
    }
}
