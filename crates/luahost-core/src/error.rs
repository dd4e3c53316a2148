use thiserror::Error;

/// Errors surfaced by the embedding layer.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// A value on the interpreter stack was not the expected type.
    ///
    /// Contains the name of the expected type.
    #[error("type mismatch: wanted {wanted}")]
    TypeMismatch { wanted: &'static str },
    /// A raw error, normally reported by the interpreter itself.
    #[error("{msg}")]
    Runtime { msg: Box<str> },
    /// An error from an external source, e.g. a failing host closure.
    #[error("external error: {err}")]
    External { err: Box<str> },
    /// Unsupported (de)serialization type.
    #[error("unsupported type: {ty}")]
    UnsupportedType { ty: &'static str },
    /// Unsupported (de)serialization type, determined at runtime.
    #[error("unsupported type: {ty}")]
    UnsupportedDynamicType { ty: String },
    /// The owning interpreter state has already been shut down.
    #[error("the lua instance has been shut down")]
    Shutdown,
}
