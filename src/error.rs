//! Error types for Caravel

use thiserror::Error;

/// Main error type for Caravel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for resource specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Object storage error
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Block storage (volume snapshot) error
    #[error("block store error: {0}")]
    BlockStore(String),

    /// Plugin process or transport error
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Restic repository or command error
    #[error("restic error: {0}")]
    Restic(String),

    /// A partial resource name matched no server-known resource
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// A partial resource name matched more than one server-known resource
    #[error("ambiguous resource {0}: matches {1}")]
    AmbiguousResource(String, String),

    /// Backup hook execution error
    #[error("hook error: {0}")]
    Hook(String),

    /// Archive (tar/gzip) read or write error
    #[error("archive error: {0}")]
    Archive(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors accumulated across a multi-item operation
    #[error("{0} error(s) occurred: {1}")]
    Aggregate(usize, String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an object store error with the given message
    pub fn object_store(msg: impl Into<String>) -> Self {
        Self::ObjectStore(msg.into())
    }

    /// Create a block store error with the given message
    pub fn block_store(msg: impl Into<String>) -> Self {
        Self::BlockStore(msg.into())
    }

    /// Create a plugin error with the given message
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create a restic error with the given message
    pub fn restic(msg: impl Into<String>) -> Self {
        Self::Restic(msg.into())
    }

    /// Create a hook error with the given message
    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    /// Create an archive error with the given message
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    /// Flatten a list of errors into a single aggregate error.
    ///
    /// Returns `Ok(())` for an empty list, the sole error for a singleton
    /// list, and an [`Error::Aggregate`] otherwise.
    pub fn aggregate(mut errs: Vec<Error>) -> crate::Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            n => {
                let joined = errs
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(Error::Aggregate(n, joined))
            }
        }
    }

    /// True when the underlying Kubernetes error is a 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when the underlying Kubernetes error is a 409 conflict
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_empty_is_ok() {
        assert!(Error::aggregate(vec![]).is_ok());
    }

    #[test]
    fn aggregate_single_passes_through() {
        let err = Error::aggregate(vec![Error::validation("bad ttl")]).unwrap_err();
        match err {
            Error::Validation(msg) => assert_eq!(msg, "bad ttl"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_many_joins_messages() {
        let err = Error::aggregate(vec![
            Error::hook("pod nginx: exit 1"),
            Error::block_store("snapshot timed out"),
        ])
        .unwrap_err();
        let s = err.to_string();
        assert!(s.contains("2 error(s)"));
        assert!(s.contains("pod nginx"));
        assert!(s.contains("snapshot timed out"));
    }

    #[test]
    fn resource_resolution_errors_name_the_input() {
        let err = Error::UnknownResource("widgets".into());
        assert!(err.to_string().contains("widgets"));

        let err = Error::AmbiguousResource("po".into(), "pods, podtemplates".into());
        assert!(err.to_string().contains("podtemplates"));
    }
}
