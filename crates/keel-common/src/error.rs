//! Common error types for the Keel network plane.
//!
//! Every fallible operation in the plane surfaces a [`KeelError`]. Callers
//! that need to branch on failure class use [`KeelError::kind`] rather than
//! matching on message text.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Coarse failure class of a [`KeelError`].
///
/// The store CAS variants fold into this taxonomy: a CAS conflict is
/// [`ErrorKind::Forbidden`], a missing key is [`ErrorKind::NotFound`] and a
/// duplicate key is [`ErrorKind::AlreadyExists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: bad id, unknown option, invalid CIDR, bad sysctl.
    InvalidParameter,
    /// Unknown network, endpoint, interface, neighbor or key.
    NotFound,
    /// Duplicate network id, endpoint id, port binding or key.
    AlreadyExists,
    /// Operation not permitted, including CAS conflicts.
    Forbidden,
    /// Conflicting kernel state, e.g. an overlapping route.
    Conflict,
    /// A resource (lease, lock) stayed busy past its retry budget.
    ResourceBusy,
    /// Feature absent on this OS or kernel.
    NotImplemented,
    /// Kernel, netlink or iptables failure not classified above.
    Internal,
}

/// Common errors across the Keel network plane.
#[derive(Error, Diagnostic, Debug)]
pub enum KeelError {
    /// A caller-supplied parameter was malformed.
    #[error("invalid parameter: {message}")]
    #[diagnostic(code(keel::invalid_parameter))]
    InvalidParameter {
        /// What was wrong with the input.
        message: String,
    },

    /// A named resource does not exist.
    #[error("{resource} not found: {id}")]
    #[diagnostic(code(keel::not_found))]
    NotFound {
        /// Resource class ("network", "endpoint", "link", ...).
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A named resource already exists.
    #[error("{resource} already exists: {id}")]
    #[diagnostic(code(keel::already_exists))]
    AlreadyExists {
        /// Resource class.
        resource: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// The operation is not permitted.
    #[error("operation not permitted: {message}")]
    #[diagnostic(code(keel::forbidden))]
    Forbidden {
        /// Why the operation was refused.
        message: String,
    },

    /// Conflicting state, e.g. an address overlapping an existing route.
    #[error("conflict: {message}")]
    #[diagnostic(code(keel::conflict))]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// An address overlaps an existing non-default route.
    #[error("route conflict: {address} overlaps route {route}")]
    #[diagnostic(
        code(keel::route_conflict),
        help("remove the conflicting route or pick an address outside it")
    )]
    RouteConflict {
        /// The address being assigned.
        address: String,
        /// The conflicting route destination.
        route: String,
    },

    /// A resource stayed busy past its retry budget.
    #[error("resource busy: {resource}")]
    #[diagnostic(code(keel::resource_busy))]
    ResourceBusy {
        /// The resource that could not be acquired.
        resource: String,
    },

    /// Feature absent on this OS or kernel.
    #[error("not implemented: {feature}")]
    #[diagnostic(code(keel::not_implemented))]
    NotImplemented {
        /// The unsupported feature.
        feature: &'static str,
    },

    /// Store key does not exist.
    #[error("key not found in store: {key}")]
    #[diagnostic(code(keel::store::key_not_found))]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// Store key was modified since the caller's snapshot (CAS failure).
    #[error("key modified in store: {key}")]
    #[diagnostic(
        code(keel::store::key_modified),
        help("re-read the key and retry the operation with the fresh index")
    )]
    KeyModified {
        /// The contended key.
        key: String,
    },

    /// Store key exists but the caller expected it not to.
    #[error("key already exists in store: {key}")]
    #[diagnostic(code(keel::store::key_exists))]
    KeyExists {
        /// The duplicate key.
        key: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(keel::serialization))]
    Serialization(String),

    /// Kernel, netlink or iptables operation failed.
    #[error("internal error: {message}")]
    #[diagnostic(code(keel::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KeelError {
    /// The coarse failure class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::NotFound { .. } | Self::KeyNotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::KeyExists { .. } => ErrorKind::AlreadyExists,
            Self::Forbidden { .. } | Self::KeyModified { .. } => ErrorKind::Forbidden,
            Self::Conflict { .. } | Self::RouteConflict { .. } => ErrorKind::Conflict,
            Self::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::Io(_) | Self::Serialization(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Shorthand for an [`KeelError::Internal`] with a formatted message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an [`KeelError::InvalidParameter`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Serialization(err.to_string())
    }
}
