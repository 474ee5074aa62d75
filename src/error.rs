use std::error::Error as StdError;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The closed set of error kinds surfaced to clients.
///
/// Every fallible operation in the crate reports one of these; anything a
/// component cannot classify becomes `Internal`. The kind of the topmost
/// error decides the HTTP status at the API boundary, while the wrapped
/// cause stays reachable through [`std::error::Error::source`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    #[error("{resource} {id} already exists")]
    AlreadyExists { resource: String, id: String },

    #[error("{message}")]
    InvalidInput {
        message: String,
        field: Option<String>,
    },

    #[error("permission denied on {path}: {message}")]
    PermissionDenied { path: String, message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl ErrorKind {
    /// Machine-readable wire code for the error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound { .. } => "NOT_FOUND",
            ErrorKind::AlreadyExists { .. } => "ALREADY_EXISTS",
            ErrorKind::InvalidInput { .. } => "INVALID_INPUT",
            ErrorKind::PermissionDenied { .. } => "PERMISSION_DENIED",
            ErrorKind::Internal { .. } => "INTERNAL",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

impl Error {
    #[must_use]
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::NotFound {
            resource: resource.into(),
            id: id.into(),
        })
    }

    #[must_use]
    pub fn already_exists(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::AlreadyExists {
            resource: resource.into(),
            id: id.into(),
        })
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::InvalidInput {
            message: message.into(),
            field: None,
        })
    }

    /// An `InvalidInput` attributed to a specific request field.
    #[must_use]
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        })
    }

    #[must_use]
    pub fn permission_denied(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::PermissionDenied {
            path: path.into(),
            message: message.into(),
        })
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Internal {
            message: message.into(),
        })
    }

    #[must_use]
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// Attach the underlying cause. The chain stays reachable via
    /// [`std::error::Error::source`].
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self.kind, ErrorKind::AlreadyExists { .. })
    }

    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidInput { .. })
    }

    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.kind, ErrorKind::PermissionDenied { .. })
    }

    /// The `(resource, id)` pair for kinds that carry one.
    #[must_use]
    pub fn resource_id(&self) -> Option<(&str, &str)> {
        match &self.kind {
            ErrorKind::NotFound { resource, id } | ErrorKind::AlreadyExists { resource, id } => {
                Some((resource, id))
            }
            _ => None,
        }
    }

    /// The offending request field, when known.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::InvalidInput { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}
