//! Caller-facing error type.
//!
//! Backends raise their own error kind (`satchel-storage`'s
//! `DatabaseError`); the store translates it to a [`StoreError`] before it
//! reaches the caller. The numeric codes are stable and suitable for
//! surfacing across an FFI or wire boundary.

/// Kind of a [`StoreError`], as seen by store consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// No error. Reserved for wire encodings where 0 means success.
    Success,
    /// The backend engine reported an operational failure.
    Backend,
    /// The store or a record is busy; the operation may succeed on retry.
    Busy,
    /// A uniqueness constraint was violated.
    Duplicate,
    /// An encryption-related failure (e.g. rekeying an unencrypted store).
    Encryption,
    /// The caller supplied invalid input.
    Input,
    /// The requested store, profile, or record does not exist.
    NotFound,
    /// An unexpected internal failure.
    Unexpected,
    /// The operation or schema version is not supported.
    Unsupported,
    /// A failure in the wrapper layer itself (misuse of the session API).
    Wrapper,
    /// An application-defined error forwarded through the store.
    Custom,
}

impl StoreErrorKind {
    /// Stable numeric code for this kind.
    pub fn code(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::Backend => 1,
            Self::Busy => 2,
            Self::Duplicate => 3,
            Self::Encryption => 4,
            Self::Input => 5,
            Self::NotFound => 6,
            Self::Unexpected => 7,
            Self::Unsupported => 8,
            Self::Wrapper => 99,
            Self::Custom => 100,
        }
    }

    /// Short identifier used in log output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Backend => "Backend",
            Self::Busy => "Busy",
            Self::Duplicate => "Duplicate",
            Self::Encryption => "Encryption",
            Self::Input => "Input",
            Self::NotFound => "NotFound",
            Self::Unexpected => "Unexpected",
            Self::Unsupported => "Unsupported",
            Self::Wrapper => "Wrapper",
            Self::Custom => "Custom",
        }
    }
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every public store operation.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    /// Classification of the failure.
    pub kind: StoreErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Original backend message, when the error was translated.
    pub cause: Option<String>,
}

impl StoreError {
    /// Creates an error of the given kind.
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches the originating backend message.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Creates an [`StoreErrorKind::Input`] error.
    pub fn input(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Input, message)
    }

    /// Creates a [`StoreErrorKind::Wrapper`] error.
    pub fn wrapper(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Wrapper, message)
    }

    /// Returns `true` if this is a [`StoreErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    /// Returns `true` if this is a [`StoreErrorKind::Duplicate`].
    pub fn is_duplicate(&self) -> bool {
        self.kind == StoreErrorKind::Duplicate
    }

    /// Returns `true` if the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.kind == StoreErrorKind::Busy
    }
}
