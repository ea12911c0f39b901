use thiserror::Error;

/// Canonical protocol-level error codes shared by the HTTP transport and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorCode {
    InvalidInput,
    Forbidden,
    EntityNotFound,
    EntityAlreadyExists,
    MirrorUnavailable,
    InternalError,
}

impl ProtocolErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Forbidden => "forbidden",
            Self::EntityNotFound => "entity_not_found",
            Self::EntityAlreadyExists => "entity_already_exists",
            Self::MirrorUnavailable => "mirror_unavailable",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("entity already exists: {slug}")]
    EntityAlreadyExists { slug: String },

    #[error("schema migration required: current={current}, required={required}")]
    SchemaMigrationRequired { current: u32, required: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// Convenience constructor for SQLite errors, use with `.map_err(StateError::sqlite)`.
    pub fn sqlite<E: std::fmt::Display>(e: E) -> Self {
        Self::Sqlite(e.to_string())
    }

    /// Convenience constructor for JSON encode/decode errors.
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn entity_not_found(entity: impl std::fmt::Display) -> Self {
        Self::EntityNotFound {
            entity: entity.to_string(),
        }
    }
}

/// Faults raised while queuing or writing a sync job.
///
/// Detector refusals are not errors; they surface as skip reasons. Anything
/// here ends up as a failed outcome once it reaches the drain boundary.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("source tree not found for entity {entity_id}")]
    TreeNotFound { entity_id: u64 },

    #[error("slug could not be resolved for entity {entity_id}")]
    UnresolvedEntity { entity_id: u64 },

    #[error("source tree is {depth} levels deep, the limit is {max}")]
    TreeTooDeep { depth: usize, max: usize },

    #[error("sync job panicked: {0}")]
    Panicked(String),
}

/// Errors returned by the status/override/poll endpoints.
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("forbidden: {action}")]
    Forbidden { action: String },

    #[error("entity not found: {slug}")]
    EntityNotFound { slug: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

fn state_code(err: &StateError) -> ProtocolErrorCode {
    match err {
        StateError::EntityNotFound { .. } => ProtocolErrorCode::EntityNotFound,
        StateError::EntityAlreadyExists { .. } => ProtocolErrorCode::EntityAlreadyExists,
        _ => ProtocolErrorCode::InternalError,
    }
}

impl EndpointError {
    pub fn code(&self) -> ProtocolErrorCode {
        match self {
            Self::InvalidInput(_) => ProtocolErrorCode::InvalidInput,
            Self::Forbidden { .. } => ProtocolErrorCode::Forbidden,
            Self::EntityNotFound { .. } => ProtocolErrorCode::EntityNotFound,
            Self::State(err) | Self::Sync(SyncError::State(err)) => state_code(err),
            Self::Sync(SyncError::UnresolvedEntity { .. } | SyncError::TreeNotFound { .. }) => {
                ProtocolErrorCode::EntityNotFound
            }
            Self::Sync(SyncError::TreeTooDeep { .. }) => ProtocolErrorCode::InvalidInput,
            Self::Sync(SyncError::Panicked(_)) => ProtocolErrorCode::InternalError,
        }
    }

    pub fn forbidden(action: impl Into<String>) -> Self {
        Self::Forbidden {
            action: action.into(),
        }
    }
}
