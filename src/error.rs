//! Error taxonomy.
//!
//! Configuration and privilege errors are fatal at start. Transient source
//! and indexer errors are retried within bounds. Data errors are
//! per-document: the offending document is skipped and the checkpoint
//! advances past the event.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("unknown table {schema}.{table}")]
    UnknownTable { schema: String, table: String },

    #[error("unknown column {column} on {schema}.{table}")]
    UnknownColumn {
        schema: String,
        table: String,
        column: String,
    },

    #[error("unknown schema {0}")]
    UnknownSchema(String),

    #[error("node {table} requires relationship variant and type")]
    MissingRelationship { table: String },

    #[error(
        "more than one foreign key connects {parent} and {child}; declare foreign_key explicitly"
    )]
    AmbiguousForeignKey { parent: String, child: String },

    #[error("no foreign key path from {parent} to {child}")]
    UnreachableNode { parent: String, child: String },

    #[error("foreign key chain through {0} loops back on itself")]
    CycleDetected(String),
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("role {role} is neither superuser nor replication; refusing to run")]
    InsufficientPrivilege { role: String },

    #[error("replication slot {0} is held by another consumer")]
    SlotInUse(String),
}

/// Transient source-database failures, retried with bounded backoff.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database connection lost")]
    ConnectionLost(#[source] sqlx::Error),

    #[error("replication slot {0} has gone away")]
    ReplicationSlotGone(String),
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("indexer returned retryable status {status}")]
    Retryable { status: u16 },

    #[error("indexer rejected the request: {status} {reason}")]
    Fatal { status: u16, reason: String },

    #[error("indexer request failed")]
    Http(#[from] reqwest::Error),
}

impl IndexerError {
    /// 429 and 5xx are retryable, as are transport failures; any other 4xx
    /// is a request we must not repeat.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexerError::Retryable { .. } => true,
            IndexerError::Fatal { .. } => false,
            IndexerError::Http(e) => !e.is_builder(),
        }
    }

    pub fn from_status(status: u16, reason: String) -> Self {
        if status == 429 || status >= 500 {
            IndexerError::Retryable { status }
        } else {
            IndexerError::Fatal { status, reason }
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable")]
    Unavailable(#[source] std::io::Error),
}

/// Per-document data errors; never fatal to the engine.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unsupported JSON path expression: {0}")]
    UnsupportedJsonPath(String),

    #[error("transform rule references missing column {0}")]
    TransformRuleMissingColumn(String),
}

/// Map a failure to the documented process exit code: 2 for configuration
/// errors, 3 for privilege errors, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return 2;
        }
        if let Some(p) = cause.downcast_ref::<PrivilegeError>() {
            if matches!(p, PrivilegeError::InsufficientPrivilege { .. }) {
                return 3;
            }
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: anyhow::Error = ConfigError::UnknownTable {
            schema: "public".into(),
            table: "missing".into(),
        }
        .into();
        assert_eq!(exit_code(&config), 2);

        let privilege: anyhow::Error = PrivilegeError::InsufficientPrivilege {
            role: "app".into(),
        }
        .into();
        assert_eq!(exit_code(&privilege), 3);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&other), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(ConfigError::InvalidSchema("bad".into()))
            .context("building tree for sync books");
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_indexer_classification() {
        assert!(IndexerError::from_status(429, String::new()).is_retryable());
        assert!(IndexerError::from_status(503, String::new()).is_retryable());
        assert!(!IndexerError::from_status(400, "mapper_parsing".into()).is_retryable());
        assert!(!IndexerError::from_status(404, String::new()).is_retryable());
    }
}
