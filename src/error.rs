use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Kind of operation that produced a backend error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Single item read
    Get,
    /// Single item write
    Put,
    /// Partial attribute merge
    Update,
    /// Single item removal
    Delete,
    /// Partition key query
    Query,
    /// Full table scan
    Scan,
    /// Multi key read
    BatchGet,
    /// Multi item write
    BatchWrite,
    /// All-or-nothing multi item read
    TransactGet,
    /// All-or-nothing multi item write
    TransactWrite,
    /// Table provisioning and listing
    Admin,
    /// Session establishment and health probes
    Connect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Get => "GetItem",
            OperationKind::Put => "PutItem",
            OperationKind::Update => "UpdateItem",
            OperationKind::Delete => "DeleteItem",
            OperationKind::Query => "Query",
            OperationKind::Scan => "Scan",
            OperationKind::BatchGet => "BatchGetItem",
            OperationKind::BatchWrite => "BatchWriteItem",
            OperationKind::TransactGet => "TransactGetItems",
            OperationKind::TransactWrite => "TransactWriteItems",
            OperationKind::Admin => "Admin",
            OperationKind::Connect => "Connect",
        };
        f.write_str(name)
    }
}

/// Table operation error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No schema registered under the table name
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    /// The table has no secondary index with that name
    #[error("table '{table}' has no index named '{index}'")]
    UnknownIndex {
        /// Table name
        table: String,
        /// Requested index name
        index: String,
    },
    /// A schema for the table name was already registered
    #[error("a schema for table '{0}' is already registered")]
    DuplicateSchema(String),
    /// The table declaration is inconsistent
    #[error("invalid schema for table '{table}': {reason}")]
    InvalidSchema {
        /// Table name
        table: String,
        /// What is wrong with the declaration
        reason: String,
    },
    /// An item or key lacks a key attribute, or holds null for it
    #[error("item for table '{table}' is missing key attribute '{attribute}'")]
    MissingKeyAttribute {
        /// Table name
        table: String,
        /// Key attribute name
        attribute: String,
    },
    /// A key attribute holds a value that cannot be part of a key
    #[error("key attribute '{attribute}' of table '{table}' must be a string, number or boolean")]
    InvalidKeyAttribute {
        /// Table name
        table: String,
        /// Key attribute name
        attribute: String,
    },
    /// The value has no wire representation
    #[error("value cannot be encoded: {0}")]
    UnencodableType(String),
    /// The expression references a placeholder or alias with no binding
    #[error("expression references '{0}' but no value or name is bound to it")]
    MissingBinding(String),
    /// The expression is well-formed but unusable for the requested operation
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    /// A write precondition did not hold
    #[error("conditional {operation} on table '{table}' failed")]
    ConditionalWriteFailed {
        /// Table name
        table: String,
        /// Operation that carried the condition
        operation: OperationKind,
    },
    /// A strict update targeted an item that does not exist
    #[error("item not found in table '{0}'")]
    ItemNotFound(String),
    /// A batch was rejected before any request was issued
    #[error("batch for table '{table}' rejected at entry {index}: {source}")]
    BatchValidationFailed {
        /// Table name
        table: String,
        /// Position of the offending entry
        index: usize,
        /// Validation failure of that entry
        source: Box<Error>,
    },
    /// A transactional write failed and every applied operation was reverted
    #[error("transaction canceled at operation {index}: {source}")]
    TransactionCanceled {
        /// Position of the failing operation
        index: usize,
        /// Failure of that operation
        source: Box<Error>,
    },
    /// A transactional write failed and some compensations failed as well
    #[error("transaction failed at operation {index} and {} compensation(s) failed: {source}", .failures.len())]
    RollbackIncomplete {
        /// Position of the failing operation
        index: usize,
        /// Failure of that operation
        source: Box<Error>,
        /// Compensation failures, in the order they were attempted
        failures: Vec<Error>,
    },
    /// The session could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The backend rejected or failed to execute a request
    #[error("{operation} on table '{table}' failed: {message}")]
    BackendExecutionFailed {
        /// Table name, empty for account level calls
        table: String,
        /// Operation kind
        operation: OperationKind,
        /// Backend error description
        message: String,
    },
    /// Typed record (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check if the error is a failed write precondition
    ///
    /// This is useful for detecting optimistic locking failures when using
    /// conditional expressions in put or update operations.
    pub fn is_conditional_check_failed(&self) -> bool {
        match self {
            Error::ConditionalWriteFailed { .. } => true,
            Error::TransactionCanceled { source, .. }
            | Error::RollbackIncomplete { source, .. } => source.is_conditional_check_failed(),
            _ => false,
        }
    }

    /// Check if the error was raised before any request reached the backend
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownTable(_)
                | Error::UnknownIndex { .. }
                | Error::InvalidSchema { .. }
                | Error::MissingKeyAttribute { .. }
                | Error::InvalidKeyAttribute { .. }
                | Error::UnencodableType(_)
                | Error::MissingBinding(_)
                | Error::InvalidExpression(_)
                | Error::BatchValidationFailed { .. }
        )
    }

    /// Check if the error comes from the backend or the session
    pub fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Error::BackendExecutionFailed { .. } | Error::ConnectionFailed(_)
        )
    }

    pub(crate) fn backend(
        table: impl Into<String>,
        operation: OperationKind,
        message: impl fmt::Display,
    ) -> Self {
        Error::BackendExecutionFailed {
            table: table.into(),
            operation,
            message: message.to_string(),
        }
    }

    /// Map an SDK error, turning condition check failures into [`Error::ConditionalWriteFailed`]
    pub(crate) fn from_sdk<E, R>(table: &str, operation: OperationKind, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: fmt::Debug + Send + Sync + 'static,
    {
        if let Some(service_error) = err.as_service_error() {
            if service_error.code() == Some("ConditionalCheckFailedException") {
                return Error::ConditionalWriteFailed {
                    table: table.to_string(),
                    operation,
                };
            }
        }

        Error::backend(table, operation, DisplayErrorContext(&err))
    }

    pub(crate) fn from_build(table: &str, operation: OperationKind, err: BuildError) -> Self {
        Error::backend(table, operation, err)
    }
}

impl From<serde_dynamo::Error> for Error {
    fn from(e: serde_dynamo::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_conditional_check_failed() {
        let err = Error::ConditionalWriteFailed {
            table: "orders".to_string(),
            operation: OperationKind::Put,
        };
        assert!(err.is_conditional_check_failed());
        assert!(!err.is_validation_error());

        let wrapped = Error::TransactionCanceled {
            index: 1,
            source: Box::new(err),
        };
        assert!(wrapped.is_conditional_check_failed());
    }

    #[test]
    fn test_is_validation_error() {
        let err = Error::MissingKeyAttribute {
            table: "orders".to_string(),
            attribute: "pk".to_string(),
        };
        assert!(err.is_validation_error());
        assert!(!err.is_backend_error());
    }

    #[test]
    fn test_is_backend_error() {
        let err = Error::backend("orders", OperationKind::Query, "throttled");
        assert!(err.is_backend_error());
        assert_eq!(err.to_string(), "Query on table 'orders' failed: throttled");
    }

    #[test]
    fn test_build_error_conversion() {
        let err = Error::from_build("orders", OperationKind::Put, BuildError::other("test"));
        assert!(matches!(
            err,
            Error::BackendExecutionFailed {
                operation: OperationKind::Put,
                ..
            }
        ));
    }

    #[test]
    fn test_batch_validation_display() {
        let err = Error::BatchValidationFailed {
            table: "orders".to_string(),
            index: 2,
            source: Box::new(Error::MissingKeyAttribute {
                table: "orders".to_string(),
                attribute: "pk".to_string(),
            }),
        };
        let debug = format!("{:?}", err);
        assert!(debug.contains("BatchValidationFailed"));
        assert!(err.to_string().contains("entry 2"));
    }
}
