use std::fmt;

/// Error taxonomy for the execution core (see spec §7).
///
/// Modeled as a hand-rolled enum with an explicit `Display`, matching the
/// style of this crate's other status enums rather than pulling in a new
/// error-derive dependency.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Request-level validation failure. Aborts the whole batch before any
    /// row runs.
    BadInput(String),
    /// A referenced knowledge table, output column, or row could not be
    /// found.
    ResourceNotFound(String),
    /// A cell's dependency column is in the row's `errored` set.
    UpstreamError { columns: Vec<String> },
    /// The language-model router (or another provider-backed capability)
    /// surfaced a mapped error after exhausting its own retries.
    ProviderError(String),
    /// The persistence capability failed to durably write rows.
    PersistenceError(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::BadInput(msg) => write!(f, "bad input: {msg}"),
            CoreError::ResourceNotFound(what) => write!(f, "not found: {what}"),
            CoreError::UpstreamError { columns } => {
                write!(f, "upstream error from columns: {}", columns.join(", "))
            }
            CoreError::ProviderError(msg) => write!(f, "provider error: {msg}"),
            CoreError::PersistenceError(msg) => write!(f, "persistence error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// The `[ERROR] <message>` content a failed cell surfaces to the client
    /// (§7 "user-visible behavior").
    pub fn as_cell_content(&self) -> String {
        format!("[ERROR] {self}")
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
