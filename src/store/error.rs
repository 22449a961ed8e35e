use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel for an empty table or an absent key. Callers that treat
    /// absence as "no entries" match on this instead of failing.
    #[error("no records found")]
    EmptyRecord,

    #[error("invalid record key: {0}")]
    InvalidKey(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_empty_record(&self) -> bool {
        matches!(self, StoreError::EmptyRecord)
    }
}
