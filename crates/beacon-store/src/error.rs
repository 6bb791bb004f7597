#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record is absent, or its expiry has passed. The two cases are
    /// deliberately indistinguishable to callers.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
