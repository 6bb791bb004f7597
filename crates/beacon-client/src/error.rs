#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    /// No geolocation capability, or the initial read failed. Reported
    /// to the operator rather than retried; a publish session cannot
    /// start without a position.
    #[error("no position available: {0}")]
    NoPosition(String),

    #[error("snapshot refetch failed: {0}")]
    Snapshot(String),
}
