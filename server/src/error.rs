use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("media is already active")]
    AlreadyActive,
    #[error("no media loaded")]
    NoMedia,
    #[error("failed to probe media: {0:#}")]
    Probe(anyhow::Error),
}
