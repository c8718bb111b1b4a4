pub mod history;
pub mod labeling;
pub mod model_state;
pub mod project;
pub mod workflow;

/// Central (non-project-scoped) schema carrying the project registry, the
/// user table and the model marketplace.
pub const ADMIN_SCHEMA: &str = "annolab_admin";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Internal(#[from] sqlx::Error),
    #[error("Invalid stored value: {0}")]
    Conversion(String),
}

impl RepoError {
    pub fn conversion<M: std::fmt::Display>(message: M) -> Self {
        RepoError::Conversion(message.to_string())
    }
}
