use annolab_common::model::ProjectName;
use annolab_common::SafeDisplay;
use std::fmt::Display;

use crate::broker::BrokerError;
use crate::repo::RepoError;

/// Error taxonomy of the public operations. `InvalidWorkflow`,
/// `UnknownWorkflow` and `AdmissionRefused` are caller mistakes and carry a
/// user-facing message; the remaining variants are infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum AiTaskError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Workflow \"{0}\" does not exist in this project")]
    UnknownWorkflow(String),
    #[error("{0}")]
    AdmissionRefused(String),
    #[error("Project \"{0}\" does not exist")]
    UnknownProject(ProjectName),
    #[error("Model state \"{0}\" does not exist in this project")]
    UnknownModelState(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Database error: {0}")]
    Repo(#[from] RepoError),
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AiTaskError {
    pub fn invalid_workflow<M: Display>(message: M) -> Self {
        AiTaskError::InvalidWorkflow(message.to_string())
    }

    pub fn admission_refused<M: Display>(message: M) -> Self {
        AiTaskError::AdmissionRefused(message.to_string())
    }

    pub fn internal<M: Display>(message: M) -> Self {
        AiTaskError::Internal(anyhow::Error::msg(message.to_string()))
    }
}

impl SafeDisplay for AiTaskError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}
