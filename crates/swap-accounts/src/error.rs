use thiserror::Error;

use crate::model::AccountStatus;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid account: {0}")]
    Validation(String),
    #[error("account {0} not found")]
    NotFound(String),
    #[error("account {id} is {status} and cannot be activated")]
    Unavailable { id: String, status: AccountStatus },
    #[error("stored record for account {id} is corrupt: {detail}")]
    Corrupt { id: String, detail: String },
    #[error("account store failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("account store task failed: {0}")]
    Task(String),
}

impl AccountError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
