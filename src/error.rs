use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ChatError::NotFound(message.into())
    }

    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, ChatError::Validation(_) | ChatError::NotFound(_))
    }

    /// Text safe to send to a client. Infrastructure details stay in the logs.
    pub fn user_message(&self) -> String {
        if self.is_infrastructure() {
            "Something went wrong, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_not_exposed() {
        let err = ChatError::from(StoreError::Backend("disk full".into()));
        assert!(err.is_infrastructure());
        assert!(!err.user_message().contains("disk"));
    }

    #[test]
    fn validation_errors_are_shown_verbatim() {
        let err = ChatError::validation("Location coordinates required");
        assert_eq!(err.user_message(), "Location coordinates required");
    }
}
