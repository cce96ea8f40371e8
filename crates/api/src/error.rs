use cloudsync_engine::EngineError;

pub const ERR_CODE_INVALID_PARAMS: &str = "invalid_params";
pub const ERR_CODE_BAD_REQUEST: &str = "bad_request";
pub const ERR_CODE_FORBIDDEN: &str = "forbidden";
pub const ERR_CODE_METHOD_NOT_FOUND: &str = "method_not_found";
pub const ERR_CODE_INTERNAL: &str = "internal";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown method: {0}")]
    MethodNotFound(String),
    #[error("invalid {method} params: {message}")]
    InvalidParams { method: String, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CommandError {
    /// Stable code sent back to the client.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MethodNotFound(_) => ERR_CODE_METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => ERR_CODE_INVALID_PARAMS,
            Self::Engine(
                EngineError::NotSessionMember { .. }
                | EngineError::NotActionSource { .. }
                | EngineError::NotFileRecipient { .. },
            ) => ERR_CODE_FORBIDDEN,
            Self::Engine(error) if error.is_protocol_violation() => ERR_CODE_BAD_REQUEST,
            Self::Engine(_) => ERR_CODE_INTERNAL,
        }
    }

    /// Message safe to show the client; infrastructure details stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.code() {
            ERR_CODE_INTERNAL => "internal".to_owned(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use cloudsync_core::CoreError;
    use cloudsync_engine::EngineError;
    use cloudsync_storage::StorageError;

    use super::*;

    #[test]
    fn codes_follow_the_error_taxonomy() {
        assert_eq!(
            CommandError::MethodNotFound("nope".to_owned()).code(),
            ERR_CODE_METHOD_NOT_FOUND
        );
        assert_eq!(
            CommandError::from(EngineError::MissingNodeId).code(),
            ERR_CODE_BAD_REQUEST
        );
        assert_eq!(
            CommandError::from(EngineError::Protocol(CoreError::InvalidSessionId)).code(),
            ERR_CODE_BAD_REQUEST
        );
        assert_eq!(
            CommandError::from(EngineError::NotSessionMember {
                client_instance_id: "a".to_owned(),
                session_id: "ABCDEFGH2".to_owned(),
            })
            .code(),
            ERR_CODE_FORBIDDEN
        );
        let exhausted = CommandError::from(EngineError::Storage(StorageError::RetriesExhausted));
        assert_eq!(exhausted.code(), ERR_CODE_INTERNAL);
        assert_eq!(exhausted.public_message(), "internal");
    }
}
