//! Sign-in failures

use thiserror::Error;

/// Error variants for authorization-code flow failures.
///
/// None of the variants carry token material; the provider's own error
/// payload is kept so it can be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The identity provider rejected the request.
    #[error("{error}: {description}")]
    Provider {
        /// OAuth error code (e.g. `invalid_grant`)
        error: String,
        /// Human-readable description supplied by the provider
        description: String,
    },

    /// The callback arrived without a flow started in this session.
    #[error("No sign-in flow is pending for this session")]
    MissingFlow,

    /// The pending flow is older than the configured flow lifetime.
    #[error("The sign-in flow has expired, please sign in again")]
    FlowExpired,

    /// The callback `state` does not match the pending flow.
    #[error("State mismatch - possible CSRF attack")]
    StateMismatch,

    /// The callback carried neither a code nor an error.
    #[error("Authorization code not provided")]
    MissingCode,

    /// The id token nonce does not match the pending flow.
    #[error("Id token nonce does not match the sign-in flow")]
    NonceMismatch,

    /// The id token is absent or unreadable.
    #[error("Invalid id token: {0}")]
    InvalidIdToken(String),

    /// The provider answered with something that is not a token response.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The provider could not be reached.
    #[error("Identity provider unreachable: {0}")]
    Network(String),
}

impl AuthError {
    /// Short error code for pages and logs
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Provider { error, .. } => error,
            Self::MissingFlow => "missing_flow",
            Self::FlowExpired => "flow_expired",
            Self::StateMismatch => "state_mismatch",
            Self::MissingCode => "missing_code",
            Self::NonceMismatch => "nonce_mismatch",
            Self::InvalidIdToken(_) => "invalid_id_token",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Network(_) => "network_error",
        }
    }

    /// Description shown on the error page
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Provider { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}
