use thiserror::Error;

/// Stable numeric codes carried in wire-level error replies.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ErrBadFrame = 1001,
    ErrMissingCapability = 1002,
    ErrUnexpectedFrame = 1003,

    ErrPowInvalid = 1101,

    ErrTokenInvalid = 1201,
    ErrTokenAlreadySpent = 1202,
    ErrNoTokenBalance = 1203,

    ErrStorage = 1301,

    ErrConfig = 1401,
    ErrBadPassword = 1402,

    ErrComponentDown = 1501,
    ErrConnection = 1502,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("token invalid")]
    TokenInvalid,
    #[error("token already spent")]
    TokenAlreadySpent,
    #[error("no token balance on connection")]
    NoTokenBalance,
    #[error("proof of work invalid")]
    PowInvalid,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("missing capability: {0}")]
    MissingCapability(&'static str),
    #[error("bad password")]
    BadPassword,
    #[error("server component down: board:{board} token service:{token}")]
    ComponentDown { board: bool, token: bool },
    #[error("connection error: {0}")]
    Connection(String),
}

impl ServerError {
    pub fn code(&self) -> u16 {
        match self {
            ServerError::Config(_) => ErrorCode::ErrConfig as u16,
            ServerError::Storage(_) => ErrorCode::ErrStorage as u16,
            ServerError::TokenInvalid => ErrorCode::ErrTokenInvalid as u16,
            ServerError::TokenAlreadySpent => ErrorCode::ErrTokenAlreadySpent as u16,
            ServerError::NoTokenBalance => ErrorCode::ErrNoTokenBalance as u16,
            ServerError::PowInvalid => ErrorCode::ErrPowInvalid as u16,
            ServerError::Protocol(_) => ErrorCode::ErrUnexpectedFrame as u16,
            ServerError::MissingCapability(_) => ErrorCode::ErrMissingCapability as u16,
            ServerError::BadPassword => ErrorCode::ErrBadPassword as u16,
            ServerError::ComponentDown { .. } => ErrorCode::ErrComponentDown as u16,
            ServerError::Connection(_) => ErrorCode::ErrConnection as u16,
        }
    }

    /// Errors answered in-band with a result frame rather than by dropping
    /// the connection.
    pub fn is_token_failure(&self) -> bool {
        matches!(
            self,
            ServerError::TokenInvalid | ServerError::TokenAlreadySpent | ServerError::NoTokenBalance
        )
    }
}
