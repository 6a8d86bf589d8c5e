use thiserror::Error;

/// Tunnel broker errors
///
/// Every variant is scoped to a single tunnel attempt; none of them is fatal
/// to the process.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Tunnel not found")]
    TokenNotFound,

    #[error("Session closed before the hand-off was delivered")]
    SessionClosed,

    #[error("Malformed tunnel id: {0}")]
    MalformedInput(String),

    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),

    #[error("Tunnel cancelled by peer")]
    Cancelled,

    #[error("No unused token after {attempts} attempts")]
    TokenSpaceExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl BrokerError {
    /// Copy of this error suitable for sending to the other leg of a tunnel.
    ///
    /// `io::Error` is not `Clone`, so transport errors keep only kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::TokenNotFound => Self::TokenNotFound,
            Self::SessionClosed => Self::SessionClosed,
            Self::MalformedInput(input) => Self::MalformedInput(input.clone()),
            Self::TimedOut(what) => Self::TimedOut(what),
            Self::Cancelled => Self::Cancelled,
            Self::TokenSpaceExhausted { attempts } => Self::TokenSpaceExhausted {
                attempts: *attempts,
            },
            Self::Transport(e) => Self::Transport(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}
