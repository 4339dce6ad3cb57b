// WebSocket close codes and reasons the relay uses to end a connection.

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Why the relay closed a connection.
///
/// Every variant maps to a distinct `(code, reason)` pair so a client can tell
/// the cases apart even where several share the policy-violation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    ServerBusy,
    TooManyConnections,
    ConnectionRateLimited,
    MessageRateLimited,
    MissingRoomId,
    MalformedUrl,
    PayloadTooLarge,
    InternalError,
    ShuttingDown,
    SlowConsumer,
}

impl CloseReason {
    pub const ALL: [Self; 10] = [
        Self::ServerBusy,
        Self::TooManyConnections,
        Self::ConnectionRateLimited,
        Self::MessageRateLimited,
        Self::MissingRoomId,
        Self::MalformedUrl,
        Self::PayloadTooLarge,
        Self::InternalError,
        Self::ShuttingDown,
        Self::SlowConsumer,
    ];

    pub const fn code(self) -> u16 {
        match self {
            Self::ServerBusy
            | Self::TooManyConnections
            | Self::ConnectionRateLimited
            | Self::MessageRateLimited
            | Self::MissingRoomId
            | Self::MalformedUrl => CLOSE_POLICY_VIOLATION,
            Self::PayloadTooLarge => CLOSE_MESSAGE_TOO_BIG,
            Self::InternalError => CLOSE_INTERNAL_ERROR,
            Self::ShuttingDown => CLOSE_GOING_AWAY,
            Self::SlowConsumer => CLOSE_TRY_AGAIN_LATER,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Self::ServerBusy => "Server busy",
            Self::TooManyConnections => "Too many connections",
            Self::ConnectionRateLimited => "Rate limit exceeded",
            Self::MessageRateLimited => "Message rate limit exceeded",
            Self::MissingRoomId => "Room ID required",
            Self::MalformedUrl => "Invalid request URL",
            Self::PayloadTooLarge => "Payload too large",
            Self::InternalError => "Internal server error",
            Self::ShuttingDown => "Server shutting down",
            Self::SlowConsumer => "Client too slow",
        }
    }

    /// Inverse of [`CloseReason::code`] + [`CloseReason::reason`], for clients.
    pub fn from_close(code: u16, reason: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.code() == code && candidate.reason() == reason)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
