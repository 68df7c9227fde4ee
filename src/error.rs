//! Error type shared by the reconciliation engine and its collaborators.

/// Errors raised while talking to AdGuard Home, pbr, nftables or FlareSolverr.
#[derive(Debug)]
pub enum PbrSyncError {
    /// Invalid or missing setting detected at startup
    Config(String),
    /// Credentials were rejected by the resolver
    Auth(String),
    /// The resolver session is no longer valid
    AuthExpired,
    /// Transport failure or timeout
    Network(String),
    /// Non-success HTTP status from an external API
    Http { status: u16, body: String },
    /// pbr configuration or nft set inventory could not be read
    Discovery(String),
    /// Adding an element to an nft set failed
    SetMutation(String),
    /// FlareSolverr request failed for one domain
    Proxy(String),
    /// Local command (`uci`, `nft`, init script) failed to run
    Command(String),
}

impl PbrSyncError {
    /// Transient errors heal on their own; the next cycle simply retries.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PbrSyncError::Config(_) | PbrSyncError::Auth(_))
    }
}

impl std::fmt::Display for PbrSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PbrSyncError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PbrSyncError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PbrSyncError::AuthExpired => write!(f, "Session expired"),
            PbrSyncError::Network(msg) => write!(f, "Network error: {}", msg),
            PbrSyncError::Http { status, body } => write!(f, "HTTP {}: {}", status, body),
            PbrSyncError::Discovery(msg) => write!(f, "Discovery failed: {}", msg),
            PbrSyncError::SetMutation(msg) => write!(f, "Set mutation failed: {}", msg),
            PbrSyncError::Proxy(msg) => write!(f, "Proxy error: {}", msg),
            PbrSyncError::Command(msg) => write!(f, "Command failed: {}", msg),
        }
    }
}

impl std::error::Error for PbrSyncError {}

impl From<reqwest::Error> for PbrSyncError {
    fn from(e: reqwest::Error) -> Self {
        PbrSyncError::Network(e.to_string())
    }
}

impl From<std::io::Error> for PbrSyncError {
    fn from(e: std::io::Error) -> Self {
        PbrSyncError::Command(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PbrSyncError>;
