//! Clients for the systems the reconciliation engine talks to

pub mod adguard;
pub mod flaresolverr;
pub mod nftables;
pub mod uci;

pub use adguard::{AdGuardClient, Credentials, QueryLogEntry, QueryLogSource};
pub use flaresolverr::{DisabledFetcher, FlareSolverrClient, PageFetcher};
pub use nftables::{MembershipSets, NftSets, SetInfo};
pub use uci::{PbrPolicy, PolicyConfigSource, UciPolicySource};
