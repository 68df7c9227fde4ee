//! Reconciliation engine: discovery, extraction, set sync, warm-start and
//! the timers that drive them

pub mod address;
pub mod discovery;
pub mod extractor;
pub mod matcher;
pub mod reconcile;
pub mod scheduler;
pub mod targets;
pub mod warm;

pub use address::is_valid_ip;
pub use discovery::{Discoverer, build_targets};
pub use extractor::{Extractor, SetTuple, extract};
pub use matcher::{DomainMatcher, DomainPattern, MatchMode, normalize_domain};
pub use reconcile::{SetSynchronizer, SyncReport};
pub use scheduler::{Collaborators, EngineSettings, SyncEngine, TargetStatus, run};
pub use targets::{AddressFamily, PolicyTarget, TargetRegistry, TargetSnapshot};
pub use warm::{WarmReport, warm};
