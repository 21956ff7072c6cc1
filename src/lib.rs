pub mod affinity;
pub mod classify;
pub mod config;
pub mod context;
pub mod driver;
mod error;
pub mod identity;
pub mod request;
pub mod utils;

pub use affinity::{
    AffinityError, AffinityKey, AffinityKeyKind, AffinityStore, MemoryAffinityStore,
    collect_affinity_keys,
};
#[cfg(feature = "affinity-redis")]
pub use affinity::RedisAffinityStore;
pub use classify::{ResponseClassifier, StreamAccumulator, Usage, classifier_for};
pub use config::{AffinityConfig, BackendConfig, IdentityConfig, RelayConfig, TimeoutConfig};
pub use context::{AttemptRecord, BodyObserver, RequestContext, RequestRecord};
pub use driver::{Outcome, RelayDriver};
pub use error::{RelayError, Result};
pub use identity::{
    Clock, IdentityError, IdentityTokenCache, ManagedIdentityIssuer, SystemClock, TokenIssuer,
    TokenRequest,
};
pub use request::{BackendTarget, RequestEnvelope, RequestKind};
