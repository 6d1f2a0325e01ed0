//! Rate limiting logic and state management.

mod backend;
mod counter;
mod key;
mod limiter;
mod memory;

pub use backend::CounterBackend;
pub use counter::CounterEntry;
pub use key::{ClientKey, KeyExtractor, RemoteAddr, RemoteAddrKey};
pub use limiter::{
    ExceededObserver, LimitExceeded, LogObserver, RateLimitDecision, RateLimiter,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use memory::MemoryBackend;
