//! Rate limiting algorithms and the limiter facade.

mod backend;
mod cache;
mod gcra;
mod limiter;
mod local;
mod release;
mod remote_gcra;
mod reply;
mod sliding_window;

pub use backend::{Decision, RateLimiterBackend, RateSpec};
pub use cache::TtlCache;
pub use gcra::{CasExhausted, Gcra, GcraState, Verdict, MAX_CAS_ATTEMPTS};
pub use limiter::{Engine, Limiter};
pub use local::LocalGcra;
pub use release::Release;
pub use remote_gcra::RemoteGcra;
pub use sliding_window::SlidingWindowLog;
