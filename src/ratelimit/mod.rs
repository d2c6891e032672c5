//! Policy resolution and token accounting.

mod clock;
mod engine;
mod key;
mod memory;
mod policy;
mod registry;
mod resolver;
mod response;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EvaluationOutcome, RateLimitEngine, RateLimitingResult};
pub use key::{build_key, AccountingKey};
pub use memory::InMemoryTokenStore;
pub use policy::{BucketSpec, PolicyDeclaration, RatePolicy, RateUnit, TimeUnit};
pub use registry::{GroupConfig, PolicyConfig, TargetConfig, TargetRegistry, TargetRegistryBuilder};
pub use resolver::{resolve, PolicySet};
pub use response::{
    RenderableResult, LIMIT_HEADER, REMAINING_HEADER, RETRY_AFTER_HEADER, TOO_MANY_REQUESTS,
};
pub use store::{BucketState, ConsumeOutcome, TokenStore};
