//! Render scheduling
//!
//! - `request`: request, error and ticket types
//! - `inflight`: per-page ownership and supersession of requests
//! - `worker`: worker threads that render under the document lock
//! - `scheduler`: the entry point tying them together

mod inflight;
mod request;
mod scheduler;
mod worker;

pub use inflight::CancelToken;
pub use request::{
    DimensionOutcome, DimensionTicket, Priority, RenderError, RenderOutcome, RenderRequest,
    RenderTicket, RequestId,
};
pub use scheduler::{DEFAULT_WORKERS, RenderScheduler};
