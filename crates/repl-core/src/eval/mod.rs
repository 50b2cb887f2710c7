//! Tracking evaluations from send to outcome.
//!
//! Every eval, load-file and lookup request gets a record in the
//! [`EvalRegistry`]. Responses are routed to their record by id and turned
//! into [`crate::events::EvalEvent`]s.

mod classify;
mod lookup;
mod record;
mod registry;

pub use classify::{classify, classify_exception, Routed};
pub use lookup::LookupInfo;
pub use record::{EvalFailure, EvalKind, EvalRecord, EvalStatus, SourceContext, SourceLocation};
pub use registry::{Discarded, EvalRegistry, InterruptState};
