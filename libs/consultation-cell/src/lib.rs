// =====================================================================================
// CONSULTATION CELL - QUEUE, ACCEPTANCE, PAYMENT AND SESSION LIFECYCLE
// =====================================================================================
//
// Every status change of a consultation goes through the lifecycle engine as a
// conditional update against the transition store. Side effects that outlive the
// request (payment deadlines, notifications) are handed to the delayed task
// scheduler and the dispatch relay, both of which run as background workers.
//
// =====================================================================================

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::*;
pub use models::*;
pub use services::*;
pub use router::create_consultation_router;
