//! Escalation: multi-level decision routing.
//!
//! ```text
//! leaf (confidence < threshold) ── EscalationRequest ──┐
//!                                                      ▼
//!                    parent: can_decide_locally? ── no ──► forward to its parent
//!                         │ yes                               │
//!                         ▼                                   ▼
//!                     Decision ◄──────────────────────── root (terminal, must decide)
//!                         │
//!                         ▼
//!     awaiting parent applies Decision.chosen to the origin's result
//! ```
//!
//! Forwarding nodes only learn that the request was resolved. A root with no
//! rule is a policy gap and aborts the run.

pub mod policy;
pub mod router;
pub mod types;

pub use policy::{
    accept_default, always, confidence_floor, unresolved, EscalationPolicy, Predicate, Resolver,
};
pub use router::{EscalationRouter, Resolution, RouteStep};
pub use types::{
    Choice, Decision, EscalationAudit, EscalationHop, EscalationReason, EscalationRequest,
    HopAction,
};
