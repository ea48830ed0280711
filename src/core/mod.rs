//! The broker's subsystems.
//!
//! Every module here implements one component of SPEC_FULL.md §2-4. Nothing
//! outside `core::broker` wires two subsystems together directly; everything
//! flows through the broker's thin waist.

pub mod authenticator;
pub mod broker;
pub mod circuit_breaker;
pub mod elicitation;
pub mod event_log;
pub mod expert_registry;
pub mod policy;
pub mod projection;
pub mod rpc;
pub mod session;
pub mod speed_layer;
