//! Request admission and metering for a paid API.
//!
//! Every inbound call goes through [`pipeline::AdmissionPipeline`]:
//! credential verification, plan resolution, fixed-window rate limiting and
//! an idempotent balance debit, followed by a best-effort usage record.
//! Components are built from one [`context::Context`] created at start-up.

pub mod accounts;
pub mod billing;
pub mod clock;
pub mod configuration;
pub mod context;
pub mod counter;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod metric;
pub mod model;
pub mod pipeline;
pub mod plans;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod usage;
