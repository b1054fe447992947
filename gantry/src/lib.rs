//! Task-distribution and result-correlation fabric for histogram fitting.
//!
//! The fabric connects calibration producers to a pool of fitter
//! processes through a four-endpoint balancer:
//!
//! ```text
//! Dispatcher ──push──► request_in ─┐            ┌─ request_out ──pull──► Worker
//!                                  │  Balancer  │
//! Dispatcher ◄──pull── response_out┘            └─ response_in ◄──push── Worker
//! ```
//!
//! - [`balancer`]: the payload-blind store-and-forward router.
//! - [`dispatch`]: producer-side batch submission and count-based
//!   response reconciliation under a correlation key.
//! - [`worker`]: worker-side harness around a [`worker::FitEngine`].
//! - [`pool`]: fitter subprocess lifecycle.
//! - [`wire`]: the JSON line formats shared by dispatcher and worker.
//! - [`net`]: endpoints and the non-blocking sockets under the balancer.

pub mod balancer;
pub mod dispatch;
pub mod net;
pub mod pool;
pub mod trace;
pub mod wire;
pub mod worker;

pub use trace::init_tracing;
