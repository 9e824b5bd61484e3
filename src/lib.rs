//! lintkeeper library crate
//!
//! Keeps merge request review threads in sync with a linter's findings.
//! Exposes the reconciler and its building blocks so benchmarks and
//! external tooling can drive a pass without going through CLI startup.

pub mod ciutil;
pub mod config;
pub mod diagnostic;
pub mod fingerprint;
pub mod gitlab;
pub mod input;
pub mod posted;
pub mod reconcile;
pub mod render;
pub mod review;
pub mod task_group;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use diagnostic::Comment;
pub use reconcile::{DiscussionCommenter, FlushSummary, ReconcileError};
pub use review::{PublishMode, ReviewApi};
