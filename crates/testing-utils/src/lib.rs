//! # TaskPilot Testing Utils
//!
//! Shared testing utilities for the task orchestration workspace.
//!
//! ## Features
//!
//! - **Test Data Builders**: tasks, submissions and endpoint configs with sensible defaults
//! - **Mock Handlers**: scripted, sleeping and recording task handlers
//! - **Mock Notifier**: in-memory callback receiver
//! - **Helpers**: polling utilities for asynchronous assertions
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! taskpilot-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
