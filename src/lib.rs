//! strider - workflow engine for AI-driven browser automation
//!
//! strider executes declarative workflows: ordered sequences of typed blocks
//! that chain values through a shared, run-scoped context while driving a
//! remote browser through atomic actions decided by an AI planner. The
//! browser driver, planner, secret store, object storage, mailer, and durable
//! persistence are external collaborators consumed through narrow traits.
//!
//! ## Example
//!
//! ```yaml
//! name: invoice-download
//! organization: acme
//!
//! parameters:
//!   - type: secret
//!     key: portal_password
//!     reference: vault/acme/portal
//!
//! blocks:
//!   - label: login
//!     type: login
//!     url: https://portal.example.com/login
//!     credential: portal_password
//!
//!   - label: list-invoices
//!     type: extraction
//!     goal: Extract the invoice table as an array of {id, url}
//!
//!   - label: each-invoice
//!     type: for_loop
//!     loop_over: "${list-invoices.output}"
//!     max_parallel: 2
//!     blocks:
//!       - label: fetch-invoice
//!         type: navigation
//!         url: "${current_item.url}"
//! ```

pub mod blocks;
pub mod browser;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod planner;
pub mod secrets;
pub mod shutdown;
pub mod storage;
pub mod task;
pub mod validation;
pub mod workflow;

pub use engine::{CancelRegistry, Runner};
pub use error::{Error, Result};
