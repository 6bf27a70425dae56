//! HTTP intake and status service for Readingflow.
//!
//! Adds a `.spawn_http(port, shutdown)` method to a shared `Coordinator`
//! that serves job submission, status and cancellation.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use readingflow_harness::CoordinatorHarnessExt;
//!
//! let coordinator = Arc::new(Coordinator::new(store, config, notifier));
//! let server = coordinator.spawn_http(8080, shutdown.clone());
//! ```
//!
//! # Routes
//!
//! - `POST /jobs` - submit a reading request, returns `{ "job_id": .. }`
//! - `GET /jobs/:id` - progress snapshot plus produced artifacts
//! - `POST /jobs/:id/cancel` - stop further claims for a live job
//! - `GET /health`

mod ext;
pub mod server;
pub mod shutdown;

pub use ext::CoordinatorHarnessExt;
pub use server::{create_router, run_server, AppState};
pub use shutdown::install_shutdown_handler;
