//! fedsync: batch import of chess federation data into Postgres.
//!
//! The portal is scraped phase by phase in a fixed dependency order; runs
//! are resumable from a durable checkpoint, cancellable at safe points and
//! guarded by a cross-process lock. The `api` module exposes the control
//! surface, `sync` the pipeline itself, `scrape` the portal client.

pub mod api;
pub mod scrape;
pub mod sync;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}
