//! File-backed persistence for AgentGate.
//!
//! Lays out a data directory as:
//!
//! ```text
//! <data_dir>/
//!   work-orders/<id>.json          one file per work order
//!   runs/<run_id>/run.json         per-run record
//!   runs/<run_id>/iteration-N.json one per iteration
//!   queue-state.json               scheduler snapshot
//! ```
//!
//! All records are JSON with ISO-8601 timestamps. Writes go through a
//! temp-file-plus-rename so a crash mid-write never leaves a torn record.

pub mod error;
pub mod fs;
pub mod id;
pub mod models;
pub mod queue_state;
pub mod runs;
pub mod work_orders;

pub use error::StoreError;
pub use queue_state::{PersistedQueueEntry, QueueSnapshot};
pub use runs::{CleanupOptions, CleanupReport, RunStore};
pub use work_orders::WorkOrderStore;
