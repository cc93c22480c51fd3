//! Usage accounting persistence.
//!
//! The runner drops one [`node_runtime::UsageRecord`] per terminal
//! job outcome into the [`Journal`], an embedded SQLite log that
//! survives process and OS crashes. The [`UsageSyncer`] drains it to
//! the control plane in the background; records are deleted only
//! after the remote append succeeds, so the pipeline is resumable
//! after any crash.

mod journal;
mod syncer;

pub use journal::{Journal, JournalEntry, JournalError, JournalSink};
pub use syncer::{SyncError, UsageSyncer};
