// ABOUTME: Sync engines - bulk export state machine, inbound pull, outbound push
// ABOUTME: SyncRunner drives them per object with failure isolation and a continuous mode

pub mod bulk;
pub mod inbound;
pub mod outbound;
pub mod runner;
pub mod state;

pub use bulk::{BulkExport, BulkExportConfig, PollTimeoutPolicy};
pub use inbound::{InboundMode, InboundOutcome, InboundSettings, InboundSync};
pub use outbound::{OutboundOutcome, OutboundSync};
pub use runner::{RunnerConfig, SyncObject, SyncRunner, SyncStats};
pub use state::{CursorPosition, PendingBulkJob, StateStore, SyncCursor};
