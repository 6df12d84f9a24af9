// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports setup, sync-tables, pull, push, run and status

pub mod sync;

pub use sync::{pull, push, run, setup, status, sync_tables};
