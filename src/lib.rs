//! mirrorsync - Selective, precision-tolerant mirroring
//!
//! mirrorsync keeps a designated subtree of a live filesystem mirrored into a
//! local cache and onward to a remote store, propagating only files whose
//! content materially changed.
//!
//! ## Core Features
//!
//! - **Path Rules**: Hierarchical include/exclude trees compiled to first-match rules
//! - **Volatility Checkers**: Content-aware suppression of noisy rewrites
//! - **External Sync Tool**: rclone-compatible invocation through generated filter files
//! - **Remote Reconciliation**: Minute-precision remote listings folded back into the mirror
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`rules`]: Path rule compilation
//! - [`scanner`] and [`entry`]: Local change detection
//! - [`executor`]: Sync tool invocation and status parsing
//! - [`reconcile`]: Mirror reconciliation against the remote listing

pub mod changes;
pub mod checkers;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod executor;
pub mod filter;
pub mod health;
pub mod listing;
pub mod reconcile;
pub mod rules;
pub mod scanner;
pub mod state;
pub mod sync;
pub mod tags;

pub use changes::{Change, ChangeKind, Changes};
pub use config::Config;
pub use context::CycleContext;
pub use error::SyncError;
pub use executor::{Action, Executor, SyncTool};
pub use health::HealthCheck;
pub use listing::{CommandListing, FileListing, ListingSource, RemoteDate};
pub use reconcile::{ReconcileReport, Reconciler};
pub use rules::{PathRule, PathRules, RuleCompiler};
pub use scanner::{ScanReport, Scanner};
pub use sync::{BackupEngine, SyncSummary};
