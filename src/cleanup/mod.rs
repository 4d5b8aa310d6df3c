//! Infrastructure Cleanup
//!
//! - **allowlist**: protected stack names derived from the deployed snapshot
//! - **reconciler**: discovery of live managed stacks and guarded deletion

mod allowlist;
mod reconciler;

pub use allowlist::{
    build_safe_allowlist, cleanup_tasks, compute_deletion_set, is_protected, CleanupTask,
    SafeAllowlist,
};
pub use reconciler::{
    discover_managed_stacks, organize_deletions, CleanupReconciler, CleanupReport,
    DeletionOutcome, DeletionRequest, DeletionResult,
};
