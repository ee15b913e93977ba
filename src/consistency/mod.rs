//! Consistency checking and repair.
//!
//! Five artifact surfaces can drift apart: WU YAML, stamps, backlog/status
//! markdown, the event log, and worktrees/branches. The detector classifies
//! each drift; the repairer heals the auto-repairable ones idempotently,
//! batching file-level fixes into a single micro-worktree commit.

mod detect;
mod repair;

pub use detect::{ConsistencyReport, Drift, DriftKind, check_wu_consistency};
pub use repair::{RepairOutcome, SkippedRepair, repair_wu};
