//! # vault-agents
//!
//! The processes that move work items through a vault.
//!
//! ```text
//!   Needs_Action ──cloud draft──▶ Needs_Action/cloud ──local executive──▶ Pending_Approval
//!                                        │                                     │ human
//!                                        │ cloud integration                   ▼
//!                                        ▼                        Approved / Rejected
//!                                      Done ◀──────────orchestrator───────────┘
//! ```
//!
//! - [`Orchestrator`]: dispatches approved items to [`ChannelProcessor`]s
//!   exactly once per content signature
//! - [`LocalExecutive`]: full-trust loop and sole dashboard writer
//! - [`CloudDraftWorker`]: draft-only producer
//! - [`CloudIntegrationWorker`]: draft-only integration calls with offline replay
//! - [`QueryBridge`]: list / approve / reject for front ends

use std::path::Path;

pub mod audit;
pub mod cloud_draft;
pub mod cloud_integration;
pub mod dashboard;
pub mod local_executive;
pub mod orchestrator;
pub mod processor;
pub mod query;
pub mod scheduler;

pub use audit::{AuditEntry, AuditLog};
pub use cloud_draft::CloudDraftWorker;
pub use cloud_integration::{CloudIntegrationWorker, IntegrationReport};
pub use dashboard::{render_dashboard, Dashboard, DashboardWriter};
pub use local_executive::{LocalCycleReport, LocalExecutive};
pub use orchestrator::{AllSummary, ApprovedSummary, Orchestrator, QueueCounts, RejectedSummary};
pub use processor::{
    ChannelProcessor, CommandProcessor, OutcomeStatus, ProcessOutcome, ProcessorRegistry,
};
pub use query::{ActionResult, ActionStatus, ItemSummary, QueryBridge};
pub use scheduler::{IntervalScheduler, Scheduler};

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
