//! Work entry approval workflow
//!
//! [`WorkflowEngine`] owns every mutation of a [`WorkEntry`]. The legal
//! moves live in [`EntryStatus::transition`]; the engine adds authorization,
//! optimistic version checks, the self-approval prohibition and the audit
//! and notification side effects.

mod engine;
mod entry;
mod repository;
mod status;

pub use engine::{TransitionOutcome, WorkflowEngine};
pub use entry::{
    Correction, DialogMessage, DraftChanges, EntryInput, NewDialogMessage, NewWorkEntry,
    WorkEntry, MAX_HOURS_PER_ENTRY,
};
pub use repository::{DialogRepository, PgWorkflowRepository, WorkEntryRepository};
pub use status::{EntryStatus, Operation};

#[cfg(test)]
pub use repository::{MockDialogRepository, MockWorkEntryRepository};
