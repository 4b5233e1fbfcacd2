//! Tessel Reactive - Change propagation for the tessel object database.
//!
//! This crate holds the thread-independent parts of live updates:
//!
//! - `CollectionChangeSet` / `ObjectChangeSet`: what changed between two
//!   evaluations of a collection or an object
//! - `ListenerRegistry` / `WeakRegistry`: callback and weak-reference
//!   registries swept on every notification pass
//! - `Mailbox`: a per-thread FIFO queue with at most one pending
//!   "version changed" signal
//! - `ChangeController`: decides whether a version advance happens now or
//!   waits for a background re-evaluation batch
//!
//! # Example
//!
//! ```rust
//! use tessel_reactive::{ChangeController, ChangeDecision};
//!
//! let mut controller = ChangeController::new();
//! assert_eq!(controller.on_change(false), ChangeDecision::AdvanceNow);
//!
//! let first = controller.on_change(true);
//! assert!(matches!(first, ChangeDecision::SubmitBatch(_)));
//! assert_eq!(controller.on_change(true), ChangeDecision::Coalesced);
//! ```

pub mod change_set;
pub mod controller;
pub mod mailbox;
pub mod subscription;

pub use change_set::{CollectionChangeSet, ObjectChangeSet};
pub use controller::{BatchId, BatchOutcome, BatchResolution, ChangeController, ChangeDecision, ControllerState};
pub use mailbox::{Envelope, Mailbox, MailboxSender};
pub use subscription::{ListenerId, ListenerRegistry, WeakRegistry};
