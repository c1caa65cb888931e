//! Collaborator traits. Implementations live in sibling crates:
//! the SQLite store resolves target lists, `engage-scheduler` provides the
//! delayed job queue, and `engage-channels` provides channel adapters.

pub mod channel;
pub mod queue;
pub mod targets;

pub use channel::{ChannelAdapter, ChannelMap, DeliveryReceipt};
pub use queue::{Job, JobHandler, JobId, JobQueue};
pub use targets::TargetListResolver;
