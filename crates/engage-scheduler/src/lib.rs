//! # Engage Scheduler
//!
//! Delayed job queue plus the event-driven automation engine.
//!
//! ## Architecture
//! ```text
//! Event (order, contact, webhook, cart...)
//!   → AutomationService.trigger_by_event(event, payload)
//!     → for each active automation with a matching trigger:
//!       → WorkflowExecutor (own tokio task)
//!         → TriggerRegistry.validate
//!         → delay nodes: tokio::time::sleep
//!         → ActionRegistry.execute (http_request, send_template, add_to_list, log)
//!         → execution record in SQLite
//!
//! SqliteJobQueue
//!   ├── enqueue(topic, payload, delay, key)
//!   ├── cancel(key)
//!   └── consume(topic, handler): one job in flight per topic, retry then bury
//! ```

pub mod actions;
pub mod automations;
pub mod queue;
pub mod triggers;
pub mod workflow;

pub use actions::{ActionExecutor, ActionRegistry};
pub use automations::{AutomationPatch, AutomationService, TestOutcome, TriggeredAutomation};
pub use queue::SqliteJobQueue;
pub use triggers::{TriggerPredicate, TriggerRegistry};
pub use workflow::{ExecutionReport, WorkflowExecutor};
