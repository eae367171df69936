//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Open storage → Check schema → Prepare queries → Domain workers
//!     → Optional workers → Messengers → Bind listener → Running
//!     (any failure: stop what was acquired in reverse, Terminated)
//!
//! Triggers (signals.rs, config watcher):
//!     SIGTERM/SIGINT → Terminate
//!     SIGHUP / config change → Reload
//!
//! Shutdown (coordinator.rs → shutdown.rs):
//!     First trigger → ShuttingDown → scheduler → listener → workers
//!     → messengers → storage → Terminated
//!
//! Supervisor (supervisor.rs):
//!     Reload with restart_on_reload → next generation, otherwise exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: storage first, listener last
//! - Ordered shutdown: the reverse, with the scheduler stopped first
//! - Every stop has a deadline; a stuck subsystem is reported, not awaited
//! - State and the pending update share one mutex

pub mod coordinator;
pub mod events;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;
pub mod subsystem;
pub mod supervisor;
pub mod worker;

pub use coordinator::{
    Completion, Coordinator, ReloadTrigger, TriggerKind, TriggerReceiver, TriggerRelay,
};
pub use events::{Event, EventBus, EventKind};
pub use shutdown::{ShutdownDeadlines, ShutdownPlan, ShutdownReport, ShutdownStep, StepFailure};
pub use startup::{bootstrap, App, AppContext, BootstrapError, VERSION};
pub use state::{Lifecycle, LifecycleState, PendingUpdate, TransitionError};
pub use subsystem::{StopError, Subsystem, SubsystemHandle, STOP_GRACE};
pub use supervisor::{Supervisor, SupervisorError};
pub use worker::{Worker, WorkerError, WorkerTask};
