//! Embodied AI bridge
//!
//! Connects the host's state stream and action surface to a remote AI
//! endpoint:
//!
//! - [`ExposureFilter`] decides which entities leave the host
//! - [`StateChangeForwarder`] POSTs exposed state changes upstream
//! - [`ActionInvocationGate`] runs upstream action requests against the host
//! - [`AutonomyController`] tracks upstream health and the pause switch
//! - [`Bridge`] wires one runtime per config entry into the host
//!
//! The core talks to the host only through the traits in [`host`].

pub mod autonomy;
pub mod constants;
pub mod error;
pub mod exposure;
pub mod forwarder;
pub mod gate;
pub mod host;
pub mod runtime;
pub mod status;

pub use autonomy::{
    AutonomyController, AutonomyDiagnostics, AutonomyState, ListenerRemover, PauseCallback,
    StateListener,
};
pub use error::{BridgeError, BridgeResult, ExecutionError, GateError, PersistError};
pub use exposure::ExposureFilter;
pub use forwarder::{build_payload, BridgeEntities, ForwarderDeps, StateChangeForwarder};
pub use gate::{ActionInvocationGate, ActionRequest, ActionResponse};
pub use host::{
    AreaResolver, AuditSink, CommandExecutor, ConfigEntryOptionsStore, Notifier, OptionsStore,
    ServiceNotifier, StateChange, StateChangeCallback, StateChangeSource, Subscription,
};
pub use runtime::{http_client_factory, Bridge, ClientFactory, EntryRuntime, Host};
pub use status::StatusEntities;
