//! Notification-driven module injection.
//!
//! The [`Engine`] keeps a list of registered mappings, each describing an
//! image to inject and the process to inject it into. The host forwards
//! process creation, process exit and image load notifications to the
//! engine, which:
//!
//! 1. binds mappings to newly created processes,
//! 2. waits until the process has loaded the system modules the image
//!    depends on ([`Dependencies`]),
//! 3. maps the image through the host's loader and prepares a trampoline
//!    ([`Thunk`]) for each TLS initializer and the entry point,
//! 4. delivers the trampolines one at a time to the notifying thread and
//!    polls their results on subsequent notifications.
//!
//! # Examples
//!
//! ```no_run
//! # use kinject_core::{InjectError, InjectionHost, ProcessId};
//! # use kinject_engine::{Engine, EngineConfig, InjectionSource, InjectionTarget, ProcessEvent};
//! # fn example(host: impl InjectionHost) -> Result<(), InjectError> {
//! let engine = Engine::initialize(host, EngineConfig::default())?;
//!
//! engine.register_injection(
//!     InjectionSource::Path(r"C:\Windows\System32\payload.dll".into()),
//!     InjectionTarget::Name("notepad.exe".into()),
//! )?;
//!
//! // Forwarded by the host.
//! engine.process_notify(ProcessEvent::Created {
//!     pid: ProcessId(1234),
//!     image_path: r"\Device\HarddiskVolume3\Windows\System32\notepad.exe",
//! });
//! engine.image_notify(ProcessId(1234), Some(r"\Windows\System32\ntdll.dll"));
//!
//! engine.destroy();
//! # Ok(())
//! # }
//! ```

mod config;
mod delivery;
mod dependency;
mod engine;
mod mapping;
mod module;
mod notify;
mod process;
mod thunk;

#[cfg(test)]
mod engine_tests;

pub use self::{
    config::{DeliveryMode, EngineConfig},
    delivery::KernelRoutineOutcome,
    dependency::Dependencies,
    engine::Engine,
    mapping::{InjectionSource, InjectionTarget, MappingId, MappingState, MappingStatus},
    module::{ModuleId, ModuleStatus},
    notify::ProcessEvent,
    thunk::{DLL_PROCESS_ATTACH, THUNK_WAITING, Thunk, ThunkCompletion, ThunkOutcome},
};
