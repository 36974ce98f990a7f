//! Callback delivery to a target thread.
//!
//! Both flavors end with the same user callback running
//! `trampoline(context)` on the target thread. They differ in how that
//! thread is made to run it:
//!
//! - [`DeliveryMode::Queue`] inserts the user callback directly and relies
//!   on the thread entering an alertable wait by itself.
//! - [`DeliveryMode::Force`] inserts a kernel carrier. Once the carrier runs
//!   on the target thread it inserts the user callback and parks the thread
//!   in a short alertable wait, which dispatches the callback immediately.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use kinject_core::{ApcDescriptor, ApcKind, ApcPrimitive, InjectError, ThreadId, TicketId, Va};

use crate::DeliveryMode;

/// What the host should do with a descriptor after running the engine's
/// kernel routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRoutineOutcome {
    /// Dispatch `routine(context)` in user mode.
    Deliver {
        /// The user routine, possibly redirected for translated targets.
        routine: Va,

        /// The user argument.
        context: Va,
    },

    /// The thread is terminating. The descriptor is released without
    /// running.
    Suppressed,

    /// A force carrier finished its work. The descriptor is released.
    Forwarded,
}

/// Submits thunks to threads through the host's callback primitive.
#[derive(Debug)]
pub(crate) struct Delivery {
    mode: DeliveryMode,
    alertable_delay: Duration,
    next_ticket: AtomicU64,
}

impl Delivery {
    pub fn new(mode: DeliveryMode, alertable_delay: Duration) -> Self {
        Self {
            mode,
            alertable_delay,
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Queues `code(context)` on `thread`.
    pub fn submit<Apc>(
        &self,
        apc: &Apc,
        thread: ThreadId,
        code: Va,
        context: Va,
        translated: bool,
    ) -> Result<TicketId, InjectError>
    where
        Apc: ApcPrimitive,
    {
        let ticket = TicketId(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let kind = match self.mode {
            DeliveryMode::Queue => ApcKind::User,
            DeliveryMode::Force => ApcKind::Force,
        };

        let descriptor = ApcDescriptor {
            ticket,
            thread,
            kind,
            routine: code,
            context,
            translated,
        };

        match apc.insert(descriptor) {
            Ok(()) => {
                tracing::debug!(ticket = ticket.0, %thread, %code, ?kind, "callback queued");
                Ok(ticket)
            }
            Err(_) => Err(InjectError::NotCapable),
        }
    }

    /// Runs on the target thread when a descriptor reaches its delivery
    /// point.
    pub fn run_kernel_routine<Apc>(&self, apc: &Apc, descriptor: ApcDescriptor) -> KernelRoutineOutcome
    where
        Apc: ApcPrimitive,
    {
        match descriptor.kind {
            ApcKind::User => {
                if apc.is_thread_terminating(descriptor.thread) {
                    tracing::debug!(ticket = descriptor.ticket.0, "thread is terminating");
                    return KernelRoutineOutcome::Suppressed;
                }

                let mut routine = descriptor.routine;
                let mut context = descriptor.context;

                if descriptor.translated {
                    apc.wrap_translated(&mut routine, &mut context);
                }

                KernelRoutineOutcome::Deliver { routine, context }
            }

            ApcKind::Force => {
                let user = ApcDescriptor {
                    kind: ApcKind::User,
                    ..descriptor
                };

                if apc.insert(user).is_err() {
                    tracing::warn!(
                        ticket = descriptor.ticket.0,
                        thread = %descriptor.thread,
                        "failed to queue user callback from carrier"
                    );
                }

                apc.alertable_delay(self.alertable_delay);
                KernelRoutineOutcome::Forwarded
            }
        }
    }
}
