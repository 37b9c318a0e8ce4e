//! Interrupt callback table and dispatch.

use super::report::{Reporter, ResultChannel};
use crate::error::{HarnessError, Result};
use crate::x86::interrupt::NUM_VECTORS;
use crate::x86::{CpuOps, InterruptFrame, interrupt_name};

/// Handles one interrupt. Returning `false` means "not handled" and stops the
/// test.
pub type InterruptCallback<C> = fn(&mut InterruptContext<'_, C>) -> bool;

/// What a callback sees: the interrupted frame, its own user data and a way to
/// report results.
pub struct InterruptContext<'r, C> {
    cpu: &'r C,
    channel: ResultChannel<'r>,
    pub user_data: usize,
    pub vector: usize,
    pub frame: &'r mut InterruptFrame,
    pub error_code: u64,
}

impl<C: CpuOps> InterruptContext<'_, C> {
    pub fn cpu(&self) -> &C {
        self.cpu
    }
}

impl<C: CpuOps> Reporter for InterruptContext<'_, C> {
    fn channel(&self) -> ResultChannel<'_> {
        self.channel
    }

    fn yield_to_host(&self) {
        self.cpu.halt();
    }

    fn halt_forever(&self) -> ! {
        self.cpu.halt_forever()
    }
}

struct Handler<C> {
    callback: InterruptCallback<C>,
    user_data: usize,
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Handler<C> {}

/// An interrupt nobody claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnhandledInterrupt {
    pub vector: usize,
    pub ip: u64,
}

impl UnhandledInterrupt {
    pub fn name(&self) -> Option<&'static str> {
        interrupt_name(self.vector)
    }
}

/// Per-vector callbacks with their user data.
pub struct InterruptTable<C> {
    handlers: [Option<Handler<C>>; NUM_VECTORS],
}

impl<C: CpuOps> InterruptTable<C> {
    pub const fn new() -> Self {
        Self {
            handlers: [const { None }; NUM_VECTORS],
        }
    }

    /// Installs (or with `None`, removes) the callback for `vector`.
    pub fn set_callback(
        &mut self,
        vector: usize,
        callback: Option<InterruptCallback<C>>,
        user_data: usize,
    ) -> Result {
        let slot = self
            .handlers
            .get_mut(vector)
            .ok_or(HarnessError::VectorOutOfRange(vector))?;
        *slot = callback.map(|callback| Handler {
            callback,
            user_data,
        });
        Ok(())
    }

    pub fn is_set(&self, vector: usize) -> bool {
        matches!(self.handlers.get(vector), Some(Some(_)))
    }

    /// Runs the callback registered for `vector`.
    pub fn dispatch(
        &self,
        cpu: &C,
        channel: ResultChannel<'_>,
        vector: usize,
        frame: &mut InterruptFrame,
        error_code: u64,
    ) -> core::result::Result<(), UnhandledInterrupt> {
        let unhandled = UnhandledInterrupt {
            vector,
            ip: frame.rip,
        };
        let Some(Some(handler)) = self.handlers.get(vector).copied() else {
            return Err(unhandled);
        };

        let mut cx = InterruptContext {
            cpu,
            channel,
            user_data: handler.user_data,
            vector,
            frame,
            error_code,
        };
        if (handler.callback)(&mut cx) {
            Ok(())
        } else {
            Err(unhandled)
        }
    }
}

impl<C: CpuOps> Default for InterruptTable<C> {
    fn default() -> Self {
        Self::new()
    }
}
