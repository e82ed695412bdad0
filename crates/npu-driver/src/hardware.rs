// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware collaborator seam
//!
//! The driver core never touches silicon directly. Everything it needs from
//! a device goes through [`NpuHardware`]: register access, reset, the
//! wait-link doorbell, power and clock control, and an interrupt line.
//!
//! Most methods have register-level default implementations built on
//! `read_register`/`write_register`, so a backend only has to provide raw
//! register access, power switching and an interrupt source. Backends with a
//! smarter path (a kernel ioctl, a simulator) override the rest.

use crate::daemon::WaitMsg;
use crate::error::{NpuError, Result};
use crossbeam::channel::Sender;
use npu_chip::regs::{self, control, irq, status};
use npu_chip::variant::ChipVariant;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Poll interval for the register-polling idle wait
const IDLE_POLL: Duration = Duration::from_micros(50);

/// Physical I/O for one device
pub trait NpuHardware: Debug + Send + Sync {
    /// Chip variant (from the VERSION register or configuration)
    fn variant(&self) -> ChipVariant;

    /// Number of cores
    fn core_count(&self) -> u8 {
        self.variant().core_count()
    }

    /// Whether the job-cancel register is present
    fn has_job_cancel(&self) -> bool {
        self.variant().has_job_cancel()
    }

    /// Read a per-core register
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the access fails.
    fn read_register(&self, core: u8, offset: usize) -> Result<u32>;

    /// Write a per-core register
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the access fails.
    fn write_register(&self, core: u8, offset: usize, value: u32) -> Result<()>;

    /// Soft-reset one core. Clears its wait-link ring and pending jobs.
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the reset cannot be issued.
    fn reset_hardware(&self, core: u8) -> Result<()> {
        self.write_register(core, regs::CONTROL, control::RESET)
    }

    /// Queue `addr` behind the core's current wait-link entry and ring the doorbell
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the doorbell write fails.
    #[allow(clippy::cast_possible_truncation)]
    fn trigger_hardware(&self, core: u8, addr: u64) -> Result<()> {
        self.write_register(core, regs::WL_NEXT_LO, addr as u32)?;
        self.write_register(core, regs::WL_NEXT_HI, (addr >> 32) as u32)?;
        self.write_register(core, regs::WL_END, 1)
    }

    /// Poll STATUS until every bit of `idle_mask` is set or `timeout` elapses
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if STATUS cannot be read.
    fn wait_hardware_idle(&self, core: u8, timeout: Duration, idle_mask: u32) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_register(core, regs::STATUS)? & idle_mask == idle_mask {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(IDLE_POLL);
        }
    }

    /// Switch the core's power domain
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the power controller rejects the request.
    fn power_set(&self, core: u8, on: bool) -> Result<()>;

    /// Request a clock rate
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the write fails.
    fn clock_set_rate(&self, core: u8, khz: u32) -> Result<()> {
        self.write_register(core, regs::CLOCK_RATE, khz)
    }

    /// Gate (`false`) or ungate (`true`) the core clock
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if the write fails.
    fn clock_gate(&self, core: u8, running: bool) -> Result<()> {
        self.write_register(core, regs::CLOCK_GATE, u32::from(running))
    }

    /// One-time bring-up stream after reset
    ///
    /// # Errors
    ///
    /// Returns `NpuError::Io` if any write fails.
    fn submit_init_commands(&self, core: u8) -> Result<()> {
        self.write_register(core, regs::IRQ_CLEAR, irq::ALL)?;
        self.write_register(core, regs::CONTROL, control::ENABLE | control::IRQ_ENABLE)
    }

    /// Abort the running job on `core`
    ///
    /// # Errors
    ///
    /// `InvalidState` if the variant has no job-cancel register,
    /// `NpuError::Io` if the write fails.
    fn job_cancel(&self, core: u8) -> Result<()> {
        if !self.has_job_cancel() {
            return Err(NpuError::invalid_state(format!(
                "{} has no job-cancel register",
                self.variant()
            )));
        }
        self.write_register(core, regs::JOB_CANCEL, 1)
    }

    /// Hand the backend the line it raises on every job interrupt
    fn attach_irq(&self, line: IrqLine);
}

/// Per-core interrupt counters shared between the interrupt line and the wait daemon
#[derive(Debug)]
pub(crate) struct IrqCounters {
    pending: Box<[AtomicU32]>,
    total: Box<[AtomicU64]>,
}

impl IrqCounters {
    pub(crate) fn new(cores: u8) -> Self {
        Self {
            pending: (0..cores).map(|_| AtomicU32::new(0)).collect(),
            total: (0..cores).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Consume one pending interrupt, if any
    pub(crate) fn take(&self, core: u8) -> bool {
        self.pending[usize::from(core)]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self, core: u8) -> u32 {
        self.pending[usize::from(core)].load(Ordering::Acquire)
    }

    pub(crate) fn total(&self, core: u8) -> u64 {
        self.total[usize::from(core)].load(Ordering::Relaxed)
    }

    /// Drop interrupts latched before a reset
    pub(crate) fn clear(&self, core: u8) {
        self.pending[usize::from(core)].store(0, Ordering::Release);
    }
}

/// Interrupt line handed to the backend
///
/// Raising it bumps the core's counter and wakes the wait daemon.
#[derive(Debug, Clone)]
pub struct IrqLine {
    counters: Arc<IrqCounters>,
    tx: Sender<WaitMsg>,
}

impl IrqLine {
    pub(crate) fn new(counters: Arc<IrqCounters>, tx: Sender<WaitMsg>) -> Self {
        Self { counters, tx }
    }

    /// Report one job interrupt on `core`
    pub fn raise(&self, core: u8) {
        let Some(pending) = self.counters.pending.get(usize::from(core)) else {
            warn!("Interrupt on unknown core {core}");
            return;
        };
        pending.fetch_add(1, Ordering::AcqRel);
        self.counters.total[usize::from(core)].fetch_add(1, Ordering::Relaxed);
        trace!("IRQ core {core}");
        // Disconnected only during teardown.
        let _ = self.tx.send(WaitMsg::Irq(core));
    }
}

/// Shared handle to a backend with bounded register retries
#[derive(Debug, Clone)]
pub(crate) struct Hw {
    inner: Arc<dyn NpuHardware>,
    retries: u32,
}

impl Hw {
    pub(crate) fn new(inner: Arc<dyn NpuHardware>, retries: u32) -> Self {
        Self {
            inner,
            retries: retries.max(1),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<dyn NpuHardware> {
        &self.inner
    }

    /// Run `op` up to `retries` times while it fails with `Io`
    fn retry<T>(&self, core: u8, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last = None;
        for attempt in 1..=self.retries {
            match op() {
                Ok(v) => return Ok(v),
                Err(e @ NpuError::Io { .. }) => {
                    warn!("{what} on core {core} failed (attempt {attempt}/{}): {e}", self.retries);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(NpuError::io(
            core,
            format!(
                "{what} failed after {} attempts: {}",
                self.retries,
                last.map_or_else(String::new, |e| e.to_string())
            ),
        ))
    }

    pub(crate) fn read(&self, core: u8, offset: usize) -> Result<u32> {
        self.retry(core, "register read", || self.inner.read_register(core, offset))
    }

    pub(crate) fn write(&self, core: u8, offset: usize, value: u32) -> Result<()> {
        self.retry(core, "register write", || {
            self.inner.write_register(core, offset, value)
        })
    }

    pub(crate) fn reset(&self, core: u8) -> Result<()> {
        self.retry(core, "reset", || self.inner.reset_hardware(core))
    }

    pub(crate) fn trigger(&self, core: u8, addr: u64) -> Result<()> {
        self.retry(core, "trigger", || self.inner.trigger_hardware(core, addr))
    }

    pub(crate) fn wait_idle(&self, core: u8, timeout: Duration) -> Result<bool> {
        self.retry(core, "idle wait", || {
            self.inner
                .wait_hardware_idle(core, timeout, status::IDLE_PATTERN)
        })
    }

    pub(crate) fn power_set(&self, core: u8, on: bool) -> Result<()> {
        self.retry(core, "power switch", || self.inner.power_set(core, on))
    }

    pub(crate) fn clock_gate(&self, core: u8, running: bool) -> Result<()> {
        self.retry(core, "clock gate", || self.inner.clock_gate(core, running))
    }

    pub(crate) fn clock_set_rate(&self, core: u8, khz: u32) -> Result<()> {
        self.retry(core, "clock rate", || self.inner.clock_set_rate(core, khz))
    }

    pub(crate) fn init_commands(&self, core: u8) -> Result<()> {
        self.retry(core, "init stream", || self.inner.submit_init_commands(core))
    }

    pub(crate) fn job_cancel(&self, core: u8) -> Result<()> {
        self.retry(core, "job cancel", || self.inner.job_cancel(core))
    }

    pub(crate) fn has_job_cancel(&self) -> bool {
        self.inner.has_job_cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Register file that fails the first `flaky` accesses
    #[derive(Debug, Default)]
    struct FlakyRegs {
        regs: Mutex<HashMap<(u8, usize), u32>>,
        flaky: AtomicU32,
    }

    impl FlakyRegs {
        fn fail_next(&self) -> Result<()> {
            if self
                .flaky
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(NpuError::io(0, "bus error"))
            } else {
                Ok(())
            }
        }
    }

    impl NpuHardware for FlakyRegs {
        fn variant(&self) -> ChipVariant {
            ChipVariant::Duo
        }

        fn read_register(&self, core: u8, offset: usize) -> Result<u32> {
            self.fail_next()?;
            Ok(self.regs.lock().get(&(core, offset)).copied().unwrap_or(0))
        }

        fn write_register(&self, core: u8, offset: usize, value: u32) -> Result<()> {
            self.fail_next()?;
            self.regs.lock().insert((core, offset), value);
            Ok(())
        }

        fn power_set(&self, _core: u8, _on: bool) -> Result<()> {
            Ok(())
        }

        fn attach_irq(&self, _line: IrqLine) {}
    }

    #[test]
    fn retries_transient_io() {
        let dev = Arc::new(FlakyRegs::default());
        dev.flaky.store(2, Ordering::Release);
        let hw = Hw::new(dev.clone(), 3);
        hw.write(1, regs::CLOCK_RATE, 800).unwrap();
        assert_eq!(hw.read(1, regs::CLOCK_RATE).unwrap(), 800);
    }

    #[test]
    fn gives_up_after_bound() {
        let dev = Arc::new(FlakyRegs::default());
        dev.flaky.store(5, Ordering::Release);
        let hw = Hw::new(dev, 3);
        let err = hw.read(0, regs::STATUS).unwrap_err();
        assert!(matches!(err, NpuError::Io { core: 0, .. }));
    }

    #[test]
    fn default_trigger_writes_doorbell() {
        let dev = FlakyRegs::default();
        dev.trigger_hardware(1, 0x1_2345_6780).unwrap();
        let map = dev.regs.lock();
        assert_eq!(map[&(1, regs::WL_NEXT_LO)], 0x2345_6780);
        assert_eq!(map[&(1, regs::WL_NEXT_HI)], 1);
        assert_eq!(map[&(1, regs::WL_END)], 1);
    }

    #[test]
    fn idle_wait_times_out() {
        let dev = FlakyRegs::default();
        assert!(!dev
            .wait_hardware_idle(0, Duration::from_millis(1), status::IDLE_PATTERN)
            .unwrap());
        dev.write_register(0, regs::STATUS, status::IDLE).unwrap();
        assert!(dev
            .wait_hardware_idle(0, Duration::from_millis(1), status::IDLE_PATTERN)
            .unwrap());
    }

    #[test]
    fn job_cancel_requires_capability() {
        let dev = FlakyRegs::default();
        assert!(matches!(dev.job_cancel(0), Err(NpuError::InvalidState { .. })));
    }

    #[test]
    fn irq_counters_take_and_clear() {
        let counters = Arc::new(IrqCounters::new(2));
        let (tx, rx) = crossbeam::channel::unbounded();
        let line = IrqLine::new(counters.clone(), tx);
        line.raise(1);
        line.raise(1);
        assert_eq!(counters.pending(1), 2);
        assert!(counters.take(1));
        counters.clear(1);
        assert!(!counters.take(1));
        assert_eq!(counters.total(1), 2);
        assert_eq!(rx.len(), 2);
    }
}
