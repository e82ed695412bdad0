// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated NPU backend
//!
//! A register-level model of a multi-core part driven by one simulator
//! thread. Each core keeps a FIFO of queued wait-link entries and runs them
//! one at a time while it is powered, clocked and its wait-link loop is
//! enabled. A finished entry latches STATUS, raises the interrupt line and
//! holds the core until the driver acknowledges through `IRQ_CLEAR`.
//!
//! What each entry does is programmable per trigger address:
//!
//! | Behaviour | Effect |
//! |-----------|--------|
//! | `Complete(d)` | finishes `d` after it starts |
//! | `Manual` | finishes when the test calls [`SimulatedNpu::complete`] |
//! | `Hang` | never finishes; only reset or job cancel clears it |
//! | `Fault(bits)` | finishes immediately with fault bits and halts the core |
//!
//! No hardware is required, so this is the backend the CLI and the test
//! suite drive.

use crate::error::{NpuError, Result};
use crate::hardware::{IrqLine, NpuHardware};
use npu_chip::regs::{self, control, irq, status};
use npu_chip::variant::ChipVariant;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// What a queued entry does once it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobBehavior {
    /// Finish after the given run time
    Complete(Duration),
    /// Finish on [`SimulatedNpu::complete`]
    Manual,
    /// Never finish
    Hang,
    /// Finish immediately with these STATUS fault bits
    Fault(u32),
}

/// Observable side effects, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// Power domain switched
    Power(u8, bool),
    /// Core reset
    Reset(u8),
    /// Clock gate changed
    ClockGate(u8, bool),
    /// Clock rate requested (kHz)
    ClockRate(u8, u32),
    /// Entry queued at the given address
    Trigger(u8, u64),
    /// Entry started
    Started(u8, u64),
    /// Entry finished with the given STATUS bits
    Finished(u8, u64, u32),
    /// Job-cancel register written
    Cancel(u8),
}

#[derive(Debug)]
struct Job {
    addr: u64,
    behavior: JobBehavior,
    finish_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct CoreSim {
    powered: bool,
    clocked: bool,
    control: u32,
    status: u32,
    irq_status: u32,
    next_addr: u64,
    queue: VecDeque<Job>,
    running: Option<Job>,
    halted: bool,
    stuck_after_reset: bool,
    regs: HashMap<usize, u32>,
}

impl CoreSim {
    fn can_start(&self) -> bool {
        self.powered
            && self.clocked
            && self.control & control::WL_LOOP != 0
            && !self.halted
            && self.irq_status == 0
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.running = None;
        self.control = 0;
        self.irq_status = 0;
        self.halted = false;
        self.status = if self.stuck_after_reset {
            status::BUSY
        } else {
            status::IDLE
        };
    }
}

#[derive(Debug)]
struct SimState {
    cores: Vec<CoreSim>,
    behaviors: HashMap<u64, JobBehavior>,
    default_behavior: JobBehavior,
    events: Vec<SimEvent>,
    irq: Option<IrqLine>,
    fail_io: u32,
    shutdown: bool,
}

impl SimState {
    /// Retire the running entry on `core` with `bits`
    #[allow(clippy::cast_possible_truncation)]
    fn finish(&mut self, core: u8, bits: u32) {
        let c = &mut self.cores[usize::from(core)];
        let Some(job) = c.running.take() else {
            return;
        };
        c.status = status::IDLE | bits;
        if bits & status::FAULT_MASK != 0 {
            c.irq_status |= irq::FAULT;
            c.halted = true;
        } else {
            c.irq_status |= irq::JOB_DONE;
        }
        c.regs.insert(regs::DONE_TAG, job.addr as u32);
        self.events.push(SimEvent::Finished(core, job.addr, bits));
        trace!("sim core {core}: entry {:#x} finished ({bits:#x})", job.addr);
        if let Some(line) = &self.irq {
            line.raise(core);
        }
    }

    /// Advance one core; returns when it next needs attention
    fn advance(&mut self, core: u8, now: Instant) -> Option<Instant> {
        let idx = usize::from(core);

        if let Some(at) = self.cores[idx].running.as_ref().and_then(|j| j.finish_at) {
            if at > now {
                return Some(at);
            }
            self.finish(core, status::DONE);
        }

        if self.cores[idx].running.is_some() || !self.cores[idx].can_start() {
            return None;
        }
        let mut job = self.cores[idx].queue.pop_front()?;
        self.events.push(SimEvent::Started(core, job.addr));
        self.cores[idx].status = status::BUSY;
        let behavior = job.behavior;
        if let JobBehavior::Complete(d) = behavior {
            job.finish_at = Some(now + d);
        }
        self.cores[idx].running = Some(job);

        match behavior {
            JobBehavior::Complete(d) if d.is_zero() => {
                self.finish(core, status::DONE);
                None
            }
            JobBehavior::Complete(d) => Some(now + d),
            JobBehavior::Fault(bits) => {
                self.finish(core, bits & status::FAULT_MASK);
                None
            }
            JobBehavior::Manual | JobBehavior::Hang => None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SimState>,
    cond: Condvar,
}

fn run(shared: &Shared) {
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            break;
        }
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        let count = u8::try_from(st.cores.len()).unwrap_or(u8::MAX);
        for core in 0..count {
            if let Some(at) = st.advance(core, now) {
                next = Some(next.map_or(at, |n| n.min(at)));
            }
        }
        match next {
            Some(at) => {
                shared.cond.wait_until(&mut st, at);
            }
            None => shared.cond.wait(&mut st),
        }
    }
}

/// Simulated multi-core NPU
#[derive(Debug)]
pub struct SimulatedNpu {
    variant: ChipVariant,
    cores: u8,
    job_cancel: AtomicBool,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedNpu {
    /// Device with `cores` cores; entries complete after 1 ms by default
    pub fn new(cores: u8) -> Self {
        let variant = ChipVariant::with_cores(cores).unwrap_or(ChipVariant::Unknown(0));
        let shared = Arc::new(Shared {
            state: Mutex::new(SimState {
                cores: (0..cores).map(|_| CoreSim::default()).collect(),
                behaviors: HashMap::new(),
                default_behavior: JobBehavior::Complete(Duration::from_millis(1)),
                events: Vec::new(),
                irq: None,
                fail_io: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("npu-sim".into())
            .spawn(move || run(&worker))
            .map_err(|e| error!("Cannot spawn simulator thread: {e}"))
            .ok();
        debug!("Simulated {variant} with {cores} cores");
        Self {
            variant,
            cores,
            job_cancel: AtomicBool::new(variant.has_job_cancel()),
            shared,
            thread,
        }
    }

    /// Override the variant's job-cancel capability
    #[must_use]
    pub fn with_job_cancel(self, supported: bool) -> Self {
        self.job_cancel.store(supported, Ordering::Release);
        self
    }

    /// Behaviour for entries without a per-address override
    #[must_use]
    pub fn with_default_behavior(self, behavior: JobBehavior) -> Self {
        self.shared.state.lock().default_behavior = behavior;
        self
    }

    /// Behaviour for entries triggered at `addr`
    pub fn set_behavior(&self, addr: u64, behavior: JobBehavior) {
        self.shared.state.lock().behaviors.insert(addr, behavior);
    }

    /// Finish the running `Manual` entry on `core`. Returns false if none is running.
    pub fn complete(&self, core: u8) -> bool {
        let mut st = self.shared.state.lock();
        let manual = st
            .cores
            .get(usize::from(core))
            .and_then(|c| c.running.as_ref())
            .is_some_and(|j| j.behavior == JobBehavior::Manual);
        if manual {
            st.finish(core, status::DONE);
            self.shared.cond.notify_all();
        }
        manual
    }

    /// Make `core` report busy forever after its next reset
    pub fn stick_after_reset(&self, core: u8, stuck: bool) {
        if let Some(c) = self.shared.state.lock().cores.get_mut(usize::from(core)) {
            c.stuck_after_reset = stuck;
        }
    }

    /// Fail the next `count` register accesses with `NpuError::Io`
    pub fn fail_register_io(&self, count: u32) {
        self.shared.state.lock().fail_io = count;
    }

    /// Side effects observed so far
    pub fn events(&self) -> Vec<SimEvent> {
        self.shared.state.lock().events.clone()
    }

    /// Entries queued or running on `core`
    pub fn pending_jobs(&self, core: u8) -> usize {
        self.shared
            .state
            .lock()
            .cores
            .get(usize::from(core))
            .map_or(0, |c| c.queue.len() + usize::from(c.running.is_some()))
    }

    /// Address of the entry running on `core`
    pub fn running_addr(&self, core: u8) -> Option<u64> {
        self.shared
            .state
            .lock()
            .cores
            .get(usize::from(core))
            .and_then(|c| c.running.as_ref().map(|j| j.addr))
    }

    /// Power domain of `core` is on
    pub fn is_powered(&self, core: u8) -> bool {
        self.shared.state.lock().cores.get(usize::from(core)).is_some_and(|c| c.powered)
    }

    /// Clock of `core` is running
    pub fn is_clocked(&self, core: u8) -> bool {
        self.shared.state.lock().cores.get(usize::from(core)).is_some_and(|c| c.clocked)
    }

    fn access(st: &mut SimState, core: u8) -> Result<()> {
        if usize::from(core) >= st.cores.len() {
            return Err(NpuError::io(core, "no such core"));
        }
        if st.fail_io > 0 {
            st.fail_io -= 1;
            return Err(NpuError::io(core, "injected bus error"));
        }
        Ok(())
    }
}

impl NpuHardware for SimulatedNpu {
    fn variant(&self) -> ChipVariant {
        self.variant
    }

    fn core_count(&self) -> u8 {
        self.cores
    }

    fn has_job_cancel(&self) -> bool {
        self.job_cancel.load(Ordering::Acquire)
    }

    fn read_register(&self, core: u8, offset: usize) -> Result<u32> {
        let mut st = self.shared.state.lock();
        Self::access(&mut st, core)?;
        let c = &st.cores[usize::from(core)];
        Ok(match offset {
            regs::VERSION => self.variant.version_word(1),
            regs::STATUS => c.status,
            regs::CONTROL => c.control,
            regs::IRQ_STATUS => c.irq_status,
            regs::CLOCK_GATE => u32::from(c.clocked),
            other => c.regs.get(&other).copied().unwrap_or(0),
        })
    }

    fn write_register(&self, core: u8, offset: usize, value: u32) -> Result<()> {
        let mut st = self.shared.state.lock();
        Self::access(&mut st, core)?;
        let idx = usize::from(core);
        match offset {
            regs::CONTROL if value & control::RESET != 0 => {
                st.cores[idx].reset();
                st.events.push(SimEvent::Reset(core));
            }
            regs::CONTROL => st.cores[idx].control = value,
            regs::IRQ_CLEAR => st.cores[idx].irq_status &= !value,
            regs::CLOCK_GATE => {
                st.cores[idx].clocked = value != 0;
                st.events.push(SimEvent::ClockGate(core, value != 0));
            }
            regs::CLOCK_RATE => {
                st.cores[idx].regs.insert(offset, value);
                st.events.push(SimEvent::ClockRate(core, value));
            }
            regs::WL_NEXT_LO => {
                let c = &mut st.cores[idx];
                c.next_addr = (c.next_addr & !0xffff_ffff) | u64::from(value);
            }
            regs::WL_NEXT_HI => {
                let c = &mut st.cores[idx];
                c.next_addr = (c.next_addr & 0xffff_ffff) | (u64::from(value) << 32);
            }
            regs::WL_END => {
                let addr = st.cores[idx].next_addr;
                let behavior = st
                    .behaviors
                    .get(&addr)
                    .copied()
                    .unwrap_or(st.default_behavior);
                st.cores[idx].queue.push_back(Job {
                    addr,
                    behavior,
                    finish_at: None,
                });
                st.events.push(SimEvent::Trigger(core, addr));
            }
            regs::JOB_CANCEL => {
                if !self.has_job_cancel() {
                    return Err(NpuError::io(core, "job cancel not implemented"));
                }
                st.events.push(SimEvent::Cancel(core));
                if st.cores[idx].running.is_some() {
                    st.finish(core, status::CANCELED);
                }
            }
            other => {
                st.cores[idx].regs.insert(other, value);
            }
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn power_set(&self, core: u8, on: bool) -> Result<()> {
        let mut st = self.shared.state.lock();
        let Some(c) = st.cores.get_mut(usize::from(core)) else {
            return Err(NpuError::io(core, "no such core"));
        };
        c.powered = on;
        if !on {
            c.reset();
            c.clocked = false;
            c.status = 0;
        }
        st.events.push(SimEvent::Power(core, on));
        self.shared.cond.notify_all();
        Ok(())
    }

    fn attach_irq(&self, line: IrqLine) {
        self.shared.state.lock().irq = Some(line);
    }
}

impl Drop for SimulatedNpu {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
