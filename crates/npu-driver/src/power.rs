// SPDX-License-Identifier: AGPL-3.0-only

//! Per-unit power state machine
//!
//! ```text
//!            on                clock_on / run             run
//!   OFF ───────────▶ IDLE ─────────────────────▶ READY ──────────▶ RUN
//!    ▲                │ ▲                          │ ▲               │
//!    └──── off ───────┘ └──── timeout / off ───────┘ └───── end ─────┘
//! ```
//!
//! `suspend` is an overlay on any powered state: the unit keeps its state,
//! stops its clock and ignores everything except `resume`, which restores
//! the clock and loop configuration of the state it was suspended in.
//!
//! Events are delivered with [`PowerUnit::send_event`] under a recursive
//! lock, because a transition may imply a follow-up event (`run` from IDLE
//! passes through READY first, `off` from READY continues to OFF).

use crate::error::{NpuError, Result};
use crate::hardware::Hw;
use npu_chip::regs::{self, control};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Clock rate requested when nothing else was asked for
pub const DEFAULT_CLOCK_KHZ: u32 = 800_000;

/// How long a freshly reset core may take to report the idle pattern
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Power state of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// Power domain off
    Off,
    /// Powered, clock gated
    Idle,
    /// Clock running, wait-link loop stopped
    Ready,
    /// Clock running, wait-link loop running
    Run,
}

impl PowerState {
    /// Power domain is on
    pub const fn is_on(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Clock is running
    pub const fn is_clocked(self) -> bool {
        matches!(self, Self::Ready | Self::Run)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::Idle => write!(f, "IDLE"),
            Self::Ready => write!(f, "READY"),
            Self::Run => write!(f, "RUN"),
        }
    }
}

/// Power events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// Power up (OFF → IDLE)
    On,
    /// Power down one step (READY → IDLE → OFF); ignored while forced on
    Off,
    /// Start the clock (IDLE → READY)
    ClockOn,
    /// Start the wait-link loop (→ RUN)
    Run,
    /// Wait-link table drained (RUN → READY)
    End,
    /// Idle grace period expired (READY → IDLE)
    Timeout,
    /// System suspend overlay
    Suspend,
    /// Leave the suspend overlay
    Resume,
    /// Request a clock rate in kHz
    SetFrequency(u32),
    /// Power up and pin on
    ForceOn,
    /// Unpin and power down
    ForceOff,
    /// Allow the software timers to step the unit down
    TimerEnable,
    /// Stop the software timers
    TimerDisable,
}

/// Grace periods and policy for one unit
#[derive(Debug, Clone, Copy)]
pub(crate) struct PowerPolicy {
    pub idle_timeout: Duration,
    pub power_off_timeout: Duration,
    pub disable_clock_suspend: bool,
}

#[derive(Debug)]
struct PowerRecord {
    state: PowerState,
    suspended: bool,
    force_on: bool,
    freq_khz: u32,
    timer_enabled: bool,
    timer: Option<(Instant, PowerEvent)>,
}

/// Legal target for `event` in `state`, plus any implied follow-up event
const fn transition(
    state: PowerState,
    event: PowerEvent,
    force_on: bool,
) -> Option<(PowerState, Option<PowerEvent>)> {
    use PowerEvent as E;
    use PowerState as S;
    match (state, event) {
        (S::Off, E::On | E::ForceOn) => Some((S::Idle, None)),
        (S::Idle, E::ClockOn) => Some((S::Ready, None)),
        (S::Idle, E::Run) => Some((S::Ready, Some(E::Run))),
        (S::Ready, E::Run) => Some((S::Run, None)),
        (S::Run, E::End) => Some((S::Ready, None)),
        (S::Ready, E::Timeout) => Some((S::Idle, None)),
        (S::Ready, E::Off) if !force_on => Some((S::Idle, Some(E::Off))),
        (S::Ready, E::ForceOff) => Some((S::Idle, Some(E::ForceOff))),
        (S::Idle, E::Off) if !force_on => Some((S::Off, None)),
        (S::Idle, E::ForceOff) => Some((S::Off, None)),
        _ => None,
    }
}

/// Exclusive hold on a unit's power record
///
/// Events sent by the holder still go through (the lock is recursive);
/// everyone else waits until the hold is dropped.
pub(crate) struct PowerHold<'a>(#[allow(dead_code)] ReentrantMutexGuard<'a, RefCell<PowerRecord>>);

/// Power state record and actions for one core
pub(crate) struct PowerUnit {
    core: u8,
    hw: Hw,
    policy: PowerPolicy,
    record: ReentrantMutex<RefCell<PowerRecord>>,
}

impl fmt::Debug for PowerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerUnit")
            .field("core", &self.core)
            .field("state", &self.state())
            .field("suspended", &self.is_suspended())
            .finish_non_exhaustive()
    }
}

impl PowerUnit {
    pub(crate) fn new(core: u8, hw: Hw, policy: PowerPolicy) -> Self {
        Self {
            core,
            hw,
            policy,
            record: ReentrantMutex::new(RefCell::new(PowerRecord {
                state: PowerState::Off,
                suspended: false,
                force_on: false,
                freq_khz: DEFAULT_CLOCK_KHZ,
                timer_enabled: true,
                timer: None,
            })),
        }
    }

    /// Keep other threads from changing this unit's power state
    pub(crate) fn hold(&self) -> PowerHold<'_> {
        PowerHold(self.record.lock())
    }

    pub(crate) fn state(&self) -> PowerState {
        self.record.lock().borrow().state
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.record.lock().borrow().suspended
    }

    pub(crate) fn freq_khz(&self) -> u32 {
        self.record.lock().borrow().freq_khz
    }

    /// Soonest armed timer
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.record.lock().borrow().timer.map(|(at, _)| at)
    }

    /// Deliver `event`; returns the state the unit ends in
    pub(crate) fn send_event(&self, event: PowerEvent) -> Result<PowerState> {
        let guard = self.record.lock();

        let (from, target) = {
            let mut rec = guard.borrow_mut();
            match event {
                PowerEvent::SetFrequency(khz) => rec.freq_khz = khz,
                PowerEvent::ForceOn => rec.force_on = true,
                PowerEvent::ForceOff => rec.force_on = false,
                PowerEvent::TimerEnable => rec.timer_enabled = true,
                PowerEvent::TimerDisable => {
                    rec.timer_enabled = false;
                    rec.timer = None;
                }
                _ => {}
            }

            if rec.suspended {
                if event != PowerEvent::Resume {
                    trace!("core {}: {event:?} ignored while suspended", self.core);
                    return Ok(rec.state);
                }
                (rec.state, None)
            } else {
                if event == PowerEvent::Suspend && !rec.state.is_on() {
                    return Ok(rec.state);
                }
                (rec.state, transition(rec.state, event, rec.force_on))
            }
        };

        match event {
            PowerEvent::Suspend => {
                self.enter_suspend(from)?;
                let mut rec = guard.borrow_mut();
                rec.suspended = true;
                rec.timer = None;
                return Ok(from);
            }
            PowerEvent::Resume if guard.borrow().suspended => {
                self.leave_suspend(from)?;
                let mut rec = guard.borrow_mut();
                rec.suspended = false;
                self.arm_timer(&mut rec);
                return Ok(from);
            }
            PowerEvent::SetFrequency(khz) if from.is_clocked() => {
                self.hw.clock_set_rate(self.core, khz)?;
            }
            _ => {}
        }

        let Some((to, follow_up)) = target else {
            return Ok(from);
        };

        self.run_actions(from, to)?;
        {
            let mut rec = guard.borrow_mut();
            rec.state = to;
            self.arm_timer(&mut rec);
        }
        trace!("core {}: {from} --{event:?}--> {to}", self.core);

        match follow_up {
            Some(next) => self.send_event(next),
            None => Ok(to),
        }
    }

    /// Fire the armed timer if it is due
    pub(crate) fn poll_timer(&self, now: Instant) -> Result<Option<PowerEvent>> {
        let guard = self.record.lock();
        let due = {
            let mut rec = guard.borrow_mut();
            match rec.timer {
                Some((at, event)) if at <= now => {
                    rec.timer = None;
                    Some(event)
                }
                _ => None,
            }
        };
        if let Some(event) = due {
            self.send_event(event)?;
        }
        Ok(due)
    }

    /// Bring a unit back after recovery
    ///
    /// Without `full_cycle` the core is reset in place; with it the power
    /// domain is cycled. Either way the wait-link loop is left stopped and the
    /// unit ends in READY if it had a clock, IDLE otherwise.
    pub(crate) fn reinit(&self, full_cycle: bool) -> Result<PowerState> {
        let guard = self.record.lock();
        let (was, freq) = {
            let rec = guard.borrow();
            (rec.state, rec.freq_khz)
        };
        if !was.is_on() {
            return Ok(was);
        }

        if full_cycle {
            self.hw.power_set(self.core, false)?;
            guard.borrow_mut().state = PowerState::Off;
            self.send_event(PowerEvent::On)?;
            if was.is_clocked() {
                self.send_event(PowerEvent::ClockOn)?;
            }
        } else {
            self.bring_up()?;
            if was.is_clocked() {
                self.hw.clock_gate(self.core, true)?;
                self.hw.clock_set_rate(self.core, freq)?;
            }
            let mut rec = guard.borrow_mut();
            rec.state = if was == PowerState::Run {
                PowerState::Ready
            } else {
                was
            };
            self.arm_timer(&mut rec);
        }

        let state = self.state();
        let how = if full_cycle { "power cycle" } else { "reset" };
        debug!("core {}: reinitialised by {how}, now {state}", self.core);
        Ok(state)
    }

    /// Step down to OFF regardless of pins and timers
    pub(crate) fn power_down(&self) -> Result<()> {
        let _guard = self.record.lock();
        if self.is_suspended() {
            self.send_event(PowerEvent::Resume)?;
        }
        if self.state() == PowerState::Run {
            self.send_event(PowerEvent::End)?;
        }
        self.send_event(PowerEvent::ForceOff)?;
        Ok(())
    }

    fn bring_up(&self) -> Result<()> {
        self.hw.reset(self.core)?;
        if !self.hw.wait_idle(self.core, RESET_SETTLE)? {
            return Err(NpuError::io(
                self.core,
                "core did not reach the idle pattern after reset",
            ));
        }
        self.hw.init_commands(self.core)
    }

    fn run_actions(&self, from: PowerState, to: PowerState) -> Result<()> {
        use PowerState as S;
        match (from, to) {
            (S::Off, S::Idle) => {
                self.hw.power_set(self.core, true)?;
                if let Err(e) = self.bring_up() {
                    let _ = self.hw.power_set(self.core, false);
                    return Err(e);
                }
                Ok(())
            }
            (S::Idle, S::Ready) => {
                self.hw.clock_gate(self.core, true)?;
                self.hw.clock_set_rate(self.core, self.freq_khz())
            }
            (S::Ready, S::Run) => self.hw.write(
                self.core,
                regs::CONTROL,
                control::ENABLE | control::WL_LOOP | control::IRQ_ENABLE,
            ),
            (S::Run, S::Ready) => {
                self.hw
                    .write(self.core, regs::CONTROL, control::ENABLE | control::IRQ_ENABLE)
            }
            (S::Ready, S::Idle) => self.hw.clock_gate(self.core, false),
            (S::Idle, S::Off) => self.hw.power_set(self.core, false),
            _ => Ok(()),
        }
    }

    fn enter_suspend(&self, state: PowerState) -> Result<()> {
        if state == PowerState::Run {
            self.run_actions(PowerState::Run, PowerState::Ready)?;
        }
        if state.is_clocked() {
            self.hw.clock_gate(self.core, false)?;
        }
        Ok(())
    }

    fn leave_suspend(&self, state: PowerState) -> Result<()> {
        if state.is_clocked() {
            self.hw.clock_gate(self.core, true)?;
            self.hw.clock_set_rate(self.core, self.freq_khz())?;
        }
        if state == PowerState::Run {
            self.run_actions(PowerState::Ready, PowerState::Run)?;
        }
        Ok(())
    }

    fn arm_timer(&self, rec: &mut PowerRecord) {
        rec.timer = None;
        if !rec.timer_enabled || rec.suspended {
            return;
        }
        let now = Instant::now();
        match rec.state {
            PowerState::Ready if !self.policy.disable_clock_suspend => {
                rec.timer = Some((now + self.policy.idle_timeout, PowerEvent::Timeout));
            }
            PowerState::Idle if !rec.force_on => {
                rec.timer = Some((now + self.policy.power_off_timeout, PowerEvent::Off));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::{SimEvent, SimulatedNpu};
    use std::sync::Arc;

    const POLICY: PowerPolicy = PowerPolicy {
        idle_timeout: Duration::from_millis(30),
        power_off_timeout: Duration::from_millis(50),
        disable_clock_suspend: false,
    };

    fn unit(policy: PowerPolicy) -> (Arc<SimulatedNpu>, PowerUnit) {
        let sim = Arc::new(SimulatedNpu::new(1));
        let hw = Hw::new(sim.clone(), 3);
        (sim, PowerUnit::new(0, hw, policy))
    }

    #[test]
    fn table_rejects_illegal_moves() {
        assert_eq!(transition(PowerState::Off, PowerEvent::Run, false), None);
        assert_eq!(transition(PowerState::Run, PowerEvent::Off, false), None);
        assert_eq!(transition(PowerState::Idle, PowerEvent::Off, true), None);
        assert_eq!(
            transition(PowerState::Idle, PowerEvent::ForceOff, true),
            Some((PowerState::Off, None))
        );
    }

    #[test]
    fn on_run_end_then_idle_timeout() {
        let (_sim, u) = unit(POLICY);
        assert_eq!(u.send_event(PowerEvent::On).unwrap(), PowerState::Idle);
        assert_eq!(u.send_event(PowerEvent::Run).unwrap(), PowerState::Run);
        assert!(u.next_deadline().is_none());
        assert_eq!(u.send_event(PowerEvent::End).unwrap(), PowerState::Ready);

        let deadline = u.next_deadline().unwrap();
        assert_eq!(u.poll_timer(deadline - Duration::from_millis(1)).unwrap(), None);
        assert_eq!(u.poll_timer(deadline).unwrap(), Some(PowerEvent::Timeout));
        assert_eq!(u.state(), PowerState::Idle);

        let deadline = u.next_deadline().unwrap();
        assert_eq!(u.poll_timer(deadline).unwrap(), Some(PowerEvent::Off));
        assert_eq!(u.state(), PowerState::Off);
    }

    #[test]
    fn clock_suspend_disabled_stays_ready() {
        let (_sim, u) = unit(PowerPolicy {
            disable_clock_suspend: true,
            ..POLICY
        });
        u.send_event(PowerEvent::On).unwrap();
        u.send_event(PowerEvent::Run).unwrap();
        u.send_event(PowerEvent::End).unwrap();
        assert!(u.next_deadline().is_none());
        assert_eq!(u.state(), PowerState::Ready);
    }

    #[test]
    fn off_from_ready_steps_to_off() {
        let (sim, u) = unit(POLICY);
        u.send_event(PowerEvent::On).unwrap();
        u.send_event(PowerEvent::ClockOn).unwrap();
        assert_eq!(u.send_event(PowerEvent::Off).unwrap(), PowerState::Off);
        assert!(!sim.is_powered(0));
    }

    #[test]
    fn force_on_pins_idle() {
        let (_sim, u) = unit(POLICY);
        u.send_event(PowerEvent::ForceOn).unwrap();
        assert_eq!(u.send_event(PowerEvent::Off).unwrap(), PowerState::Idle);
        assert!(u.next_deadline().is_none());
        assert_eq!(u.send_event(PowerEvent::ForceOff).unwrap(), PowerState::Off);
    }

    #[test]
    fn suspend_overlay_restores_run() {
        let (sim, u) = unit(POLICY);
        u.send_event(PowerEvent::On).unwrap();
        u.send_event(PowerEvent::Run).unwrap();
        u.send_event(PowerEvent::Suspend).unwrap();
        assert!(u.is_suspended());
        assert!(!sim.is_clocked(0));
        assert_eq!(u.send_event(PowerEvent::End).unwrap(), PowerState::Run);
        u.send_event(PowerEvent::Resume).unwrap();
        assert!(!u.is_suspended());
        assert!(sim.is_clocked(0));
        assert_eq!(u.state(), PowerState::Run);
    }

    #[test]
    fn frequency_applies_when_clocked() {
        let (sim, u) = unit(POLICY);
        u.send_event(PowerEvent::On).unwrap();
        u.send_event(PowerEvent::SetFrequency(400_000)).unwrap();
        assert!(!sim.events().contains(&SimEvent::ClockRate(0, 400_000)));
        u.send_event(PowerEvent::ClockOn).unwrap();
        assert!(sim.events().contains(&SimEvent::ClockRate(0, 400_000)));
    }

    #[test]
    fn stuck_core_fails_power_on() {
        let (sim, u) = unit(POLICY);
        sim.stick_after_reset(0, true);
        assert!(matches!(u.send_event(PowerEvent::On), Err(NpuError::Io { core: 0, .. })));
        assert_eq!(u.state(), PowerState::Off);
    }

    #[test]
    fn reinit_leaves_loop_stopped() {
        let (_sim, u) = unit(POLICY);
        u.send_event(PowerEvent::On).unwrap();
        u.send_event(PowerEvent::Run).unwrap();
        assert_eq!(u.reinit(false).unwrap(), PowerState::Ready);
        u.send_event(PowerEvent::Run).unwrap();
        assert_eq!(u.reinit(true).unwrap(), PowerState::Ready);
    }
}
