// SPDX-License-Identifier: AGPL-3.0-only

//! Per-core register map.
//!
//! Every core exposes an identical register block; block `n` starts at
//! `n * CORE_STRIDE` inside the device's register window. Offsets below are
//! relative to the start of a core block.
//!
//! ```text
//! 0x000  VERSION      product id (hi 16) / revision (lo 16)
//! 0x008  STATUS       idle / busy / done / cancel / fault bits
//! 0x010  CONTROL      reset, enable, wait-link loop, irq enable
//! 0x020  IRQ_STATUS   pending interrupt bits
//! 0x024  IRQ_CLEAR    write-1-to-clear
//! 0x100  WL_BASE_LO   wait-link table base (low 32 bits)
//! 0x104  WL_BASE_HI   wait-link table base (high 32 bits)
//! 0x108  WL_DEPTH     wait-link table entries
//! 0x10C  WL_END       producer cursor doorbell
//! 0x110  WL_START     consumer cursor readback
//! 0x114  WL_NEXT_LO   jump target of the entry being queued (low 32 bits)
//! 0x118  WL_NEXT_HI   jump target of the entry being queued (high 32 bits)
//! 0x120  DONE_TAG     tag of the last retired wait-link entry
//! 0x200  JOB_CANCEL   write 1 to abort the running job (if supported)
//! 0x300  CLOCK_GATE   1 = clock running
//! 0x304  CLOCK_RATE   requested rate in kHz
//! 0x308  POWER_CTRL   1 = power domain on
//! ```

/// Stride between per-core register blocks.
pub const CORE_STRIDE: usize = 0x1000;

/// Product id / revision register.
pub const VERSION: usize = 0x0000;

/// Main status register.
pub const STATUS: usize = 0x0008;

/// Control register.
pub const CONTROL: usize = 0x0010;

/// Interrupt status register.
pub const IRQ_STATUS: usize = 0x0020;
/// Interrupt clear register (write-1-to-clear).
pub const IRQ_CLEAR: usize = 0x0024;

/// Wait-link table base address (low 32 bits).
pub const WL_BASE_LO: usize = 0x0100;
/// Wait-link table base address (high 32 bits).
pub const WL_BASE_HI: usize = 0x0104;
/// Wait-link table depth in entries.
pub const WL_DEPTH: usize = 0x0108;
/// Producer cursor doorbell: writing wakes the core from its wait-link loop.
pub const WL_END: usize = 0x010C;
/// Consumer cursor as seen by the core.
pub const WL_START: usize = 0x0110;
/// Jump target for the next wait-link entry (low 32 bits), latched by `WL_END`.
pub const WL_NEXT_LO: usize = 0x0114;
/// Jump target for the next wait-link entry (high 32 bits).
pub const WL_NEXT_HI: usize = 0x0118;
/// Tag of the last wait-link entry the core retired.
pub const DONE_TAG: usize = 0x0120;

/// Job-cancel register. Only present when the variant reports job cancel.
pub const JOB_CANCEL: usize = 0x0200;

/// Clock gate register.
pub const CLOCK_GATE: usize = 0x0300;
/// Requested clock rate (kHz).
pub const CLOCK_RATE: usize = 0x0304;
/// Power domain switch.
pub const POWER_CTRL: usize = 0x0308;

/// Absolute offset of a per-core register inside the device window.
#[must_use]
pub const fn core_reg(core: u8, reg: usize) -> usize {
    (core as usize) * CORE_STRIDE + reg
}

// ── Status register bit definitions ──────────────────────────────────────────

pub mod status {
    //! `STATUS` bits.

    /// Core is idle (wait-link loop parked or stopped).
    pub const IDLE: u32 = 1 << 0;
    /// Core is executing a command stream.
    pub const BUSY: u32 = 1 << 1;
    /// Last job ran to completion.
    pub const DONE: u32 = 1 << 2;
    /// Last job was aborted through `JOB_CANCEL`.
    pub const CANCELED: u32 = 1 << 3;
    /// Bus error while fetching commands or data.
    pub const FAULT_BUS: u32 = 1 << 4;
    /// MMU translation fault.
    pub const FAULT_MMU: u32 = 1 << 5;
    /// Hardware watchdog expired.
    pub const FAULT_WATCHDOG: u32 = 1 << 6;

    /// Any fault bit.
    pub const FAULT_MASK: u32 = FAULT_BUS | FAULT_MMU | FAULT_WATCHDOG;

    /// Pattern a core must show after reset before it may be used.
    pub const IDLE_PATTERN: u32 = IDLE;
}

// ── Control register bit definitions ─────────────────────────────────────────

pub mod control {
    //! `CONTROL` bits.

    /// Soft reset (self-clearing).
    pub const RESET: u32 = 1 << 0;
    /// Enable the core.
    pub const ENABLE: u32 = 1 << 1;
    /// Run the continuous wait-link loop.
    pub const WL_LOOP: u32 = 1 << 2;
    /// Enable completion interrupts.
    pub const IRQ_ENABLE: u32 = 1 << 3;
}

// ── Interrupt bits ───────────────────────────────────────────────────────────

pub mod irq {
    //! `IRQ_STATUS` / `IRQ_CLEAR` bits.

    /// A job finished (successfully or not).
    pub const JOB_DONE: u32 = 1 << 0;
    /// A fault was latched into `STATUS`.
    pub const FAULT: u32 = 1 << 1;

    /// Every interrupt source.
    pub const ALL: u32 = JOB_DONE | FAULT;
}
