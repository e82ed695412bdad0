// SPDX-License-Identifier: AGPL-3.0-only

//! Register-window backend
//!
//! Maps the device's register window from a UIO-style character device
//! (`/dev/uioN`) and drives the cores through volatile 32-bit accesses.
//!
//! Interrupts follow the UIO contract: a 4-byte read blocks until the next
//! interrupt and returns the running count, a 4-byte write of `1` re-arms the
//! line. One listener thread waits on the node and converts each advance of
//! a core's `WL_START` consumer cursor into one [`IrqLine::raise`], so the
//! driver sees exactly one event per retired wait-link entry.

use crate::error::{NpuError, Result};
use crate::hardware::{IrqLine, NpuHardware};
use npu_chip::regs::{self, CORE_STRIDE};
use npu_chip::variant::ChipVariant;
use parking_lot::Mutex;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Listener wake-up interval, bounds how long drop waits for the thread
const LISTEN_POLL_MS: i32 = 100;

/// Mapped register window
#[derive(Debug)]
struct RegisterWindow {
    ptr: NonNull<u8>,
    size: usize,
    file: File,
    writes: Mutex<()>,
}

impl RegisterWindow {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| NpuError::io(0, format!("cannot open {}: {e}", path.display())))?;

        let size = map_size(path).unwrap_or(CORE_STRIDE);
        if size == 0 {
            return Err(NpuError::io(0, format!("{} exposes an empty map", path.display())));
        }

        // SAFETY: mmap preconditions:
        // - file is a freshly opened read/write descriptor kept alive in Self
        // - size is non-zero
        // - MAP_SHARED with READ|WRITE is required for device registers
        // - offset 0 selects UIO map 0, the register window
        // The mapping is released in Drop with the same length.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| NpuError::io(0, format!("mmap of {} failed: {e}", path.display())))?;
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| NpuError::io(0, "mmap returned a null mapping"))?;

        debug!("Mapped {} ({size:#x} bytes at {ptr:p})", path.display());
        Ok(Self {
            ptr,
            size,
            file,
            writes: Mutex::new(()),
        })
    }

    fn check(&self, core: u8, offset: usize) -> Result<usize> {
        let abs = regs::core_reg(core, offset);
        if offset + 4 > CORE_STRIDE || abs + 4 > self.size {
            return Err(NpuError::io(
                core,
                format!("register {offset:#x} outside window of {:#x} bytes", self.size),
            ));
        }
        Ok(abs)
    }

    fn read(&self, core: u8, offset: usize) -> Result<u32> {
        let abs = self.check(core, offset)?;
        // SAFETY: abs + 4 <= size (checked above), ptr comes from a live
        // mapping, and every register is 4-byte aligned inside its block.
        // Volatile keeps the access from being merged or elided.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(abs).cast::<u32>().read_volatile() };
        trace!("core {core} read {offset:#x} = {value:#x}");
        Ok(value)
    }

    fn write(&self, core: u8, offset: usize, value: u32) -> Result<()> {
        let abs = self.check(core, offset)?;
        trace!("core {core} write {offset:#x} = {value:#x}");
        let _serial = self.writes.lock();
        // SAFETY: as in `read`; writers are serialised by `writes`.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(abs).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }
}

impl Drop for RegisterWindow {
    fn drop(&mut self) {
        // SAFETY: ptr and size are exactly what mmap returned and was given;
        // no reference into the mapping outlives self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            warn!("munmap failed: {e}");
        }
    }
}

// SAFETY: the mapping is valid from any thread, all accesses are
// bounds-checked volatile operations and writes are serialised.
unsafe impl Send for RegisterWindow {}
// SAFETY: see Send; no unsynchronised interior state besides the registers.
unsafe impl Sync for RegisterWindow {}

/// Size of UIO map 0 from sysfs, if the node is a UIO device
fn map_size(node: &Path) -> Option<usize> {
    let name = node.file_name()?.to_str()?;
    let text = std::fs::read_to_string(format!("/sys/class/uio/{name}/maps/map0/size")).ok()?;
    usize::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
}

/// NPU reached through a mapped register window
#[derive(Debug)]
pub struct MmioNpu {
    window: Arc<RegisterWindow>,
    variant: ChipVariant,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MmioNpu {
    /// Map `node` and identify the part from core 0's VERSION register
    ///
    /// # Errors
    ///
    /// `Io` if the node cannot be opened or mapped, `InvalidArgument` if
    /// VERSION does not name a known product.
    pub fn open(node: impl AsRef<Path>) -> Result<Self> {
        let node = node.as_ref();
        let window = RegisterWindow::open(node)?;
        let version = window.read(0, regs::VERSION)?;
        let variant = ChipVariant::from_version(version);
        if let ChipVariant::Unknown(id) = variant {
            return Err(NpuError::invalid_argument(format!(
                "{} reports unknown product {id:#06x}",
                node.display()
            )));
        }
        if window.size < usize::from(variant.core_count()) * CORE_STRIDE {
            return Err(NpuError::invalid_argument(format!(
                "{variant} needs {} register blocks, window holds {:#x} bytes",
                variant.core_count(),
                window.size
            )));
        }
        info!("Opened {variant} at {}", node.display());
        Ok(Self {
            window: Arc::new(window),
            variant,
            stop: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        })
    }
}

impl NpuHardware for MmioNpu {
    fn variant(&self) -> ChipVariant {
        self.variant
    }

    fn read_register(&self, core: u8, offset: usize) -> Result<u32> {
        self.window.read(core, offset)
    }

    fn write_register(&self, core: u8, offset: usize, value: u32) -> Result<()> {
        self.window.write(core, offset, value)
    }

    fn power_set(&self, core: u8, on: bool) -> Result<()> {
        self.window.write(core, regs::POWER_CTRL, u32::from(on))
    }

    fn attach_irq(&self, line: IrqLine) {
        let window = Arc::clone(&self.window);
        let stop = Arc::clone(&self.stop);
        let cores = self.variant.core_count();
        let spawned = std::thread::Builder::new()
            .name("npu-irq".into())
            .spawn(move || listen(&window, &line, cores, &stop));
        match spawned {
            Ok(handle) => {
                if let Some(old) = self.listener.lock().replace(handle) {
                    warn!("Interrupt line re-attached; previous listener left running");
                    drop(old);
                }
            }
            Err(e) => warn!("Cannot start interrupt listener: {e}"),
        }
    }
}

impl Drop for MmioNpu {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Interrupt listener loop
fn listen(window: &RegisterWindow, line: &IrqLine, cores: u8, stop: &AtomicBool) {
    let mut cursors: Vec<u32> = (0..cores)
        .map(|c| window.read(c, regs::WL_START).unwrap_or(0))
        .collect();
    let fd = window.file.as_fd();
    let rearm = 1u32.to_ne_bytes();

    while !stop.load(Ordering::Acquire) {
        if let Err(e) = rustix::io::write(fd, &rearm) {
            warn!("Cannot re-arm interrupt: {e}");
            return;
        }
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        match poll(&mut fds, LISTEN_POLL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                warn!("Interrupt poll failed: {e}");
                return;
            }
        }
        let mut count = [0u8; 4];
        if let Err(e) = rustix::io::read(fd, &mut count) {
            warn!("Interrupt read failed: {e}");
            return;
        }
        trace!("irq #{}", u32::from_ne_bytes(count));

        for (core, seen) in (0..cores).zip(cursors.iter_mut()) {
            let Ok(now) = window.read(core, regs::WL_START) else {
                continue;
            };
            for _ in 0..now.wrapping_sub(*seen) {
                line.raise(core);
            }
            *seen = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_is_io_error() {
        let err = MmioNpu::open("/dev/does-not-exist-uio").unwrap_err();
        assert!(matches!(err, NpuError::Io { .. }));
    }

    #[test]
    #[ignore] // Requires hardware
    fn identifies_part() {
        let npu = MmioNpu::open("/dev/uio0").unwrap();
        assert!(!matches!(npu.variant(), ChipVariant::Unknown(_)));
        let status = npu.read_register(0, regs::STATUS).unwrap();
        assert_ne!(status, u32::MAX);
    }

    #[test]
    #[ignore] // Requires hardware
    fn out_of_window_access_rejected() {
        let npu = MmioNpu::open("/dev/uio0").unwrap();
        assert!(npu.read_register(0, CORE_STRIDE).is_err());
    }
}
