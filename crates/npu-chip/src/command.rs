// SPDX-License-Identifier: AGPL-3.0-only

//! Command-buffer format.
//!
//! A task's command buffer is split into ordered subtasks. Each subtask is a
//! list of fixed-size (16-byte) commands that the core fetches from
//! `base_addr`. Only the commands that name cores matter to the driver core:
//!
//! | Command | Meaning | Patched on reschedule? |
//! |---------|---------|-----------------------|
//! | `CoreEnable` | cores that take part in this subtask | yes |
//! | `Barrier` | cross-core synchronisation point | yes |
//! | `EnableIrq` | raise the completion interrupt on one core | re-appended |
//! | `Exec` | run a layer block | no |
//!
//! ## Encoding
//!
//! ```text
//! word 0   opcode (bits 31..24) | arg8 (bits 7..0)
//! word 1   arg32 (core mask / length)
//! word 2   address low
//! word 3   address high
//! ```

/// Size of one encoded command.
pub const COMMAND_BYTES: usize = 16;

/// Opcodes as they appear in word 0.
pub mod opcode {
    //! Command opcodes.

    /// `CoreEnable`.
    pub const CORE_ENABLE: u8 = 0x01;
    /// `Barrier`.
    pub const BARRIER: u8 = 0x02;
    /// `Exec`.
    pub const EXEC: u8 = 0x10;
    /// `EnableIrq`.
    pub const ENABLE_IRQ: u8 = 0x20;
}

/// One command fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Cores participating in the subtask.
    CoreEnable {
        /// One bit per core.
        mask: u32,
    },
    /// Synchronisation barrier across the masked cores.
    Barrier {
        /// One bit per core.
        mask: u32,
    },
    /// Execute a block of `len` bytes of layer program at `addr`.
    Exec {
        /// Device address of the layer program.
        addr: u64,
        /// Program length in bytes.
        len: u32,
    },
    /// Raise the completion interrupt on `core`.
    EnableIrq {
        /// Core that raises the interrupt.
        core: u8,
    },
}

impl Command {
    /// Encode into four little-endian words.
    #[must_use]
    pub fn encode(&self) -> [u32; 4] {
        let op = |code: u8, arg: u8| (u32::from(code) << 24) | u32::from(arg);
        match *self {
            Self::CoreEnable { mask } => [op(opcode::CORE_ENABLE, 0), mask, 0, 0],
            Self::Barrier { mask } => [op(opcode::BARRIER, 0), mask, 0, 0],
            #[allow(clippy::cast_possible_truncation)]
            Self::Exec { addr, len } => [op(opcode::EXEC, 0), len, addr as u32, (addr >> 32) as u32],
            Self::EnableIrq { core } => [op(opcode::ENABLE_IRQ, core), 0, 0, 0],
        }
    }

    /// Rewrite a core mask that referred to the window starting at `from`
    /// so that it refers to the window starting at `to`.
    fn relocate(mask: u32, from: u8, to: u8) -> u32 {
        (mask >> from) << to
    }
}

/// Commands for one subtask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subtask {
    /// Commands in fetch order.
    pub commands: Vec<Command>,
}

impl Subtask {
    /// Subtask from a command list.
    #[must_use]
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.commands.len() * COMMAND_BYTES
    }
}

/// A task's full command buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    /// Device address the encoded buffer is placed at.
    pub base_addr: u64,
    /// Ordered subtasks.
    pub subtasks: Vec<Subtask>,
}

impl CommandBuffer {
    /// Buffer at `base_addr`.
    #[must_use]
    pub fn new(base_addr: u64, subtasks: Vec<Subtask>) -> Self {
        Self { base_addr, subtasks }
    }

    /// Minimal buffer for a task on window `[start, start + len)`: one
    /// subtask per entry of `exec_lens`, each enabling the window, running one
    /// block and synchronising; the last one raises the interrupt on `start`.
    #[must_use]
    pub fn for_window(base_addr: u64, start: u8, len: u8, exec_lens: &[u32]) -> Self {
        let mask = crate::topology::Shape::new(start, len).mask();
        let mut addr = base_addr + 0x1_0000;
        let mut subtasks: Vec<Subtask> = exec_lens
            .iter()
            .map(|&l| {
                let exec = Command::Exec { addr, len: l };
                addr += u64::from(l);
                let mut cmds = vec![Command::CoreEnable { mask }, exec];
                if len > 1 {
                    cmds.push(Command::Barrier { mask });
                }
                Subtask::new(cmds)
            })
            .collect();
        if let Some(last) = subtasks.last_mut() {
            last.commands.push(Command::EnableIrq { core: start });
        }
        Self::new(base_addr, subtasks)
    }

    /// Device address of subtask `index`, or `None` if out of range.
    #[must_use]
    pub fn subtask_addr(&self, index: usize) -> Option<u64> {
        if index >= self.subtasks.len() {
            return None;
        }
        let offset: usize = self.subtasks[..index].iter().map(Subtask::byte_len).sum();
        Some(self.base_addr + offset as u64)
    }

    /// Encode every subtask back to back, little-endian.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.subtasks
            .iter()
            .flat_map(|s| s.commands.iter())
            .flat_map(|c| c.encode())
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    /// Union of every `CoreEnable` mask.
    #[must_use]
    pub fn enabled_cores(&self) -> u32 {
        self.subtasks
            .iter()
            .flat_map(|s| s.commands.iter())
            .fold(0, |acc, c| match c {
                Command::CoreEnable { mask } => acc | mask,
                _ => acc,
            })
    }

    /// Move the buffer from the window starting at `from` to the window
    /// starting at `to`.
    ///
    /// Every `CoreEnable` and `Barrier` mask is relocated in place, existing
    /// `EnableIrq` fragments are dropped and a single `EnableIrq { core: to }`
    /// is appended to the last subtask. Returns `false` (and leaves the buffer
    /// untouched) when `from == to`.
    pub fn retarget(&mut self, from: u8, to: u8) -> bool {
        if from == to {
            return false;
        }
        for sub in &mut self.subtasks {
            sub.commands.retain(|c| !matches!(c, Command::EnableIrq { .. }));
            for cmd in &mut sub.commands {
                match cmd {
                    Command::CoreEnable { mask } | Command::Barrier { mask } => {
                        *mask = Command::relocate(*mask, from, to);
                    }
                    Command::Exec { .. } | Command::EnableIrq { .. } => {}
                }
            }
        }
        if let Some(last) = self.subtasks.last_mut() {
            last.commands.push(Command::EnableIrq { core: to });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_addresses_follow_encoded_sizes() {
        let buf = CommandBuffer::for_window(0x8000_0000, 0, 2, &[64, 128]);
        assert_eq!(buf.subtask_addr(0), Some(0x8000_0000));
        let first = buf.subtasks[0].byte_len() as u64;
        assert_eq!(buf.subtask_addr(1), Some(0x8000_0000 + first));
        assert_eq!(buf.subtask_addr(2), None);
        assert_eq!(buf.encode().len(), buf.subtasks.iter().map(Subtask::byte_len).sum::<usize>());
    }

    #[test]
    fn retarget_moves_masks_and_irq() {
        let mut buf = CommandBuffer::for_window(0x1000, 0, 2, &[32, 32]);
        assert_eq!(buf.enabled_cores(), 0b0011);
        assert!(buf.retarget(0, 2));
        assert_eq!(buf.enabled_cores(), 0b1100);

        for sub in &buf.subtasks {
            for cmd in &sub.commands {
                if let Command::Barrier { mask } = cmd {
                    assert_eq!(*mask, 0b1100);
                }
            }
        }
        let irqs: Vec<_> = buf
            .subtasks
            .iter()
            .flat_map(|s| s.commands.iter())
            .filter(|c| matches!(c, Command::EnableIrq { .. }))
            .collect();
        assert_eq!(irqs, vec![&Command::EnableIrq { core: 2 }]);
        assert_eq!(
            buf.subtasks.last().unwrap().commands.last(),
            Some(&Command::EnableIrq { core: 2 })
        );
    }

    #[test]
    fn retarget_same_window_is_noop() {
        let mut buf = CommandBuffer::for_window(0x1000, 1, 2, &[16]);
        let before = buf.clone();
        assert!(!buf.retarget(1, 1));
        assert_eq!(buf, before);
    }

    #[test]
    fn encode_places_opcode_in_top_byte() {
        let words = Command::EnableIrq { core: 3 }.encode();
        assert_eq!(words[0] >> 24, u32::from(opcode::ENABLE_IRQ));
        assert_eq!(words[0] & 0xff, 3);
        let words = Command::Exec { addr: 0x1_2345_6789, len: 7 }.encode();
        assert_eq!(words[1], 7);
        assert_eq!(words[2], 0x2345_6789);
        assert_eq!(words[3], 1);
    }
}
