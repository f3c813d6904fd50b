//! Handles onto the foreign conversion kernel.
//!
//! A foreign module owns a linear memory arena and exposes four primitives:
//! allocate, free, convert and a view of the arena bytes. Addresses are 32-bit
//! offsets into that arena and `0` is the null address.

mod memory;
mod wasm;

pub use memory::{InMemoryModule, Kernel};
pub use wasm::{ModuleExports, ModuleSource, WasmModule};

use crate::error::Result;

/// Buffers that entered host ownership versus buffers the host freed.
///
/// Allocations count both host `allocate` calls and buffers returned by
/// `convert`. Between sessions the two counters must be equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub allocations: u64,
    pub releases: u64,
}

impl ArenaStats {
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.releases)
    }
}

pub trait ForeignModule {
    /// Reserve `len` bytes in the arena. A refused request is an
    /// [`Allocation`](crate::error::BridgeError::Allocation) error.
    fn allocate(&mut self, len: u32) -> Result<u32>;

    /// Return a buffer to the arena. Must be called once per buffer.
    fn free(&mut self, address: u32) -> Result<()>;

    /// Run the kernel over `length` bytes at `address`. Blocks until the
    /// kernel returns and yields the address of a freshly allocated,
    /// NUL-terminated output buffer.
    fn convert(&mut self, address: u32, length: u32, tolerance: f64) -> Result<u32>;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    fn stats(&self) -> ArenaStats;
}

impl<M: ForeignModule + ?Sized> ForeignModule for Box<M> {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        (**self).allocate(len)
    }

    fn free(&mut self, address: u32) -> Result<()> {
        (**self).free(address)
    }

    fn convert(&mut self, address: u32, length: u32, tolerance: f64) -> Result<u32> {
        (**self).convert(address, length, tolerance)
    }

    fn memory(&self) -> &[u8] {
        (**self).memory()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        (**self).memory_mut()
    }

    fn stats(&self) -> ArenaStats {
        (**self).stats()
    }
}

/// Bytes of the NUL-terminated string at `address`, without the terminator.
/// `None` when the address is out of range or no terminator follows it.
pub(crate) fn c_str_at(memory: &[u8], address: u32) -> Option<&[u8]> {
    let tail = memory.get(address as usize..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..end])
}
