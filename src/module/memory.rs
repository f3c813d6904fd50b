use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use super::{ArenaStats, ForeignModule, c_str_at};
use crate::error::{BridgeError, Result};
use crate::event::{LogSink, TracingSink};

/// Kernel run by [`InMemoryModule::convert`]: input bytes (terminator
/// stripped), tolerance, and a sink for kernel diagnostics.
pub type Kernel =
    Box<dyn FnMut(&[u8], f64, &dyn LogSink) -> std::result::Result<Vec<u8>, String> + Send>;

/// First addresses are reserved so that `0` is never handed out.
const ARENA_BASE: u32 = 8;

/// A foreign module whose arena lives in a host `Vec<u8>`.
///
/// Allocation is first-fit over the gaps between live blocks. Kernels are
/// plain Rust closures, which makes this the module of choice for tests and
/// for embedding a natively linked kernel.
pub struct InMemoryModule {
    arena: Vec<u8>,
    live: BTreeMap<u32, u32>,
    kernel: Kernel,
    sink: Arc<dyn LogSink>,
    stats: ArenaStats,
}

impl InMemoryModule {
    pub fn new<K>(capacity: u32, kernel: K) -> Self
    where
        K: FnMut(&[u8], f64, &dyn LogSink) -> std::result::Result<Vec<u8>, String> + Send + 'static,
    {
        Self {
            arena: vec![0; capacity as usize],
            live: BTreeMap::new(),
            kernel: Box::new(kernel),
            sink: Arc::new(TracingSink),
            stats: ArenaStats::default(),
        }
    }

    /// Route kernel diagnostics to `sink` instead of `tracing`.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.arena.len() as u32
    }

    /// Blocks currently held in the arena, by either side.
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }

    fn reserve(&mut self, len: u32) -> Option<u32> {
        let len = len.max(1);
        let mut cursor = ARENA_BASE;
        for (&address, &size) in &self.live {
            if address.checked_sub(cursor)? >= len {
                break;
            }
            cursor = address + size;
        }
        let end = cursor.checked_add(len)?;
        if end > self.capacity() {
            return None;
        }
        self.live.insert(cursor, len);
        Some(cursor)
    }
}

impl fmt::Debug for InMemoryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryModule")
            .field("capacity", &self.arena.len())
            .field("live", &self.live)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ForeignModule for InMemoryModule {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        let address = self.reserve(len).ok_or_else(|| BridgeError::Allocation {
            requested: len as usize,
            reason: format!("arena of {} bytes exhausted", self.arena.len()),
        })?;
        self.stats.allocations += 1;
        Ok(address)
    }

    fn free(&mut self, address: u32) -> Result<()> {
        self.live
            .remove(&address)
            .ok_or_else(|| anyhow!("free of unallocated address {address:#x}"))?;
        self.stats.releases += 1;
        Ok(())
    }

    fn convert(&mut self, address: u32, length: u32, tolerance: f64) -> Result<u32> {
        let start = address as usize;
        let input = self
            .arena
            .get(start..start + length as usize)
            .ok_or_else(|| BridgeError::conversion("input range outside the arena"))?;
        let input = c_str_at(input, 0).unwrap_or(input).to_vec();

        let output = (self.kernel)(&input, tolerance, self.sink.as_ref())
            .map_err(BridgeError::Conversion)?;

        let size = u32::try_from(output.len() + 1)
            .map_err(|_| BridgeError::conversion("kernel output exceeds the address space"))?;
        let out = self
            .reserve(size)
            .ok_or_else(|| BridgeError::conversion("arena exhausted while storing kernel output"))?;
        let out_start = out as usize;
        self.arena[out_start..out_start + output.len()].copy_from_slice(&output);
        self.arena[out_start + output.len()] = 0;
        self.stats.allocations += 1;
        Ok(out)
    }

    fn memory(&self) -> &[u8] {
        &self.arena
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.arena
    }

    fn stats(&self) -> ArenaStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> InMemoryModule {
        InMemoryModule::new(64, |input, _, _| Ok(input.to_vec()))
    }

    #[test]
    fn first_fit_reuses_freed_gap() {
        let mut module = echo();
        let a = module.allocate(8).unwrap();
        let b = module.allocate(8).unwrap();
        assert_eq!(a, ARENA_BASE);
        assert_eq!(b, ARENA_BASE + 8);

        module.free(a).unwrap();
        let c = module.allocate(4).unwrap();
        assert_eq!(c, a);
        assert_eq!(module.live_blocks(), 2);
    }

    #[test]
    fn exhaustion_is_an_allocation_error() {
        let mut module = echo();
        let err = module.allocate(1000).unwrap_err();
        assert!(matches!(err, BridgeError::Allocation { requested: 1000, .. }));
        assert_eq!(module.stats(), ArenaStats::default());
    }

    #[test]
    fn double_free_is_reported() {
        let mut module = echo();
        let a = module.allocate(4).unwrap();
        module.free(a).unwrap();
        assert!(module.free(a).is_err());
        assert_eq!(module.stats().releases, 1);
    }

    #[test]
    fn convert_stores_terminated_output() {
        let mut module = InMemoryModule::new(64, |input, _, _| {
            Ok(input.iter().rev().copied().collect())
        });
        let input = module.allocate(4).unwrap();
        module.memory_mut()[input as usize..input as usize + 4].copy_from_slice(b"abc\0");

        let out = module.convert(input, 4, 0.1).unwrap();
        assert_eq!(c_str_at(module.memory(), out), Some(&b"cba"[..]));
        assert_eq!(module.stats().allocations, 2);
    }

    #[test]
    fn kernel_failure_is_a_conversion_error() {
        let mut module = InMemoryModule::new(64, |_, _, _| Err("Body must have exactly one solid.".into()));
        let input = module.allocate(1).unwrap();
        let err = module.convert(input, 1, 0.1).unwrap_err();
        assert!(matches!(err, BridgeError::Conversion(ref m) if m.contains("one solid")));
        assert_eq!(module.live_blocks(), 1);
    }
}
