//! Moves strings in and out of a foreign arena.
//!
//! A [`Marshaler`] borrows the module for the length of one session and keeps
//! a ledger of the buffers the session owns. Every owned buffer is released
//! exactly once: explicitly through [`Marshaler::release`] or
//! [`Marshaler::finish`], or implicitly when the marshaler is dropped on an
//! early return.

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::module::{ForeignModule, c_str_at};

/// One allocation inside the foreign arena.
///
/// `length` counts the NUL terminator. The handle is only an address; the
/// owning [`Marshaler`] decides whether it may still be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignBuffer {
    pub address: u32,
    pub length: u32,
}

impl ForeignBuffer {
    /// Length of the payload without the terminator.
    pub fn payload_len(&self) -> u32 {
        self.length.saturating_sub(1)
    }
}

pub struct Marshaler<'m, M: ForeignModule + ?Sized> {
    module: &'m mut M,
    owned: Vec<ForeignBuffer>,
}

impl<'m, M: ForeignModule + ?Sized> Marshaler<'m, M> {
    pub fn new(module: &'m mut M) -> Self {
        Self { module, owned: Vec::new() }
    }

    /// Copy `text` into a fresh arena buffer as NUL-terminated UTF-8.
    pub fn encode(&mut self, text: &str) -> Result<ForeignBuffer> {
        let requested = text.len() + 1;
        let length = u32::try_from(requested).map_err(|_| BridgeError::Allocation {
            requested,
            reason: "larger than the 32-bit address space".to_string(),
        })?;
        let address = self.module.allocate(length)?;
        let buffer = ForeignBuffer { address, length };
        self.owned.push(buffer);

        let start = address as usize;
        let Some(target) = self.module.memory_mut().get_mut(start..start + requested) else {
            return Err(BridgeError::Allocation {
                requested,
                reason: format!("allocation at {address:#x} lies outside the arena"),
            });
        };
        target[..text.len()].copy_from_slice(text.as_bytes());
        target[text.len()] = 0;

        debug!(address, length, "encoded input buffer");
        Ok(buffer)
    }

    /// Take ownership of a buffer the module allocated, measuring it up to
    /// its terminator. The buffer is owned (and will be released) even when
    /// measuring fails. An address already in the ledger is refused and
    /// stays owned once.
    pub fn adopt(&mut self, address: u32) -> Result<ForeignBuffer> {
        if self.owned.iter().any(|b| b.address == address) {
            return Err(BridgeError::conversion(format!(
                "kernel returned {address:#x}, an address the session already owns"
            )));
        }
        let mut buffer = ForeignBuffer { address, length: 0 };
        self.owned.push(buffer);

        let len = c_str_at(self.module.memory(), address)
            .map(<[u8]>::len)
            .ok_or_else(|| {
                BridgeError::conversion(format!("output buffer at {address:#x} is not terminated"))
            })?;
        buffer.length = len as u32 + 1;
        if let Some(entry) = self.owned.iter_mut().rev().find(|b| b.address == address) {
            entry.length = buffer.length;
        }
        Ok(buffer)
    }

    /// Run the module's convert primitive over `input` and adopt its output.
    pub fn convert(&mut self, input: ForeignBuffer, tolerance: f64) -> Result<ForeignBuffer> {
        self.ensure_owned(input)?;
        let output = self.module.convert(input.address, input.length, tolerance)?;
        self.adopt(output)
    }

    /// UTF-8 text of an owned buffer, up to its first NUL.
    pub fn decode(&self, buffer: ForeignBuffer) -> Result<String> {
        self.ensure_owned(buffer)?;
        let bytes = c_str_at(self.module.memory(), buffer.address).ok_or_else(|| {
            BridgeError::conversion(format!("buffer at {:#x} is not terminated", buffer.address))
        })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| BridgeError::conversion(format!("output is not valid UTF-8: {err}")))
    }

    /// Free an owned buffer. Releasing a buffer twice fails without touching
    /// the arena.
    pub fn release(&mut self, buffer: ForeignBuffer) -> Result<()> {
        let index = self
            .owned
            .iter()
            .position(|b| b.address == buffer.address)
            .ok_or(BridgeError::UnownedBuffer { address: buffer.address })?;
        self.owned.remove(index);
        self.module.free(buffer.address)
    }

    /// Release everything still owned, most recent first. Every buffer is
    /// attempted; the first failure is returned.
    pub fn finish(mut self) -> Result<()> {
        self.release_all()
    }

    pub fn owned(&self) -> &[ForeignBuffer] {
        &self.owned
    }

    fn ensure_owned(&self, buffer: ForeignBuffer) -> Result<()> {
        if self.owned.iter().any(|b| b.address == buffer.address) {
            Ok(())
        } else {
            Err(BridgeError::UnownedBuffer { address: buffer.address })
        }
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(buffer) = self.owned.pop() {
            if let Err(err) = self.module.free(buffer.address) {
                warn!(address = buffer.address, error = %err, "failed to release foreign buffer");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<M: ForeignModule + ?Sized> Drop for Marshaler<'_, M> {
    fn drop(&mut self) {
        if !self.owned.is_empty() {
            debug!(count = self.owned.len(), "releasing foreign buffers on early exit");
            let _ = self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::InMemoryModule;

    fn module() -> InMemoryModule {
        InMemoryModule::new(256, |input, _, _| Ok(input.to_ascii_uppercase()))
    }

    #[test]
    fn encode_writes_terminated_utf8() {
        let mut module = module();
        let mut marshaler = Marshaler::new(&mut module);
        let buffer = marshaler.encode("héllo").unwrap();

        // 'é' is two bytes
        assert_eq!(buffer.length, 7);
        assert_eq!(buffer.payload_len(), 6);
        assert_eq!(marshaler.decode(buffer).unwrap(), "héllo");
        marshaler.finish().unwrap();
        assert_eq!(module.stats().outstanding(), 0);
    }

    #[test]
    fn empty_text_still_gets_a_terminator() {
        let mut module = module();
        let mut marshaler = Marshaler::new(&mut module);
        let buffer = marshaler.encode("").unwrap();
        assert_eq!(buffer.length, 1);
        assert_eq!(marshaler.decode(buffer).unwrap(), "");
    }

    #[test]
    fn convert_adopts_output() {
        let mut module = module();
        let mut marshaler = Marshaler::new(&mut module);
        let input = marshaler.encode("solid").unwrap();
        let output = marshaler.convert(input, 0.1).unwrap();

        assert_eq!(output.length, 6);
        assert_eq!(marshaler.decode(output).unwrap(), "SOLID");
        assert_eq!(marshaler.owned().len(), 2);
    }

    #[test]
    fn second_release_is_refused() {
        let mut module = module();
        let mut marshaler = Marshaler::new(&mut module);
        let buffer = marshaler.encode("x").unwrap();

        marshaler.release(buffer).unwrap();
        let err = marshaler.release(buffer).unwrap_err();
        assert!(matches!(err, BridgeError::UnownedBuffer { .. }));
        assert!(matches!(marshaler.decode(buffer), Err(BridgeError::UnownedBuffer { .. })));
        drop(marshaler);

        assert_eq!(module.stats().allocations, 1);
        assert_eq!(module.stats().releases, 1);
    }

    #[test]
    fn drop_releases_everything_still_owned() {
        let mut module = module();
        {
            let mut marshaler = Marshaler::new(&mut module);
            let input = marshaler.encode("abc").unwrap();
            marshaler.convert(input, 1.0).unwrap();
        }
        assert_eq!(module.stats().allocations, 2);
        assert_eq!(module.stats().releases, 2);
        assert_eq!(module.live_blocks(), 0);
    }

    /// Delegates to an in-memory arena but hands the input address back as
    /// the kernel output.
    struct InPlace(InMemoryModule);

    impl ForeignModule for InPlace {
        fn allocate(&mut self, len: u32) -> Result<u32> {
            self.0.allocate(len)
        }
        fn free(&mut self, address: u32) -> Result<()> {
            self.0.free(address)
        }
        fn convert(&mut self, address: u32, _length: u32, _tolerance: f64) -> Result<u32> {
            Ok(address)
        }
        fn memory(&self) -> &[u8] {
            self.0.memory()
        }
        fn memory_mut(&mut self) -> &mut [u8] {
            self.0.memory_mut()
        }
        fn stats(&self) -> crate::module::ArenaStats {
            self.0.stats()
        }
    }

    #[test]
    fn output_aliasing_the_input_is_freed_once() {
        let mut module = InPlace(module());
        let mut marshaler = Marshaler::new(&mut module);
        let input = marshaler.encode("solid").unwrap();

        let err = marshaler.convert(input, 0.1).unwrap_err();
        assert!(matches!(err, BridgeError::Conversion(ref m) if m.contains("already owns")), "{err}");
        assert_eq!(marshaler.owned(), &[input]);
        marshaler.finish().unwrap();

        assert_eq!(module.stats().allocations, 1);
        assert_eq!(module.stats().releases, 1);
        assert_eq!(module.0.live_blocks(), 0);
    }

    #[test]
    fn failed_allocation_leaves_nothing_owned() {
        let mut module = InMemoryModule::new(16, |input, _, _| Ok(input.to_vec()));
        let mut marshaler = Marshaler::new(&mut module);
        let err = marshaler.encode(&"x".repeat(64)).unwrap_err();
        assert!(matches!(err, BridgeError::Allocation { requested: 65, .. }));
        assert!(marshaler.owned().is_empty());
    }
}
