use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wasmtime::{Caller, Engine, Linker, Memory, Module, Store, TypedFunc};
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

use super::{ArenaStats, ForeignModule, c_str_at};
use crate::error::{BridgeError, Result};
use crate::event::{LogEvent, LogSink};

/// Where the kernel's wasm binary comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    File(PathBuf),
    /// Binary wasm or WAT text.
    Bytes(Vec<u8>),
}

/// Export names the kernel is expected to provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleExports {
    pub memory: String,
    pub malloc: String,
    pub free: String,
    pub convert: String,
}

impl Default for ModuleExports {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            malloc: "malloc".to_string(),
            free: "free".to_string(),
            convert: "generate_tool_positive".to_string(),
        }
    }
}

/// Store data shared with host imports.
struct HostState {
    wasi: WasiP1Ctx,
    sink: Arc<dyn LogSink>,
    exports: ModuleExports,
}

/// A kernel compiled to WebAssembly and run under wasmtime.
///
/// Besides WASI preview1 the module may import `env.post_log(ptr)`: it hands
/// the host a NUL-terminated log line that the host forwards to its sink and
/// then frees through the module's own `free` export.
pub struct WasmModule {
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    convert: TypedFunc<(i32, i32, f64), i32>,
    stats: ArenaStats,
}

impl WasmModule {
    pub fn load(
        source: &ModuleSource,
        exports: &ModuleExports,
        sink: Arc<dyn LogSink>,
    ) -> anyhow::Result<Self> {
        let engine = Engine::default();
        let module = match source {
            ModuleSource::File(path) => Module::from_file(&engine, path)
                .with_context(|| format!("Failed to load wasm module from {}", path.display()))?,
            ModuleSource::Bytes(bytes) => {
                Module::new(&engine, bytes).context("Failed to compile wasm module")?
            }
        };

        let mut linker: Linker<HostState> = Linker::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .context("Failed to add WASI to linker")?;
        linker
            .func_wrap("env", "post_log", post_log)
            .context("Failed to link env.post_log")?;
        // Emscripten builds import helpers the kernel never calls on the
        // conversion path; those trap if reached.
        linker
            .define_unknown_imports_as_traps(&module)
            .context("Failed to stub unknown imports")?;

        let wasi = WasiCtxBuilder::new().inherit_stderr().build_p1();
        let state = HostState { wasi, sink, exports: exports.clone() };
        let mut store = Store::new(&engine, state);

        let instance = linker
            .instantiate(&mut store, &module)
            .context("Failed to instantiate wasm module")?;

        if let Some(init) = instance.get_func(&mut store, "_initialize") {
            debug!("running _initialize");
            init.typed::<(), ()>(&store)?
                .call(&mut store, ())
                .context("_initialize trapped")?;
        }

        let memory = instance
            .get_memory(&mut store, &exports.memory)
            .ok_or_else(|| anyhow!("wasm module must export memory '{}'", exports.memory))?;
        let malloc = instance
            .get_typed_func::<i32, i32>(&mut store, &exports.malloc)
            .with_context(|| format!("missing export '{}' (i32) -> i32", exports.malloc))?;
        let free = instance
            .get_typed_func::<i32, ()>(&mut store, &exports.free)
            .with_context(|| format!("missing export '{}' (i32)", exports.free))?;
        let convert = instance
            .get_typed_func::<(i32, i32, f64), i32>(&mut store, &exports.convert)
            .with_context(|| format!("missing export '{}' (i32, i32, f64) -> i32", exports.convert))?;

        Ok(Self { store, memory, malloc, free, convert, stats: ArenaStats::default() })
    }
}

impl fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmModule")
            .field("exports", &self.store.data().exports)
            .field("stats", &self.stats)
            .finish()
    }
}

fn post_log(mut caller: Caller<'_, HostState>, address: i32) -> anyhow::Result<()> {
    let exports = caller.data().exports.clone();
    let memory = caller
        .get_export(&exports.memory)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("post_log: no memory export '{}'", exports.memory))?;

    match c_str_at(memory.data(&caller), address as u32) {
        Some(bytes) => {
            let line = String::from_utf8_lossy(bytes).into_owned();
            caller.data().sink.emit(LogEvent::new(line));
        }
        None => warn!(address, "post_log: unterminated log buffer"),
    }

    let free = caller
        .get_export(&exports.free)
        .and_then(|export| export.into_func())
        .ok_or_else(|| anyhow!("post_log: no free export '{}'", exports.free))?;
    free.typed::<i32, ()>(&caller)?.call(&mut caller, address)?;
    Ok(())
}

impl ForeignModule for WasmModule {
    fn allocate(&mut self, len: u32) -> Result<u32> {
        let requested = len as usize;
        let size = i32::try_from(len).map_err(|_| BridgeError::Allocation {
            requested,
            reason: "larger than the 32-bit address space".to_string(),
        })?;
        let address = self
            .malloc
            .call(&mut self.store, size)
            .map_err(|trap| BridgeError::Allocation { requested, reason: format!("{trap:#}") })?;
        if address == 0 {
            return Err(BridgeError::Allocation {
                requested,
                reason: "malloc returned null".to_string(),
            });
        }
        self.stats.allocations += 1;
        Ok(address as u32)
    }

    fn free(&mut self, address: u32) -> Result<()> {
        self.free
            .call(&mut self.store, address as i32)
            .with_context(|| format!("free({address:#x}) trapped"))?;
        self.stats.releases += 1;
        Ok(())
    }

    fn convert(&mut self, address: u32, length: u32, tolerance: f64) -> Result<u32> {
        let output = self
            .convert
            .call(&mut self.store, (address as i32, length as i32, tolerance))
            .map_err(|trap| BridgeError::Conversion(format!("kernel trapped: {trap:#}")))?;
        if output == 0 {
            return Err(BridgeError::conversion("kernel returned a null buffer"));
        }
        self.stats.allocations += 1;
        Ok(output as u32)
    }

    fn memory(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    fn stats(&self) -> ArenaStats {
        self.stats
    }
}
