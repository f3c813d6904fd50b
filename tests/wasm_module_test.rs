use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_protocol::{ConversionRequest, ErrorKind, OCTET_STREAM, Outbound};
use stepmesh::error::BridgeError;
use stepmesh::event::LogEvent;
use stepmesh::module::{ArenaStats, ForeignModule, ModuleExports, ModuleSource, WasmModule};
use stepmesh::{session, worker};
use tempfile::tempdir;
use tokio::time::timeout;

/// Bump-allocating kernel that echoes its input back as the "mesh".
///
/// Input starting with '!' makes it return null. Every conversion posts one
/// log line through `env.post_log`.
const KERNEL_WAT: &str = r#"
(module
  (import "env" "post_log" (func $post_log (param i32)))
  (memory (export "memory") 2)
  (global $next (mut i32) (i32.const 1024))
  (data (i32.const 16) "kernel: meshing\00")

  (func $malloc (export "malloc") (param $size i32) (result i32)
    (local $addr i32)
    (if (i32.gt_u
          (i32.add (global.get $next) (local.get $size))
          (i32.mul (memory.size) (i32.const 65536)))
      (then (return (i32.const 0))))
    (local.set $addr (global.get $next))
    (global.set $next
      (i32.add (local.get $addr)
        (i32.and (i32.add (local.get $size) (i32.const 7)) (i32.const -8))))
    (local.get $addr))

  (func (export "free") (param i32))

  (func (export "CONVERT") (param $in i32) (param $len i32) (param $tol f64) (result i32)
    (local $log i32)
    (local $out i32)
    (if (i32.eq (i32.load8_u (local.get $in)) (i32.const 33))
      (then (return (i32.const 0))))
    (local.set $log (call $malloc (i32.const 16)))
    (memory.copy (local.get $log) (i32.const 16) (i32.const 16))
    (call $post_log (local.get $log))
    (local.set $out (call $malloc (local.get $len)))
    (memory.copy (local.get $out) (local.get $in) (local.get $len))
    (local.get $out))
)
"#;

const STEP: &str = "ISO-10303-21;\nDATA;\n#1=MANIFOLD_SOLID_BREP('tool',#2);\nENDSEC;\n";

fn kernel(convert: &str) -> ModuleSource {
    ModuleSource::Bytes(KERNEL_WAT.replace("CONVERT", convert).into_bytes())
}

fn load() -> (WasmModule, Arc<Mutex<Vec<LogEvent>>>) {
    let sink = Arc::new(Mutex::new(Vec::<LogEvent>::new()));
    let module = WasmModule::load(
        &kernel("generate_tool_positive"),
        &ModuleExports::default(),
        sink.clone(),
    )
    .unwrap();
    (module, sink)
}

fn messages(sink: &Mutex<Vec<LogEvent>>) -> Vec<String> {
    sink.lock().unwrap().iter().map(|e| e.message.clone()).collect()
}

#[test]
fn session_round_trips_through_the_kernel() {
    let (mut module, sink) = load();

    let result = session::run(&mut module, &ConversionRequest::new(STEP, 0.01), &*sink).unwrap();

    assert_eq!(result.payload, STEP.as_bytes());
    assert_eq!(result.media_type, OCTET_STREAM);
    assert_eq!(module.stats(), ArenaStats { allocations: 2, releases: 2 });
    assert_eq!(
        messages(&sink),
        vec![
            format!("Received file of size {}", STEP.len() + 1),
            "kernel: meshing".to_string(),
            format!("STL file size: {} or {} Bytes", STEP.len(), STEP.len()),
        ]
    );
}

#[test]
fn null_output_is_a_conversion_error() {
    let (mut module, sink) = load();

    let err = session::run(&mut module, &ConversionRequest::new("!broken", 0.01), &*sink)
        .unwrap_err();

    assert!(matches!(err, BridgeError::Conversion(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Conversion);
    // the input buffer is still released
    assert_eq!(module.stats(), ArenaStats { allocations: 1, releases: 1 });
}

#[test]
fn oversized_input_is_an_allocation_error() {
    let (mut module, sink) = load();
    let text = "x".repeat(200_000);

    let err = session::run(&mut module, &ConversionRequest::new(text, 0.01), &*sink).unwrap_err();

    assert!(matches!(err, BridgeError::Allocation { requested: 200_001, .. }), "{err}");
    assert_eq!(module.stats(), ArenaStats::default());
    assert!(messages(&sink).is_empty());
}

#[test]
fn export_names_are_configurable() {
    let sink = Arc::new(Mutex::new(Vec::<LogEvent>::new()));
    let exports = ModuleExports { convert: "mesh".to_string(), ..ModuleExports::default() };
    let mut module = WasmModule::load(&kernel("mesh"), &exports, sink.clone()).unwrap();

    let result = session::run(&mut module, &ConversionRequest::new("solid", 0.5), &*sink).unwrap();
    assert_eq!(result.payload, b"solid");
}

#[test]
fn missing_export_fails_to_load() {
    let sink = Arc::new(Mutex::new(Vec::<LogEvent>::new()));
    let err = WasmModule::load(&kernel("other_name"), &ModuleExports::default(), sink).unwrap_err();
    assert!(format!("{err:#}").contains("generate_tool_positive"), "{err:#}");
}

#[test]
fn loads_from_a_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kernel.wat");
    std::fs::write(&path, KERNEL_WAT.replace("CONVERT", "generate_tool_positive")).unwrap();

    let sink = Arc::new(Mutex::new(Vec::<LogEvent>::new()));
    let mut module =
        WasmModule::load(&ModuleSource::File(path), &ModuleExports::default(), sink.clone()).unwrap();
    session::run(&mut module, &ConversionRequest::new(STEP, 0.01), &*sink).unwrap();
    assert_eq!(module.stats().outstanding(), 0);
}

#[tokio::test]
async fn worker_drives_the_wasm_kernel() {
    let (worker, mut events) = worker::spawn(|outbox| {
        WasmModule::load(&kernel("generate_tool_positive"), &ModuleExports::default(), Arc::new(outbox))
    })
    .unwrap();

    let mut seen = Vec::new();
    loop {
        let message = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        if message == Outbound::Ready {
            worker.post_message(ConversionRequest::new(STEP, 0.01)).unwrap();
        }
        let done = message.is_final();
        seen.push(message);
        if done {
            break;
        }
    }

    assert_eq!(seen[0], Outbound::Ready);
    assert_eq!(seen[2], Outbound::log("kernel: meshing"));
    match seen.last() {
        Some(Outbound::Blob { blob, .. }) => assert_eq!(blob.data, STEP.as_bytes()),
        other => panic!("expected blob, got {other:?}"),
    }
    worker.shutdown();
}
