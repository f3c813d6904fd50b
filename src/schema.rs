use std::{fs, path::Path};

use anyhow::{Context, Error};
use bridge_protocol::{ConversionRequest, Outbound};
use schemars::schema_for;

use crate::config::BridgeConfig;

pub const REQUEST_SCHEMA: &str = "conversion-request.schema.json";
pub const OUTBOUND_SCHEMA: &str = "outbound.schema.json";
pub const CONFIG_SCHEMA: &str = "config.schema.json";

/// Writes the JSON Schemas of the wire messages into `out_dir` and returns
/// the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let schemas = [
        (REQUEST_SCHEMA, serde_json::to_string_pretty(&schema_for!(ConversionRequest))?),
        (OUTBOUND_SCHEMA, serde_json::to_string_pretty(&schema_for!(Outbound))?),
        (CONFIG_SCHEMA, serde_json::to_string_pretty(&schema_for!(BridgeConfig))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, json) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(name.to_string());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn writes_message_schemas() {
        let dir = tempdir().unwrap();
        let written = write_schema(&dir.path().join("schemas")).unwrap();
        assert_eq!(written.len(), 3);

        let raw = fs::read_to_string(dir.path().join("schemas").join(OUTBOUND_SCHEMA)).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        let text = schema.to_string();
        for tag in ["ready", "log", "blob", "error"] {
            assert!(text.contains(&format!("\"{tag}\"")), "missing {tag}");
        }

        let raw = fs::read_to_string(dir.path().join("schemas").join(REQUEST_SCHEMA)).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(schema["title"], "ConversionRequest");
    }
}
