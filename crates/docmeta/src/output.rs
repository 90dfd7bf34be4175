use std::io::Write;

use anyhow::Result;
use serde_json::{json, Value};

pub fn error_body(kind: &str, message: &str) -> Value {
    json!({ "kind": kind, "message": message })
}

/// Error classes raised by the library keep their kind; anything else is
/// reported as `internal`.
pub fn error_report(err: &anyhow::Error) -> Value {
    let kind = err
        .downcast_ref::<docmeta_core::Error>()
        .map_or("internal", docmeta_core::Error::kind);
    json!({ "error": error_body(kind, &format!("{err:#}")) })
}

pub fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}
