//! Idempotency key of a payload file

use std::path::Path;

use anyhow::Context;
use boundary_kernel::IdempotencyKeyDeriver;
use boundary_types::IdempotencyKey;

use crate::output::print_info;

pub fn execute(file: &str, operation: Option<String>) -> anyhow::Result<()> {
    let path = Path::new(file);
    let operation = match operation {
        Some(op) => op,
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive an operation name from {file}"))?,
    };
    let key = digest_file(path, &operation)?;

    print_info(&format!("operation: {operation}"));
    println!("{key}");
    Ok(())
}

fn digest_file(path: &Path, operation: &str) -> anyhow::Result<IdempotencyKey> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {} as JSON", path.display()))?;
    Ok(IdempotencyKeyDeriver::derive(operation, &payload))
}
