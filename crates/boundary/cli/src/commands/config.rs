//! Effective configuration

use boundary_kernel::KernelConfig;

/// Print the configuration after defaults, file and environment are merged.
pub fn execute(config: &KernelConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
