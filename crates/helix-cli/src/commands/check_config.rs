//! check-config command - run the configuration validator

use anyhow::{Result, bail};
use helix_config::{HelixConfig, Validator};

/// Execute the check-config command
///
/// Prints every finding; fails when any error was found.
pub fn execute(config: &HelixConfig, strict: bool) -> Result<()> {
    let result = Validator::new().with_strict_mode(strict).validate(config);

    for error in &result.errors {
        println!("{error}");
    }
    for warning in &result.warnings {
        println!("{warning}");
    }

    if !result.is_valid() {
        bail!("configuration has {} error(s)", result.errors.len());
    }
    println!(
        "Configuration OK ({} device(s), {} warning(s))",
        config.pool.devices.len(),
        result.warnings.len()
    );
    Ok(())
}
