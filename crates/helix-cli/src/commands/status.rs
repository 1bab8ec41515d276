//! status command - device inventory and model footprints

use crate::gib;
use anyhow::Result;
use helix_config::HelixConfig;
use helix_pool::DeviceRegistry;

/// Execute the status command
pub fn execute(config: &HelixConfig, json: bool) -> Result<()> {
    let pool = &config.pool;
    let registry = DeviceRegistry::from_specs(&pool.devices)?;

    if json {
        let footprints: serde_json::Map<String, serde_json::Value> = pool
            .model_footprints
            .keys()
            .map(|model| (model.clone(), pool.footprint(model).into()))
            .collect();
        let body = serde_json::json!({
            "devices": registry.snapshot(),
            "totals": registry.totals(),
            "footprints": footprints,
            "default_footprint": pool.default_footprint,
            "primary_strategy": pool.primary_strategy,
            "fallback_strategy": pool.fallback_strategy,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("helix-pool - Device Inventory");
    println!("{}", "=".repeat(60));
    for device in registry.snapshot() {
        println!("  {:<12} {:<20} {:>12}", device.id, device.name, gib(device.total_memory));
    }
    let totals = registry.totals();
    println!("  {:<33} {:>12}", format!("{} devices", totals.devices), gib(totals.total_memory));
    println!();

    println!("Placement");
    println!("{}", "-".repeat(60));
    println!("  Primary:         {}", pool.primary_strategy);
    match pool.fallback_strategy {
        Some(fallback) => println!("  Fallback:        {fallback}"),
        None => println!("  Fallback:        none"),
    }
    println!();

    println!("Model Footprints");
    println!("{}", "-".repeat(60));
    for model in pool.model_footprints.keys() {
        let bits = pool.quantization_bits.get(model).copied().unwrap_or(16);
        println!("  {:<24} {:>12}  ({bits}-bit)", model, gib(pool.footprint(model)));
    }
    println!("  {:<24} {:>12}", "(default)", gib(pool.default_footprint));
    Ok(())
}
