//! Instance and component listing.

use anyhow::{Context, Result};
use qetl_scheduler::Manager;

pub fn components(manager: &Manager, json: bool) -> Result<()> {
    let components = manager.components();

    if json {
        let body =
            serde_json::to_string_pretty(&components).context("Failed to encode components")?;
        println!("{}", body);
        return Ok(());
    }

    if components.is_empty() {
        println!("No components available");
        return Ok(());
    }
    println!("Available components:");
    for component in &components {
        println!(
            "  {:<28} {:<10} v{}  {}",
            component.name, component.component_type, component.version, component.description
        );
    }
    Ok(())
}

pub fn info(manager: &Manager, json: bool) -> Result<()> {
    let info = manager.instance_info();

    if json {
        let body = serde_json::to_string_pretty(&info).context("Failed to encode instance info")?;
        println!("{}", body);
        return Ok(());
    }

    println!("Mode:        {}", info.mode);
    println!("Executor:    {}", info.executor);
    println!("Version:     {}", info.version);
    println!("Active jobs: {}", info.active_jobs);
    println!("Total jobs:  {}", info.total_jobs);
    Ok(())
}
