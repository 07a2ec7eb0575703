//! Command-line front end for BenchFlow.
//!
//! Resolves drivers against a bench description, a TOML file of simulated
//! devices keyed by address:
//!
//! ```toml
//! [devices."GPIB0::8::INSTR"]
//! responses = { "*IDN?" = "Stanford_Research_Systems,SR830,s/n48212,ver1.07" }
//!
//! [devices."USB::01D3F5A2"]
//! kind = "Bus"
//! local = { product_name = "USB-231", unique_id = "01D3F5A2" }
//! ```
//!
//! # Usage
//!
//! ```bash
//! benchflow --bench bench.toml resolve GPIB0::8::INSTR --require lockin
//! benchflow --bench bench.toml resolve GPIB0::8 --call set_phase --arg phase=45
//! benchflow --bench bench.toml find sourcemeter
//! benchflow scan
//! benchflow registry
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::debug;

use benchflow_core::config::{Config, ConfigBuilder};
use benchflow_core::logging;
use benchflow_core::types::Value;
use benchflow_drivers::simulated::{SimulatedConnector, SimulatedDevice, SIMULATED_CONNECTOR};
use benchflow_drivers::{CallArgs, Capability, ConnectorHub, Resolution, ResolveOptions, Resolver, Target};

#[derive(Parser)]
#[command(name = "benchflow")]
#[command(about = "Resolve instrument drivers and enforce their parameter contracts", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bench description of simulated devices (TOML)
    #[arg(long, global = true)]
    bench: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the driver for one address
    Resolve {
        /// Connection address, possibly partial
        address: String,

        /// Capability the driver must provide
        #[arg(long)]
        require: Option<String>,

        /// Do not fall back to the generic driver
        #[arg(long)]
        no_generic: bool,

        /// Operation to call on the resolved instance
        #[arg(long)]
        call: Option<String>,

        /// Operation argument as name=value
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, Value)>,
    },

    /// Find the first reachable device providing a capability
    Find {
        /// Capability tag, e.g. lockin, awg, sourcemeter
        capability: String,

        /// Do not fall back to the generic driver
        #[arg(long)]
        no_generic: bool,
    },

    /// List reachable addresses
    List,

    /// Scan driver sources into the registry
    Scan,

    /// Show the registry
    Registry,
}

/// Simulated devices keyed by address
#[derive(Debug, Default, Deserialize)]
struct Bench {
    /// Connector name, which also selects the probe profile
    #[serde(default)]
    connector: Option<String>,
    #[serde(default)]
    devices: BTreeMap<String, SimulatedDevice>,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{}`", raw))?;
    let value = value.trim();
    let value = if let Ok(i) = value.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(x) = value.parse::<f64>() {
        Value::Float(x)
    } else if let Ok(b) = value.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::String(value.to_string())
    };
    Ok((name.trim().to_string(), value))
}

fn load_bench(path: Option<&Path>) -> Result<ConnectorHub> {
    let bench = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read bench file {}", path.display()))?;
            toml::from_str::<Bench>(&content)
                .with_context(|| format!("Invalid bench file {}", path.display()))?
        }
        None => Bench::default(),
    };

    let connector = SimulatedConnector::named(bench.connector.as_deref().unwrap_or(SIMULATED_CONNECTOR));
    for (address, device) in bench.devices {
        debug!(%address, "Adding simulated device");
        connector.add_device(address, device);
    }
    Ok(ConnectorHub::new().with(connector))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = ConfigBuilder::from_env();
    if let Some(path) = path {
        builder = builder.with_config_file(path);
    }
    Ok(builder.build()?)
}

fn print_resolution(resolution: &Resolution) {
    match resolution {
        Resolution::Resolved { instance, trail } => {
            println!("address:      {}", instance.address());
            println!("driver:       {}", instance.class_path());
            println!("identity:     {}", instance.identity().unwrap_or("-"));
            let capabilities: Vec<String> = instance.capabilities().iter().map(|c| c.to_string()).collect();
            println!("capabilities: {}", capabilities.join(", "));
            println!("operations:   {}", instance.operations().join(", "));
            println!("trail:        {:?}", trail);
        }
        Resolution::NotFound {
            target,
            reason,
            identity,
            trail,
        } => {
            println!("no driver found for {}: {}", target, reason);
            if let Some(identity) = identity {
                println!("identity:     {}", identity);
            }
            println!("trail:        {:?}", trail);
        }
    }
}

async fn resolve(
    resolver: &Resolver,
    target: Target,
    options: ResolveOptions,
    call: Option<(String, CallArgs)>,
) -> Result<()> {
    let resolution = resolver.resolve(target, &options).await?;
    print_resolution(&resolution);

    if let Some(instance) = resolution.into_instance() {
        if let Some((operation, args)) = call {
            let value = instance.call(&operation, args).await;
            match value {
                Ok(value) => println!("{} -> {}", operation, value),
                Err(e) => println!("{} failed: {}", operation, e),
            }
        }
        instance.release().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    logging::init_from_config(&config.logging)?;
    let hub = load_bench(cli.bench.as_deref())?;
    let resolver = Resolver::from_config(&config, hub);

    match cli.command {
        Commands::Resolve {
            address,
            require,
            no_generic,
            call,
            args,
        } => {
            let mut options = ResolveOptions::default();
            if let Some(required) = require {
                options = options.require(Capability::from(required));
            }
            if no_generic {
                options = options.without_generic();
            }
            let call = call.map(|operation| (operation, args.into_iter().collect()));
            resolve(&resolver, Target::Address(address), options, call).await
        }
        Commands::Find { capability, no_generic } => {
            let mut options = ResolveOptions::default();
            if no_generic {
                options = options.without_generic();
            }
            resolve(&resolver, Target::Capability(Capability::from(capability)), options, None).await
        }
        Commands::List => {
            for resource in resolver.enumerator().list().await {
                match &resource.physical_id {
                    Some(id) => println!("{}\t{}\t{}", resource.address, resource.connector, id),
                    None => println!("{}\t{}", resource.address, resource.connector),
                }
            }
            Ok(())
        }
        Commands::Scan => {
            let report = resolver.scanner().scan(resolver.registry()).await?;
            for descriptor in &report.discovered {
                let markers: Vec<&str> = descriptor.identity_markers.iter().map(String::as_str).collect();
                println!("{}\t{}", descriptor.class_path, markers.join(", "));
            }
            println!(
                "discovered {}, added {}, excluded {}, failed {}, unmarked {} in {} ms",
                report.discovered.len(),
                report.added,
                report.skipped_excluded,
                report.skipped_failed,
                report.skipped_unmarked,
                report.duration().num_milliseconds()
            );
            Ok(())
        }
        Commands::Registry => {
            let registry = resolver.registry();
            registry.load().await;
            if let Some(path) = registry.path() {
                println!("# {}", path.display());
            }
            for (fragment, class_path) in registry.entries().await {
                println!("{}\t{}", fragment, class_path);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use benchflow_drivers::Connector;

    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("phase=45").unwrap(), ("phase".into(), Value::Integer(45)));
        assert_eq!(parse_key_value("sensitivity = 1e-3").unwrap().1, Value::Float(1e-3));
        assert_eq!(parse_key_value("on=true").unwrap().1, Value::Bool(true));
        assert_eq!(
            parse_key_value("input_configuration=A-B").unwrap().1,
            Value::String("A-B".into())
        );
        assert!(parse_key_value("phase").is_err());
    }

    #[test]
    fn test_load_bench() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(
            &path,
            r#"
connector = "gpib"

[devices."GPIB0::8::INSTR"]
responses = { "*IDN?" = "Stanford_Research_Systems,SR830,s/n48212,ver1.07" }
echo = true

[devices."USB::01D3F5A2"]
kind = "Bus"
local = { product_name = "USB-231", unique_id = "01D3F5A2" }
"#,
        )
        .unwrap();

        let hub = load_bench(Some(path.as_path())).unwrap();
        let connector = hub.connector_for("GPIB0::8::INSTR").unwrap();
        assert_eq!(connector.name(), "gpib");
        assert!(hub.connector_for("USB::01D3F5A2").is_some());
        assert!(load_bench(Some(dir.path().join("missing.toml").as_path())).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "benchflow",
            "--bench",
            "bench.toml",
            "resolve",
            "GPIB0::8",
            "--call",
            "set_phase",
            "--arg",
            "phase=45",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Resolve { ref args, .. } if args.len() == 1));
    }
}
