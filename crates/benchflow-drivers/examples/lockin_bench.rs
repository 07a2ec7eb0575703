use std::sync::Arc;
use std::time::Duration;

use benchflow_drivers::catalog::builtin_source;
use benchflow_drivers::simulated::{SimulatedConnector, SimulatedDevice};
use benchflow_drivers::{
    CallArgs, Capability, ConnectorHub, DriverRegistry, DriverScanner, ResolveOptions, Resolver,
};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Simulated bench: a sourcemeter, a lock-in and a DAQ board
    let connector = SimulatedConnector::named("gpib")
        .with_device(
            "GPIB0::24::INSTR",
            SimulatedDevice::stream().respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234567,C30"),
        )
        .with_device(
            "GPIB0::8::INSTR",
            SimulatedDevice::stream()
                .respond("*IDN?", "Stanford_Research_Systems,SR830,s/n48212,ver1.07")
                .respond("OUTP? 1", "1.0234e-3")
                .with_echo(),
        )
        .with_device("USB::01D3F5A2", SimulatedDevice::bus("USB-231", "01D3F5A2"));

    // Registry and scanner
    let scanner = Arc::new(DriverScanner::new().with_source(builtin_source()));
    let resolver = Resolver::new(
        ConnectorHub::new().with(connector.clone()),
        DriverRegistry::in_memory().into(),
        scanner,
    );

    // Find any lock-in on the bench
    let options = ResolveOptions::default().with_step_timeout(Duration::from_millis(200));
    let lockin = resolver
        .resolve(Capability::Lockin, &options)
        .await?
        .into_instance()
        .ok_or("no lock-in on the bench")?;
    info!("Resolved {} at {}", lockin.class_path(), lockin.address());

    // Configure it; the sensitivity table follows the input configuration
    let args = CallArgs::new()
        .with("reference_source", "internal")
        .with("frequency", 1370.0)
        .with("input_configuration", "A-B")
        .with("sensitivity", 10e-3)
        .with("time_constant", 0.1);
    lockin.call("configure", args).await?;

    // Out-of-envelope values are rejected, never clamped
    let rejected = lockin
        .call("set_frequency", CallArgs::new().with("frequency", 250_000.0))
        .await;
    info!("Out-of-range frequency: {:?}", rejected.err());

    let x = lockin.call("get_x", CallArgs::new()).await?;
    info!("X = {}", x);
    info!("Commands sent: {:?}", connector.sent("GPIB0::8::INSTR"));

    // Release the instance
    lockin.release().await?;

    info!("Registry now holds {} fragments", resolver.registry().len().await);
    info!("Example completed!");

    Ok(())
}
