//! Example: Simulated Pod Session
//!
//! This example walks a coordinator through a typical session against the
//! mock executor: connect, read status, set a basal profile, run a temporary
//! basal, deliver a bolus, and print the dispatch metrics.
//!
//! Run with: `cargo run --example simulate_session -- [CONFIG.toml]`
//!
//! Set `RUST_LOG=podctl_core=debug` for more detail.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use podctl_core::{
    BasalProfile, BasalSegment, DriverConfig, MockExecutorBuilder, PodCoordinator, PodEvent,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("podctl_core=info")),
        )
        .init();

    let config = match env::args().nth(1) {
        Some(path) => DriverConfig::load_validated(path)?,
        None => DriverConfig::default(),
    };

    let pod = Arc::new(
        MockExecutorBuilder::new()
            .reservoir(150.0)
            .battery(87)
            .latency(Duration::from_millis(40))
            .ready_after(2)
            .build(),
    );
    let coordinator = PodCoordinator::builder(pod.clone())
        .config(config)
        .build()?;

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PodEvent::RefreshButton { .. } | PodEvent::ValuesChanged => {}
                other => println!("  event: {:?}", other),
            }
        }
    });

    println!("Connecting...");
    coordinator.on_transport_connected().await;
    let state = loop {
        match coordinator.get_pump_status(true).await {
            Ok(state) => break state,
            Err(e) => {
                println!("  not yet: {}", e);
                tokio::time::sleep(coordinator.config().probe.delay()).await;
            }
        }
    };
    println!("Driver {}", state);
    println!("  Serial:    {}", coordinator.serial_number().await);
    println!("  Reservoir: {:.2} U", coordinator.reservoir_level().await);
    println!("  Battery:   {}%", coordinator.battery_level().await);
    println!();

    let profile = BasalProfile::new(vec![
        BasalSegment::at(0, 0, 0.65),
        BasalSegment::at(6, 30, 0.9),
        BasalSegment::at(12, 0, 0.8),
        BasalSegment::at(21, 0, 0.7),
    ])?;
    println!("Set profile:        {}", coordinator.set_new_basal_profile(profile.clone()).await);
    println!("Set profile again:  {}", coordinator.set_new_basal_profile(profile.clone()).await);
    println!("Base basal rate:    {:.2} U/h", coordinator.get_base_basal_rate().await);

    println!(
        "TBR 1.4 U/h:        {}",
        coordinator.set_temp_basal_absolute(1.4, 30, &profile, false).await
    );
    println!(
        "TBR 1.4 U/h again:  {}",
        coordinator.set_temp_basal_absolute(1.4, 30, &profile, false).await
    );
    println!(
        "TBR 0.5 U/h:        {}",
        coordinator.set_temp_basal_absolute(0.5, 60, &profile, false).await
    );

    println!("Bolus 1.0 U:        {}", coordinator.deliver_bolus(1.0, 12.0, false).await);
    println!("Bolus 0.5 U (busy): {}", coordinator.deliver_bolus(0.5, 0.0, false).await);
    println!("Cancel TBR:         {}", coordinator.cancel_temp_basal().await);
    println!();

    println!("Reservoir now {:.2} U", coordinator.reservoir_level().await);
    println!("Commands sent: {:?}", pod.dispatched_kinds());
    println!();
    println!("Metrics:");
    println!("{}", serde_json::to_string_pretty(&coordinator.metrics())?);

    coordinator.shutdown().await;
    Ok(())
}
