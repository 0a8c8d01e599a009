use std::sync::Arc;
use fitbridge::{
    belt::{belt_session, forward_heart_rate},
    ble::BleTransport,
    profile::SPORTSTECH_BIKE,
    BridgeSettings, OperatorCommand, Result, SessionBuilder, SessionState,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Fitbridge Monitor Example");

    let resistance = std::env::args().nth(1).and_then(|arg| arg.parse::<i32>().ok());
    let belt_name = std::env::args().nth(2).unwrap_or_default();
    let settings = BridgeSettings {
        heart_rate_belt_name: if belt_name.is_empty() {
            BridgeSettings::default().heart_rate_belt_name
        } else {
            belt_name
        },
        ..BridgeSettings::default()
    };

    let transport = Arc::new(BleTransport::new().await?);
    let (session, handle) = SessionBuilder::new(&SPORTSTECH_BIKE, transport)
        .settings(settings.clone())
        .build();
    let session_task = tokio::spawn(session.run());

    // the belt gets its own link
    let belt_transport = if settings.heart_rate_belt_configured() {
        Some(Arc::new(BleTransport::new().await?))
    } else {
        None
    };
    let belt = belt_transport
        .and_then(|t| belt_session(t, &settings))
        .map(|builder| {
            let (belt, belt_handle) = builder.build();
            let feed = forward_heart_rate(&belt_handle, &handle);
            (tokio::spawn(belt.run()), belt_handle, feed)
        });

    if let Err(e) = handle.wait_for_state(SessionState::Ready).await {
        error!("❌ Session ended before the bike was ready: {}", e);
        return Err(e);
    }
    info!("✅ Bike ready. Press Ctrl+C to stop monitoring");

    if let Some(level) = resistance {
        info!("Requesting resistance {}", level);
        handle.request(OperatorCommand::TargetResistance(level))?;
    }

    let mut metrics = handle.subscribe_metrics();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = metrics.changed() => {
                if changed.is_err() {
                    warn!("Session ended");
                    break;
                }
                let m = metrics.borrow_and_update().clone();
                println!(
                    "{:>6.1} km/h │ {:>4.0} rpm │ {:>5.0} W │ res {:>2} │ {:>3} bpm │ {:>6.2} km │ {:>5.0} kcal",
                    m.speed_kmh,
                    m.cadence_rpm,
                    m.power_w,
                    m.resistance,
                    m.heart_rate_bpm,
                    m.distance_km,
                    m.calories_kcal,
                );
            }
        }
    }

    handle.shutdown();
    let summary = match session_task.await {
        Ok(result) => result?,
        Err(e) => {
            error!("Session task failed: {}", e);
            return Ok(());
        }
    };
    if let Some((belt_task, belt_handle, feed)) = belt {
        belt_handle.shutdown();
        feed.abort();
        let _ = belt_task.await;
    }

    println!("\n📋 Session Summary");
    println!("  Samples:  {}", summary.lines.len());
    println!("  Distance: {:.2} km", summary.metrics.distance_km);
    println!("  Energy:   {:.0} kcal", summary.metrics.calories_kcal);
    Ok(())
}
