use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio_stream::StreamExt;

use blescout::bluetooth::{self, BtleplugRadio};
use blescout::config::AppConfig;
use blescout::location::{FixedLocation, LocationSource, NoLocation};
use blescout::logging::{configure_logging, set_debug_flags, DebugFlags, PerformanceLogger};
use blescout::presentation::{format_distance, DeviceListView};
use blescout::registry::SightingRegistry;
use blescout::sighting::{AuthorizationState, Location};
use blescout::store::SightingStore;
use blescout::{ScanOrchestrator, ScanState};

const REDRAW_INTERVAL: Duration = Duration::from_secs(1);
const UNBOUNDED_SCAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = AppConfig::load_or_default().context("Failed to load settings")?;
    if let Err(e) = configure_logging(config.log_level, config.log_file.clone(), true) {
        eprintln!("Logging unavailable: {}", e);
    }
    if let Ok(list) = std::env::var("BLESCOUT_DEBUG") {
        set_debug_flags(DebugFlags::parse(&list));
    }

    match args.get(1).map(String::as_str) {
        Some("adapters") => list_adapters().await,
        Some("scan") => scan(&config, &args[2..]).await,
        Some("history") => history(&config).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

async fn list_adapters() -> Result<()> {
    let adapters = bluetooth::list_adapters().await?;
    if adapters.is_empty() {
        println!("No Bluetooth adapters found");
    }
    for adapter in adapters {
        println!("{}", adapter);
    }
    Ok(())
}

async fn scan(config: &AppConfig, args: &[String]) -> Result<()> {
    let (duration, fix) = parse_scan_args(args)?;

    let store = Arc::new(SightingStore::open(&config.database_path)?);
    if store.migration_report().lost_data() {
        eprintln!("Warning: the sighting history could not be upgraded and was reset");
    }

    let location: Arc<dyn LocationSource> = match fix {
        Some(fix) => Arc::new(FixedLocation::new(fix)),
        None => Arc::new(NoLocation),
    };
    let registry = Arc::new(SightingRegistry::new());
    let orchestrator = ScanOrchestrator::builder(Arc::new(BtleplugRadio::new()), store.clone(), registry.clone())
        .location(location)
        .distance_model(config.distance.clone())
        .scan_settings(config.scan.clone())
        .location_request(config.location.clone())
        .build();

    let session = orchestrator.start(AuthorizationState::full()).await?;
    println!("Scanning (session {}), press Ctrl-C to stop", session);

    let view = DeviceListView::new();
    let mut updates = Box::pin(view.updates(registry.clone()));
    let deadline = tokio::time::sleep(duration.unwrap_or(UNBOUNDED_SCAN));
    tokio::pin!(deadline);
    let mut last_redraw: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            update = updates.next() => {
                if update.is_none() {
                    break;
                }
                if last_redraw.map_or(true, |at| at.elapsed() >= REDRAW_INTERVAL) {
                    print!("\x1B[2J\x1B[H{}", view.render(&registry));
                    last_redraw = Some(Instant::now());
                }
            }
        }
        if !matches!(orchestrator.state(), ScanState::Scanning) {
            eprintln!("Scan ended: {:?}", orchestrator.state());
            break;
        }
    }

    orchestrator.flush().await;
    if orchestrator.state() == ScanState::Scanning {
        orchestrator.stop().await?;
    }

    print!("{}", view.render(&registry));
    let stored = store.session_rows(&session).await?;
    println!("{} devices recorded in session {}", stored.len(), session);
    Ok(())
}

fn parse_scan_args(args: &[String]) -> Result<(Option<Duration>, Option<Location>)> {
    let duration = match args.first() {
        Some(secs) => Some(Duration::from_secs(
            secs.parse().with_context(|| format!("Invalid duration: {}", secs))?,
        )),
        None => None,
    };
    let fix = match (args.get(1), args.get(2)) {
        (Some(lat), Some(lon)) => Some(Location::new(
            lat.parse().with_context(|| format!("Invalid latitude: {}", lat))?,
            lon.parse().with_context(|| format!("Invalid longitude: {}", lon))?,
        )),
        (None, None) => None,
        _ => bail!("Both latitude and longitude are required"),
    };
    Ok((duration, fix))
}

async fn history(config: &AppConfig) -> Result<()> {
    let store = SightingStore::open(&config.database_path)?;
    let perf = PerformanceLogger::new("history", "sessions");
    let sessions = store.sessions().await?;
    perf.finish_with_context("session summaries");
    if sessions.is_empty() {
        println!("No sightings recorded yet");
        return Ok(());
    }

    println!("{} sightings in {} sessions", store.count().await?, sessions.len());
    for summary in &sessions {
        println!(
            "  {}  {} devices  {} .. {}",
            summary.session_id,
            summary.sightings,
            summary.first_seen.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            summary.last_seen.with_timezone(&chrono::Local).format("%H:%M:%S")
        );
    }

    println!("\nMost recent:");
    for row in store.recent(20).await? {
        let sighting = &row.sighting;
        println!(
            "  {:<24} {:<18} {:>5} dBm {:>8}",
            sighting.display_name,
            sighting.address,
            sighting.signal_strength,
            format_distance(sighting.estimated_distance)
        );
    }
    Ok(())
}

fn print_usage() {
    println!("blescout - BLE beacon scanner");
    println!("\nUsage:");
    println!("  blescout adapters                 - List Bluetooth adapters");
    println!("  blescout scan [seconds] [lat lon] - Scan, optionally for a fixed time at a fixed location");
    println!("  blescout history                  - Show recorded sessions and recent sightings");
    println!("\nSet BLESCOUT_DEBUG=scanner,store,... to enable debug categories");
}
