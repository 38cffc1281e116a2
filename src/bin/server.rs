use clap::{App, Arg};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tripcast::config::ServerConfig;
use tripcast::model::Bus;
use tripcast::{server, Driver, Hub, MemoryStore, TripDispatcher, TripStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("tripcast-server")
        .version("0.1.0")
        .about("🚌 Trip progress fan-out server with a time-stepped bus simulator")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to bind")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to bind")
                .takes_value(true)
                .default_value("8080")
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be 0-65535".into())),
        )
        .arg(
            Arg::with_name("steps")
                .long("steps")
                .value_name("N")
                .help("Progress steps per trip")
                .takes_value(true)
                .default_value("10")
                .validator(|v| match v.parse::<u32>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Steps must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("minute-ms")
                .long("minute-ms")
                .value_name("MILLIS")
                .help("Wall-clock milliseconds per route minute")
                .takes_value(true)
                .default_value("1000")
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "Must be a number of milliseconds".into())),
        )
        .arg(
            Arg::with_name("queue")
                .long("queue")
                .value_name("SIZE")
                .help("Outbound queue size per client")
                .takes_value(true)
                .default_value("256")
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Queue size must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("demo")
                .long("demo")
                .help("Seed one bus per route and dispatch a trip on each"),
        )
        .get_matches();

    // Validators above guarantee these parse
    let mut config = ServerConfig::default();
    config.bind.host = matches.value_of("host").unwrap_or("127.0.0.1").to_string();
    config.bind.port = matches.value_of("port").and_then(|v| v.parse().ok()).unwrap_or(config.bind.port);
    config.driver.steps = matches.value_of("steps").and_then(|v| v.parse().ok()).unwrap_or(config.driver.steps);
    if let Some(ms) = matches.value_of("minute-ms").and_then(|v| v.parse().ok()) {
        config.driver.route_minute = Duration::from_millis(ms);
    }
    config.session.outbound_queue_size = matches
        .value_of("queue")
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.session.outbound_queue_size);

    let (hub, hub_task) = Hub::start(config.hub.clone())?;
    let memory = Arc::new(MemoryStore::with_seed_routes());
    let store: Arc<dyn TripStore> = memory.clone();
    let driver = Driver::new(Arc::clone(&store), hub.clone(), config.driver.clone());

    let listener = TcpListener::bind(config.bind.address()).await?;
    let stop_accepting = CancellationToken::new();
    let server_task = tokio::spawn(server::serve(
        listener,
        hub.clone(),
        Arc::clone(&store),
        config.session.clone(),
        stop_accepting.clone(),
    ));

    if matches.is_present("demo") {
        let dispatcher = TripDispatcher::new(Arc::clone(&store), driver.clone());
        for route in memory.routes() {
            let bus = memory.insert_bus(Bus::new(&format!("Coach {}", route.origin)));
            match dispatcher.create_trip(bus.id, route.id).await {
                Ok(trip) => info!(trip_id = trip.id, route = %route.name, "🚌 demo trip dispatched"),
                Err(e) => warn!(route = %route.name, error = %e, "demo trip not dispatched"),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown requested");

    // Runs persist their last state before the hub stops fanning out
    driver.shutdown().await;
    hub.shutdown().await;
    stop_accepting.cancel();
    if let Err(e) = server_task.await {
        error!(error = %e, "server task failed");
    }
    match hub_task.await {
        Ok(stats) => info!(delivered = stats.delivered, evicted = stats.evicted, "hub stopped"),
        Err(e) => error!(error = %e, "hub task failed"),
    }

    println!("🚌 tripcast server stopped");
    Ok(())
}
