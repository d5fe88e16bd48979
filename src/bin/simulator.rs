use clap::{App, Arg};
use hvbmu::config::BmuConfig;
use hvbmu::monitor::Monitor;
use hvbmu::sim::{FaultInjector, PackModel, SimulatedController};
use hvbmu::supervisor;
use hvbmu::telemetry::{JsonLinesSink, TelemetrySink, TracingSink};
use hvbmu::{MemoryBus, RecordingActuator};
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("hvbmu-sim")
        .version("0.1.0")
        .about("Runs the battery monitor against a simulated battery controller")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Supervisory TCP port (overrides config)")
                .takes_value(true)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Fault injection seed")
                .takes_value(true)
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|e| e.to_string())),
        )
        .arg(
            Arg::with_name("no-faults")
                .long("no-faults")
                .help("Disable fault injection"),
        )
        .arg(
            Arg::with_name("enable")
                .long("enable")
                .help("Request HV at startup"),
        )
        .arg(
            Arg::with_name("telemetry")
                .short("t")
                .long("telemetry")
                .value_name("FILE")
                .help("Write telemetry records as JSON lines to FILE")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => BmuConfig::from_json_file(path)?,
        None => BmuConfig::default(),
    };
    if let Some(port) = matches.value_of("port") {
        config.simulator.tcp_port = port.parse()?;
    }
    if matches.is_present("no-faults") {
        config.simulator.faults.enabled = false;
    }
    let injector = match matches.value_of("seed") {
        Some(seed) => FaultInjector::with_seed(config.simulator.faults.clone(), seed.parse()?),
        None => FaultInjector::new(config.simulator.faults.clone()),
    };

    info!("HV Battery Monitor simulator");

    // Bind before anything can energize the contactors.
    let port = config.simulator.tcp_port;
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "Supervisory interface listening");

    let (host, device) = MemoryBus::pair();
    let (sim_shutdown, sim_shutdown_rx) = watch::channel(false);
    let simulated = SimulatedController::new(device, PackModel::default(), injector);
    let sim_task = tokio::spawn(simulated.run(sim_shutdown_rx));

    let enable = matches.is_present("enable");
    let served = match matches.value_of("telemetry") {
        Some(path) => match File::create(path) {
            Ok(file) => serve(config, listener, host, JsonLinesSink::new(BufWriter::new(file)), enable).await,
            Err(e) => Err(e.into()),
        },
        None => serve(config, listener, host, TracingSink, enable).await,
    };

    sim_shutdown.send_replace(true);
    let fault_stats = sim_task.await?;
    info!(stats = ?fault_stats, "Simulator stopped");
    served
}

/// Run the monitor until ctrl-c. Once the monitor has started, every exit
/// path goes through [`MonitorHandle::shutdown`](hvbmu::MonitorHandle::shutdown).
async fn serve<S: TelemetrySink + 'static>(
    config: BmuConfig,
    listener: TcpListener,
    bus: MemoryBus,
    sink: S,
    enable: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (transmit, receive) = bus.split();
    let handle = Monitor::new(config, transmit, receive, Arc::new(RecordingActuator::new()), sink)?.start();
    let registry = handle.registry();
    if enable {
        registry.set_enable(true);
    }
    let tcp_server = tokio::spawn(supervisor::serve(listener, Arc::clone(&registry)));

    let interrupted = tokio::signal::ctrl_c().await;
    match &interrupted {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => error!(error = %e, "Unable to listen for interrupt, shutting down"),
    }
    tcp_server.abort();

    let summary = handle.shutdown().await?;
    info!(
        session = ?summary.session,
        receive = ?summary.receive,
        controller = ?summary.controller,
        "Battery monitor stopped"
    );
    interrupted?;
    Ok(())
}
