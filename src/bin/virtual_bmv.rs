use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use virtual_bmv::bus::{BusTransport, MemoryBus, TcpBus};
use virtual_bmv::config::BridgeOptions;
use virtual_bmv::device::SERVICE_NAME;
use virtual_bmv::plugin::{VirtualBmvPlugin, PLUGIN_NAME};
use virtual_bmv::status::TracingSink;
use virtual_bmv::telemetry::SharedTelemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("virtual-bmv")
        .version("0.1.0")
        .author("Marine Systems Engineering Team")
        .about("🔋 Virtual BMV-602S - feeds external battery telemetry into a Venus OS bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Plugin options as JSON")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Venus OS hostname or IP")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bus port")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(p) if p > 0 => Ok(()),
                    _ => Err("Port must be between 1 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("MS")
                .help("Update interval in milliseconds")
                .takes_value(true)
                .validator(|v| match v.parse::<f64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Interval must be a number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("product-name")
                .long("product-name")
                .value_name("NAME")
                .help("Product name shown in Venus/VRM")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("telemetry")
                .short("t")
                .long("telemetry")
                .value_name("FILE")
                .help("Initial telemetry snapshot (full-model JSON document)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("deltas")
                .long("deltas")
                .help("Read telemetry delta lines from stdin"),
        )
        .arg(
            Arg::with_name("bus")
                .long("bus")
                .value_name("KIND")
                .help("Bus transport")
                .takes_value(true)
                .possible_values(&["tcp", "memory"])
                .default_value("tcp"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("schema")
                .about("📄 Print the plugin options schema")
        )
        .subcommand(
            SubCommand::with_name("options")
                .about("🔧 Print the effective options after file and flag overrides")
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match matches.subcommand() {
        ("schema", _) => {
            println!("{}", serde_json::to_string_pretty(&VirtualBmvPlugin::<TcpBus>::schema())?);
            return Ok(());
        }
        ("options", _) => {
            let options = load_options(&matches)?;
            println!("{}", serde_json::to_string_pretty(&options)?);
            return Ok(());
        }
        _ => {}
    }

    let options = load_options(&matches)?;
    let telemetry = SharedTelemetry::new();
    if let Some(path) = matches.value_of("telemetry") {
        let document: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let loaded = telemetry.load_document(&document);
        info!("Loaded {} telemetry values from {}", loaded, path);
    }
    if matches.is_present("deltas") {
        tokio::spawn(feed_deltas(telemetry.clone()));
    }

    match matches.value_of("bus") {
        Some("memory") => run(MemoryBus::new(), options, telemetry).await,
        _ => run(TcpBus, options, telemetry).await,
    }
}

fn load_options(matches: &ArgMatches) -> Result<BridgeOptions, Box<dyn std::error::Error>> {
    let mut options = match matches.value_of("config") {
        Some(path) => BridgeOptions::from_json(&std::fs::read_to_string(path)?)?,
        None => BridgeOptions::default(),
    };
    if let Some(host) = matches.value_of("host") {
        options.venus_host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        options.port = port.parse()?;
    }
    if let Some(interval) = matches.value_of("interval") {
        options.interval = Some(interval.parse()?);
    }
    if let Some(name) = matches.value_of("product-name") {
        options.product_name = name.to_string();
    }
    options.validate()?;
    Ok(options)
}

async fn feed_deltas(telemetry: SharedTelemetry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = telemetry.apply_line(trimmed) {
                    warn!("Ignoring malformed telemetry delta: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading telemetry deltas: {}", e);
                break;
            }
        }
    }
    info!("Telemetry delta input closed");
}

async fn run<T: BusTransport + Clone>(
    transport: T,
    options: BridgeOptions,
    telemetry: SharedTelemetry,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", format!("🔋 {}", PLUGIN_NAME).bright_blue().bold());
    println!("{} {}", "Bus:".dimmed(), options.address().to_string().bright_white());
    println!("{} {}", "Service:".dimmed(), SERVICE_NAME.bright_cyan());

    let mut plugin = VirtualBmvPlugin::new(transport, Arc::new(telemetry), Arc::new(TracingSink));
    if let Err(e) = plugin.start(&options).await {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        return Err(e.into());
    }
    println!("{} {}", "✅".green(), "Virtual BMV running (Press Ctrl+C to stop)".bright_green());

    tokio::signal::ctrl_c().await?;

    println!("{}", "🛑 Stopping virtual BMV...".yellow());
    if let Some(report) = plugin.stop().await {
        println!(
            "{} {} samples, {} calls answered, {} objects unexported",
            "✅".green(),
            report.ticks,
            report.calls_answered,
            report.unexported
        );
    }
    Ok(())
}
