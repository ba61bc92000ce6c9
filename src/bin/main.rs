//! dnssd-query binary entry point.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hickory_proto::rr::{Name, RecordType};
use mdns_querier::lookup::query_message;
use mdns_querier::options::Options;
use mdns_querier::{telemetry, Config, Executors, Lookup, MulticastDnsQuerier, Resolver};
use tracing::{error, info};

/// Query multicast DNS and unicast nameservers and print the merged answer.
#[derive(Parser, Debug)]
#[command(name = "dnssd-query")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the overall timeout, in milliseconds.
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Treat NAME as a service type and list its instances.
    #[arg(short, long, conflicts_with = "record_type")]
    browse: bool,

    /// Name to query, e.g. `printer.local.` or `_ipp._tcp.local.`.
    name: String,

    /// Record type.
    #[arg(default_value = "A")]
    record_type: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = ?args.config,
        name = %args.name,
        record_type = %args.record_type,
        "Starting dnssd-query"
    );

    let executors = Executors::new(&config.executors)?;
    let options = Options::new(&config.telemetry);
    let _repoll = options.schedule(executors.scheduler())?;

    let querier = Arc::new(MulticastDnsQuerier::new(&config, Arc::clone(&executors))?);
    if let Some(ms) = args.timeout_ms {
        querier.set_timeout(Duration::from_millis(ms));
    }

    let result = if args.browse {
        browse(&querier, &args.name)
    } else {
        query(&querier, &args.name, &args.record_type)
    };

    querier.close();
    executors.shutdown();

    if let Err(e) = result {
        error!("query failed: {}", e);
        return Err(e);
    }
    Ok(())
}

fn query(
    querier: &Arc<MulticastDnsQuerier>,
    name: &str,
    record_type: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())?;
    let mut name = Name::from_str(name)?;
    name.set_fqdn(true);

    let response = querier.send(&query_message(name, record_type))?;
    println!(";; status: {:?}", response.response_code());
    for record in response.answers() {
        println!("{record}");
    }
    if !response.additionals().is_empty() {
        println!(";; additional");
        for record in response.additionals() {
            println!("{record}");
        }
    }
    Ok(())
}

fn browse(
    querier: &Arc<MulticastDnsQuerier>,
    service_type: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let lookup = Lookup::new(Arc::clone(querier) as Arc<dyn Resolver>);
    let services = lookup.browse(service_type)?;
    if services.is_empty() {
        println!(";; no instances of {service_type}");
    }
    for service in services {
        match service.instance() {
            Some(instance) => println!("{instance}\t{}\t{}", service.service_type(), service.domain()),
            None => println!("{service}"),
        }
    }
    Ok(())
}
