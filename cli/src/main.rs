use std::rc::Rc;

use clap::Parser;
use log::LevelFilter;
use stakker::{actor, call, ret_nop, Ret};

use resolver::{DnsConfig, DohTransport, ReqwestDohTransport, ResolveOutcome, Registry};

/// Resolve a mining-pool hostname through the authoritative-first strategy,
/// printing the chosen address on success.
#[derive(Parser)]
struct Args {
	/// Hostname (or IP literal) to resolve.
	host: String,

	/// Path to a JSON config file holding a `dns` object; see `DnsConfig`
	/// for the recognized keys. Falls back to built-in defaults if omitted
	/// or unreadable.
	#[arg(long)]
	config: Option<std::path::PathBuf>,

	#[arg(short, long)]
	verbose: bool,
}

fn load_config(path: Option<&std::path::Path>) -> DnsConfig {
	let Some(path) = path else { return DnsConfig::default() };

	let Ok(text) = std::fs::read_to_string(path) else {
		log::warn!("could not read config file {}, using defaults", path.display());
		return DnsConfig::default();
	};

	let Ok(document) = serde_json::from_str::<serde_json::Value>(&text) else {
		log::warn!("could not parse config file {} as JSON, using defaults", path.display());
		return DnsConfig::default();
	};

	match document.get("dns") {
		Some(dns) => serde_json::from_value(dns.clone()).unwrap_or_else(|err| {
			log::warn!("invalid `dns` config ({err}), using defaults");
			DnsConfig::default()
		}),
		None => DnsConfig::default(),
	}
}

static LOGGER: runtime::logger::Logger = runtime::logger::Logger;

fn main() {
	let args = Args::parse();

	log::set_logger(&LOGGER).expect("logger is only installed once");
	log::set_max_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });

	let config = load_config(args.config.as_deref());

	let mut stakker = runtime::init();

	let doh: Rc<dyn DohTransport> = Rc::new(ReqwestDohTransport::new());
	let registry = actor!(stakker, Registry::init(doh), ret_nop!());

	let host = args.host.clone();
	call!(
		[registry],
		resolve(
			host,
			config,
			Ret::new(move |outcome: ResolveOutcome| match (outcome.status, outcome.records.get()) {
				(0, Some(record)) => println!("{}", record.ip()),
				_ => {
					eprintln!("resolution failed: {}", outcome.error_message.as_deref().unwrap_or("unknown error"));
					std::process::exit(1);
				}
			})
		)
	);

	runtime::exec(&mut stakker, || {}).expect("event loop failed");
}
