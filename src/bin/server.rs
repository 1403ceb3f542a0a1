//! `rendezvous-server` — binds a port and pairs up clients that register against it.

use clap::Parser;
use log::error;

use holepunch_tunnel::error::ConfigError;
use holepunch_tunnel::rendezvous_server;

#[derive(Parser, Debug)]
#[command(name = "rendezvous-server", about = "TCP hole-punch rendezvous server")]
struct Args {
    /// Port to listen on for client registrations.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn parse_port(raw: Option<u16>) -> Result<u16, ConfigError> {
    let port = raw.ok_or(ConfigError::MissingFlag("port"))?;
    if port == 0 {
        return Err(ConfigError::InvalidPort(port.to_string()));
    }
    Ok(port)
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let port = match parse_port(args.port) {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rendezvous_server::run(port) {
        error!("rendezvous server exited: {}", e);
        std::process::exit(1);
    }
}
