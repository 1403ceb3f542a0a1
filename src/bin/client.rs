//! `rendezvous-client` — registers with a rendezvous server, punches (or relays) through to its
//! peer, then forwards local connections on `--forward-port` across the tunnel.

use clap::Parser;
use log::error;

use holepunch_tunnel::error::ConfigError;
use holepunch_tunnel::rendezvous_client;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "rendezvous-client", about = "TCP hole-punch tunnel client", disable_help_flag = true)]
struct Args {
    /// Rendezvous server hostname or address.
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Rendezvous server port.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Local port to accept forwarded connections on and to dial when the peer opens a channel.
    ///
    /// The documented short form is the two-character `-fp`, which `clap` cannot express
    /// directly (short options are single characters, and `alias` only adds long-form spellings);
    /// `-fp` is rewritten to `--forward-port` by `rewrite_short_multichar_flags` before this
    /// struct is parsed.
    #[arg(long = "forward-port")]
    forward_port: Option<u16>,

    /// Seconds to keep retrying the public/private dial race before falling back to relay.
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,
}

/// Rewrites the two-character short flag `-fp` to `--forward-port` ahead of parsing.
///
/// `clap` short options are always a single character, so `--forward-port`'s documented `-fp`
/// alias cannot be declared as a short option, and `alias = "fp"` on an `#[arg]` registers a
/// *long* alias (`--fp`) rather than the `-fp` the CLI table promises. This pre-pass over the
/// raw argv is the simplest way to honor `-fp` literally without hand-rolling the rest of the
/// flag grammar.
fn rewrite_short_multichar_flags(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .map(|arg| if arg == "-fp" { "--forward-port".to_string() } else { arg })
        .collect()
}

fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

struct Config {
    host: String,
    port: u16,
    forward_port: u16,
    timeout: u64,
}

fn parse_config(args: Args) -> Result<Config, ConfigError> {
    let host = args.host.ok_or(ConfigError::MissingFlag("host"))?;
    let port = args.port.ok_or(ConfigError::MissingFlag("port"))?;
    if port == 0 {
        return Err(ConfigError::InvalidPort(port.to_string()));
    }
    let forward_port = args.forward_port.ok_or(ConfigError::MissingFlag("forward-port"))?;
    if forward_port == 0 {
        return Err(ConfigError::InvalidPort(forward_port.to_string()));
    }
    Ok(Config {
        host,
        port,
        forward_port,
        timeout: args.timeout,
    })
}

fn main() {
    let argv = rewrite_short_multichar_flags(std::env::args().collect());
    let args = Args::parse_from(argv);
    init_logging(args.verbose);

    let config = match parse_config(args) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rendezvous_client::run(&config.host, config.port, config.forward_port, config.timeout) {
        error!("client exited: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_turns_fp_into_the_long_flag() {
        let argv = vec!["rendezvous-client".to_string(), "-fp".to_string(), "9000".to_string()];
        let rewritten = rewrite_short_multichar_flags(argv);
        assert_eq!(rewritten, vec!["rendezvous-client", "--forward-port", "9000"]);
    }

    #[test]
    fn rewrite_leaves_other_flags_untouched() {
        let argv = vec!["rendezvous-client".to_string(), "-h".to_string(), "example.com".to_string()];
        let rewritten = rewrite_short_multichar_flags(argv.clone());
        assert_eq!(rewritten, argv);
    }

    #[test]
    fn dash_fp_parses_the_same_as_the_long_flag() {
        let argv = rewrite_short_multichar_flags(vec![
            "rendezvous-client".to_string(),
            "-h".to_string(),
            "example.com".to_string(),
            "-p".to_string(),
            "4242".to_string(),
            "-fp".to_string(),
            "9000".to_string(),
        ]);
        let args = Args::parse_from(argv);
        assert_eq!(args.forward_port, Some(9000));
    }
}
