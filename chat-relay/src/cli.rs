use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, fanning each message out to every other client.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Largest text or image payload accepted, in bytes.
    #[arg(long, env = "CHAT_RELAY_MAX_PAYLOAD", default_value_t = crate::codec::DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,

    /// Frames buffered per client before it is dropped as too slow.
    #[arg(long, env = "CHAT_RELAY_OUTBOUND_QUEUE", default_value_t = crate::config::DEFAULT_OUTBOUND_QUEUE)]
    pub outbound_queue: usize,

    /// Give up on a client whose socket takes longer than this to accept one frame.
    #[arg(long, env = "CHAT_RELAY_WRITE_TIMEOUT_MS")]
    pub write_timeout_ms: Option<u64>,
}

impl From<RelayArgs> for RelayConfig {
    fn from(args: RelayArgs) -> Self {
        Self {
            listen: args.listen,
            max_payload: args.max_payload,
            outbound_queue: args.outbound_queue,
            write_timeout: args.write_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    /// Directory where received images are written.
    #[arg(long)]
    pub save_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "relay",
            "--listen",
            "127.0.0.1:0",
            "--max-payload",
            "1024",
            "--outbound-queue",
            "8",
            "--write-timeout-ms",
            "250",
        ])
        .expect("valid arguments");

        let Command::Relay(args) = cli.command else {
            panic!("expected relay subcommand");
        };
        let config = RelayConfig::from(args);
        assert_eq!(config.listen, "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.max_payload, 1024);
        assert_eq!(config.outbound_queue, 8);
        assert_eq!(config.write_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn client_defaults_to_local_relay() {
        let cli = Cli::try_parse_from(["chat-relay", "client"]).expect("valid arguments");
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.server, "127.0.0.1:3000".parse().unwrap());
        assert!(args.save_dir.is_none());
    }
}
