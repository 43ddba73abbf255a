use std::path::PathBuf;

use blepush::{PayloadSource, PusherConfig, RearmPolicy};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "blepush")]
#[command(about = "Push a payload to BLE centrals as GATT notifications", long_about = None)]
pub struct Cli {
    /// JSON config file (falls back to $BLEPUSH_CONFIG, then defaults)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the peripheral on a simulated network with simulated centrals
    Serve(ServeArgs),

    /// Scan for the peripheral, then write and read its characteristic
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct TransferOverrides {
    /// Bytes per notification
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Milliseconds between blocks
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Push this many counter bytes (byte i = i mod 256)
    #[arg(long, conflicts_with_all = ["payload_hex", "payload_file"])]
    pub payload_len: Option<usize>,

    /// Push these hex-encoded bytes
    #[arg(long, conflicts_with = "payload_file")]
    pub payload_hex: Option<String>,

    /// Push the contents of this file
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// What re-advertising does to a transfer that is still running
    #[arg(long, value_enum)]
    pub rearm: Option<RearmArg>,
}

impl TransferOverrides {
    pub fn apply(&self, config: &mut PusherConfig) {
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }
        if let Some(len) = self.payload_len {
            config.payload = PayloadSource::Counter { len };
        }
        if let Some(data) = &self.payload_hex {
            config.payload = PayloadSource::Hex { data: data.clone() };
        }
        if let Some(path) = &self.payload_file {
            config.payload = PayloadSource::File { path: path.clone() };
        }
        if let Some(rearm) = self.rearm {
            config.rearm_policy = rearm.into();
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RearmArg {
    Reset,
    Reject,
}

impl From<RearmArg> for RearmPolicy {
    fn from(arg: RearmArg) -> Self {
        match arg {
            RearmArg::Reset => RearmPolicy::Reset,
            RearmArg::Reject => RearmPolicy::Reject,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub transfer: TransferOverrides,

    /// Number of simulated centrals to connect
    #[arg(long, default_value_t = 1)]
    pub centrals: usize,

    /// Delay between successive central connections, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub join_delay_ms: u64,

    /// Print transfer events as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub transfer: TransferOverrides,

    /// Seconds to scan before giving up
    #[arg(long, default_value_t = 2)]
    pub scan_secs: u64,

    /// Seconds to wait between each write and read
    #[arg(long, default_value_t = 1)]
    pub settle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_config_fields() {
        let cli = Cli::parse_from([
            "blepush",
            "serve",
            "--block-size",
            "20",
            "--payload-hex",
            "0a0b",
            "--rearm",
            "reject",
            "--centrals",
            "3",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let mut config = PusherConfig::default();
        args.transfer.apply(&mut config);

        assert_eq!(config.block_size, 20);
        assert_eq!(config.interval_ms, 60);
        assert_eq!(
            config.payload,
            PayloadSource::Hex {
                data: "0a0b".to_string()
            }
        );
        assert_eq!(config.rearm_policy, RearmPolicy::Reject);
        assert_eq!(args.centrals, 3);
    }

    #[test]
    fn test_conflicting_payload_flags_rejected() {
        let result = Cli::try_parse_from([
            "blepush",
            "serve",
            "--payload-len",
            "10",
            "--payload-hex",
            "00",
        ]);
        assert!(result.is_err());
    }
}
