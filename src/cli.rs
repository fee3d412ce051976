use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use btleplug::api::BDAddr;
use clap::{Parser, Subcommand};

fn parse_address(value: &str) -> Result<BDAddr, String> {
    BDAddr::from_str(value).map_err(|err| format!("{} is not a bluetooth address: {}", value, err))
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|err| err.to_string())
}

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Switches VR lighthouses (base stations) on and off over bluetooth.\n\nExample: lighthouse-power on AA:BB:CC:DD:EE:01", long_about = None)]
pub struct Cli {
    /// Path to the config file. Defaults to <exe>.json next to the executable if that exists,
    /// otherwise lighthouse-power.json in the user's config directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use two simulated lighthouses instead of the bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List the lighthouses in range
    Scan {
        /// Only list devices whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,

        /// How long to listen for advertisements
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        duration: Duration,
    },

    /// Switch a lighthouse on
    On {
        #[arg(value_parser = parse_address)]
        address: BDAddr,
    },

    /// Put a lighthouse to sleep
    Off {
        #[arg(value_parser = parse_address)]
        address: BDAddr,
    },

    /// Put a V2 lighthouse in standby: the motor keeps spinning, the lasers are off
    Standby {
        #[arg(value_parser = parse_address)]
        address: BDAddr,
    },

    /// Blink the LED of a V2 lighthouse
    Identify {
        #[arg(value_parser = parse_address)]
        address: BDAddr,
    },

    /// Print the firmware, model, channel and power state of a lighthouse
    Info {
        #[arg(value_parser = parse_address)]
        address: BDAddr,
    },

    /// Keep watching every configured and discovered lighthouse until interrupted
    Run,

    /// Scan for lighthouses and optionally remember them in the config file
    Discover {
        /// How long to listen for advertisements
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        duration: Duration,

        /// Add the lighthouses that were found to the config file
        #[arg(long)]
        save: bool,
    },
}
