use crate::mqtt::MqttConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::time::Duration;
use ws3000_lib::{
    protocol::{self as proto, FrameLayout},
    session::{self, Platform},
};

fn parse_usb_id(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid USB id format: {e}"))
}

fn parse_interface(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid interface number format: {e}"))
}

fn parse_max_tries(s: &str) -> Result<u8, String> {
    let tries = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid number of tries: {e}"))?;
    if tries == 0 {
        return Err("At least one try is required".to_string());
    }
    Ok(tries)
}

fn parse_platform(s: &str) -> Result<Platform, String> {
    s.parse::<Platform>().map_err(|e| e.to_string())
}

fn parse_layout(s: &str) -> Result<FrameLayout, String> {
    s.parse::<FrameLayout>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read the sensors and print the values to the standard output (console).
    Console,
    /// Continuously read the sensors and publish the values to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: continuously poll the sensors at a specified interval.
    /// Output can be directed to stdout or an MQTT broker.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval for polling the sensors (e.g., "10s", "1m")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "10s", verbatim_doc_comment)]
        poll_interval: Duration,

        /// Also set the console clock at startup and every 12 hours.
        #[arg(long)]
        sync_time: bool,

        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Read and display the console configuration (temperature units).
    ReadConfig,

    /// Read and display the current values of all sensor channels.
    Read,

    /// Set the console clock to the local time of this host.
    SyncTime,
}

const fn about_text() -> &'static str {
    "WS-3000 weather console CLI - Read the temperature/humidity sensors of a WS-3000 console over USB."
}

#[derive(Parser, Debug)]
#[command(name="ws3000mqtt", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: CliCommands,

    /// USB vendor id of the console, decimal or hexadecimal (e.g. "0x0483").
    #[arg(global = true, long, default_value_t = session::DEFAULT_VENDOR_ID, value_parser = parse_usb_id, verbatim_doc_comment)]
    pub vendor_id: u16,

    /// USB product id of the console, decimal or hexadecimal (e.g. "0x5750").
    #[arg(global = true, long, default_value_t = session::DEFAULT_PRODUCT_ID, value_parser = parse_usb_id, verbatim_doc_comment)]
    pub product_id: u16,

    /// USB interface number to claim.
    #[arg(global = true, long, default_value_t = session::DEFAULT_INTERFACE, value_parser = parse_interface)]
    pub interface: u8,

    /// USB I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Delay between reopening the device and retrying a failed command.
    /// Examples: "5s", "500ms".
    #[arg(global = true, long, default_value = "5s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub wait_before_retry: Duration,

    /// Number of attempts per command before giving up.
    #[arg(global = true, long, default_value_t = session::DEFAULT_MAX_TRIES, value_parser = parse_max_tries)]
    pub max_tries: u8,

    /// Size of one USB packet read from the console.
    #[arg(global = true, long, default_value_t = proto::DEFAULT_PACKET_SIZE)]
    pub packet_size: usize,

    /// Host platform quirks to apply: "linux", "macos" or "windows".
    /// Defaults to the platform this program was built for.
    #[arg(global = true, long, default_value_t = Platform::current(), value_parser = parse_platform, verbatim_doc_comment)]
    pub platform: Platform,

    /// Response framing of the console firmware: "stripped" (newer) or "enclosed" (older).
    #[arg(global = true, long, default_value_t = FrameLayout::default(), value_parser = parse_layout, verbatim_doc_comment)]
    pub layout: FrameLayout,
}

impl CliArgs {
    pub fn session_settings(&self) -> session::SessionSettings {
        session::SessionSettings {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface: self.interface,
            timeout: self.timeout,
            wait_before_retry: self.wait_before_retry,
            max_tries: self.max_tries,
            packet_size: self.packet_size,
            platform: self.platform,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ws3000_lib::poll::DEFAULT_POLL_INTERVAL;

    #[test]
    fn defaults_match_session_defaults() {
        let args = CliArgs::try_parse_from(["ws3000mqtt", "read"]).expect("valid arguments");
        assert_eq!(args.command, CliCommands::Read);
        assert_eq!(args.session_settings(), session::SessionSettings::default());
    }

    #[test]
    fn global_flags_after_command() {
        let args = CliArgs::try_parse_from([
            "ws3000mqtt",
            "read-config",
            "--vendor-id",
            "0x1234",
            "--max-tries",
            "5",
            "--platform",
            "windows",
            "--layout",
            "enclosed",
            "--timeout",
            "250ms",
        ])
        .expect("valid arguments");
        let settings = args.session_settings();
        assert_eq!(settings.vendor_id, 0x1234);
        assert_eq!(settings.max_tries, 5);
        assert_eq!(settings.platform, Platform::Windows);
        assert_eq!(settings.layout, FrameLayout::Enclosed);
        assert_eq!(settings.timeout, Duration::from_millis(250));
    }

    #[test]
    fn daemon_arguments() {
        let args = CliArgs::try_parse_from([
            "ws3000mqtt",
            "daemon",
            "--poll-interval",
            "30s",
            "--sync-time",
            "mqtt",
        ])
        .expect("valid arguments");
        assert_matches!(
            args.command,
            CliCommands::Daemon {
                poll_interval,
                sync_time: true,
                output: DaemonOutput::Mqtt { config_file },
            } if poll_interval == Duration::from_secs(30) && config_file == MqttConfig::DEFAULT_CONFIG_FILE
        );

        let args =
            CliArgs::try_parse_from(["ws3000mqtt", "daemon", "console"]).expect("valid arguments");
        assert_matches!(
            args.command,
            CliCommands::Daemon {
                poll_interval,
                sync_time: false,
                output: DaemonOutput::Console,
            } if poll_interval == DEFAULT_POLL_INTERVAL
        );
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(CliArgs::try_parse_from(["ws3000mqtt", "read", "--max-tries", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["ws3000mqtt", "read", "--platform", "amiga"]).is_err());
        assert!(CliArgs::try_parse_from(["ws3000mqtt", "read", "--layout", "x"]).is_err());
        assert!(CliArgs::try_parse_from(["ws3000mqtt", "read", "--product-id", "0x1ffff"]).is_err());
    }
}
