use clap::builder::styling::AnsiColor;
use clap::builder::{PossibleValue, Styles};
use clap::Parser;

fn get_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::BrightGreen.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
}

/// Command-line interface definition for the scanner.
#[derive(Parser, Debug, Clone)]
#[command(styles=get_styles())]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long, default_value = "config.yaml")]
    pub config: String,

    /// Log level for application output. Overridden to off when the
    /// configuration disables logging.
    #[arg(
        long = "log",
        default_value = "info",
        value_parser([
            PossibleValue::new("debug"),
            PossibleValue::new("info"),
            PossibleValue::new("warn"),
            PossibleValue::new("error"),
            PossibleValue::new("trace"),
            PossibleValue::new("off"),
        ])
    )]
    pub log_level: String,

    /// Generate a Clash proxy list from an existing record file and exit.
    #[arg(long, help_heading = "Report")]
    pub clash: bool,

    /// Generate a TVGate proxy group from an existing record file and exit.
    #[arg(long, help_heading = "Report")]
    pub tvgate: bool,

    /// Record file to read. Defaults to the configured successful-IPs file.
    #[arg(short, long, help_heading = "Report")]
    pub input: Option<String>,

    /// Output YAML path. Defaults to filtered_proxies.yaml.
    #[arg(short, long, help_heading = "Report")]
    pub output: Option<String>,

    /// Proxy name prefix (Clash) or group name (TVGate).
    #[arg(short, long, default_value = "广东电信", help_heading = "Report")]
    pub name: String,

    /// Drop proxies whose recorded elapsed time is at least this many
    /// seconds. Zero disables the cut-off.
    #[arg(long, default_value = "0", help_heading = "Report")]
    pub maxsec: f64,
}
