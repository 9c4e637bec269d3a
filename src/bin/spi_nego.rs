//! SPI transfer negotiation CLI.
//!
//! # Commands
//!
//! - `encode` - Encode a WDTR, SDTR or PPR message
//! - `decode` - Decode an extended message into a rate
//! - `reconcile` - Fold a local proposal and a target response
//! - `propose` - Show what the adapter would propose to a target
//! - `simulate` - Run connections against a simulated target

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use spi_nego::{
    config::Config,
    protocol::{
        decode_message, encode_ppr, encode_sdtr, encode_wdtr, reconcile, ProtocolOption,
        ProtocolOptions,
    },
    transport::{RecordingLink, SimulatedTarget, TargetProfile},
    Adapter, Command, RateRecord, VERSION,
};

#[derive(Parser)]
#[command(name = "spi-nego")]
#[command(version = VERSION)]
#[command(about = "SCSI parallel interface transfer negotiation", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a negotiation message as hex
    Encode {
        /// Message type (wdtr, sdtr, ppr)
        kind: String,

        /// Transfer period factor (e.g. 0x08 or 8)
        #[arg(short, long, default_value = "0x32")]
        period: String,

        /// REQ/ACK offset (0 = asynchronous)
        #[arg(short, long, default_value = "0")]
        offset: String,

        /// 16-bit transfers
        #[arg(short, long)]
        wide: bool,

        /// PPR protocol options (iu, dt, qas, wr-flow, rd-strm, rti, pcomp)
        #[arg(long, value_delimiter = ',')]
        options: Vec<String>,

        /// Encode for a command that is not tag-queued
        #[arg(long)]
        untagged: bool,
    },

    /// Decode an extended message (hex bytes) into JSON
    Decode {
        /// Hex bytes, e.g. "01 06 04 08 00 7f 01 07" (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Reconcile a local proposal with a target response
    Reconcile {
        /// Local rate as JSON, or a path to a JSON file
        #[arg(short, long)]
        local: String,

        /// Remote rate as JSON, or a path to a JSON file
        #[arg(short, long)]
        remote: String,
    },

    /// Show the rate and message family the adapter would propose
    Propose {
        /// Target id
        #[arg(short, long)]
        target: u8,

        /// Config file (default: user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Proposal for a command that is not tag-queued
        #[arg(long)]
        untagged: bool,
    },

    /// Run commands against a simulated target
    Simulate {
        /// Target profile as JSON file (default: a target matching the adapter)
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Target id
        #[arg(short, long, default_value = "0")]
        target: u8,

        /// Config file (default: user config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Commands to queue
        #[arg(short = 'n', long, default_value = "1")]
        commands: u64,

        /// Queue tagged commands
        #[arg(long)]
        tagged: bool,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Encode {
            kind,
            period,
            offset,
            wide,
            options,
            untagged,
        } => cmd_encode(&kind, &period, &offset, wide, &options, untagged),

        Commands::Decode {
            input,
            file,
            output,
        } => cmd_decode(input, file, output),

        Commands::Reconcile { local, remote } => cmd_reconcile(&local, &remote),

        Commands::Propose {
            target,
            config,
            untagged,
        } => cmd_propose(target, config, untagged),

        Commands::Simulate {
            profile,
            target,
            config,
            commands,
            tagged,
            output,
        } => cmd_simulate(profile, target, config, commands, tagged, output),
    }
}

fn init_logging(verbose: bool, log_json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

fn cmd_encode(
    kind: &str,
    period: &str,
    offset: &str,
    wide: bool,
    options: &[String],
    untagged: bool,
) -> anyhow::Result<()> {
    let options = options
        .iter()
        .map(|s| s.parse::<ProtocolOption>())
        .collect::<Result<ProtocolOptions, _>>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let rate = RateRecord {
        period: parse_byte(period)?,
        offset: parse_byte(offset)?,
        options,
        wide,
    };
    if !rate.is_valid() {
        tracing::warn!("{} is not a valid rate, encoding {}", rate, rate.normalized());
    }
    let rate = rate.normalized();

    let bytes = match kind.to_lowercase().as_str() {
        "wdtr" => encode_wdtr(&rate).to_vec(),
        "sdtr" => encode_sdtr(&rate).to_vec(),
        "ppr" => encode_ppr(&rate, !untagged).to_vec(),
        other => bail!("Unknown message type: {}. Use: wdtr, sdtr, ppr", other),
    };
    println!("{}", to_hex(&bytes));
    Ok(())
}

fn cmd_decode(
    input: Option<String>,
    file: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let content = read_input(input, file)?;
    let bytes = parse_hex(&content)?;
    let message = decode_message(&bytes)?;

    let value = json!({
        "kind": message.kind.to_string(),
        "rate": message.rate,
        "beyond_ceiling": message.beyond_ceiling,
    });
    write_output(output, &serde_json::to_string_pretty(&value)?)
}

fn cmd_reconcile(local: &str, remote: &str) -> anyhow::Result<()> {
    let local = read_rate(local).context("Invalid local rate")?;
    let remote = read_rate(remote).context("Invalid remote rate")?;
    let agreed = reconcile(&local.normalized(), &remote.normalized());
    println!("{}", serde_json::to_string_pretty(&agreed)?);
    Ok(())
}

fn cmd_propose(target: u8, config: Option<PathBuf>, untagged: bool) -> anyhow::Result<()> {
    let config = Config::load(config)?;
    let adapter = Adapter::new(&config)?;
    let (rate, strategy) = adapter.propose(target, !untagged)?;

    let value = json!({
        "target": target,
        "rate": rate,
        "strategy": strategy,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn cmd_simulate(
    profile: Option<PathBuf>,
    target: u8,
    config: Option<PathBuf>,
    commands: u64,
    tagged: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = Config::load(config)?;
    let mut adapter = Adapter::new(&config)?;
    let profile = match profile {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read profile {}", path.display()))?;
            serde_json::from_str::<TargetProfile>(&content)?
        },
        None => TargetProfile::new(config.adapter.max_rate),
    };

    let mut link = RecordingLink::default();
    for id in 0..commands {
        let mut cmd = Command::new(id, target);
        if tagged {
            cmd = cmd.tagged();
        }
        link.enqueue(cmd);
    }

    // Each connection is a fresh selection; only the link mode carries over
    let mut selection = profile.clone();
    let mut runs = Vec::new();
    let limit = commands.saturating_mul(4).max(4);
    while let Some(mut cmd) = link.next_command(target) {
        if runs.len() as u64 >= limit {
            bail!("Simulation did not settle after {} connections", limit);
        }
        let mut bus = SimulatedTarget::new(selection.clone());
        let result = adapter.run_connection(&mut cmd, &mut bus, &mut link);
        runs.push(match result {
            Ok(outcome) => json!({ "command": cmd.id, "outcome": outcome }),
            Err(e) => json!({ "command": cmd.id, "error": e.to_string() }),
        });

        selection = TargetProfile {
            packetized: bus.is_packetized(),
            parity_errors: 0,
            reject_identify: false,
            initiate: Vec::new(),
            ..profile.clone()
        };
    }

    let value = json!({
        "target": target,
        "connections": runs,
        "current": adapter.devices().get(target)?.current,
        "programmed": link.programmed,
        "aborts": link.aborts,
        "stats": adapter.stats(),
    });
    write_output(output, &serde_json::to_string_pretty(&value)?)
}

/// Parse a byte given as decimal or `0x` hex.
fn parse_byte(s: &str) -> anyhow::Result<u8> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    value.with_context(|| format!("Invalid byte value: {s}"))
}

/// Parse hex bytes, ignoring whitespace, commas, colons and `0x` prefixes.
fn parse_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = s
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != ':')
        .collect();
    if digits.is_empty() {
        bail!("No message bytes given");
    }
    if let Some(c) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("Invalid hex digit: {:?}", c);
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits: {}", digits);
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).with_context(|| format!("Invalid hex byte: {pair}"))
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_rate(arg: &str) -> anyhow::Result<RateRecord> {
    let content = if arg.trim_start().starts_with('{') {
        arg.to_string()
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("Failed to read {arg}"))?
    };
    Ok(serde_json::from_str(&content)?)
}

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        Ok(std::fs::read_to_string(path)?)
    } else if let Some(s) = input {
        if s == "-" {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        } else {
            Ok(s)
        }
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}

fn write_output(output: Option<PathBuf>, content: &str) -> anyhow::Result<()> {
    if let Some(path) = output {
        std::fs::write(path, content)?;
    } else {
        println!("{content}");
    }
    Ok(())
}
