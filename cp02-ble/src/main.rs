//! Command line tool for CP02 chargers
//!
//! Scans for chargers, runs bridge commands, searches for the session token and
//! streams telemetry. `bridge` turns the tool into a JSON-lines front end for
//! other programs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cp02_ble_controller::BtleLink;
use cp02_node::{
    BridgeRequest, Config, Engine, EngineHandle, Host, JsonTokenFile, JsonValue, Link, TokenStorage,
    TokenStore,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "cp02-ble")]
#[command(about = "Talk to CP02 charging stations over BLE")]
struct Cli {
    /// Config file (default: $CP02_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Charger name or address substring to connect to
    #[arg(short, long, global = true)]
    target: Option<String>,

    /// Token to use instead of the stored one (decimal or 0x..)
    #[arg(long, global = true, value_parser = parse_byte)]
    token: Option<u8>,

    /// Do not search for the token automatically
    #[arg(long, global = true)]
    no_bruteforce: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for chargers
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Run one bridge command, e.g. `exec turn_on_port '{"port_id": 1}'`
    Exec {
        command: String,
        /// Parameters as a JSON object
        params: Option<String>,
    },
    /// Search for the session token
    Bruteforce {
        #[arg(long, default_value = "0", value_parser = parse_byte)]
        start: u8,
        #[arg(long, default_value = "255", value_parser = parse_byte)]
        end: u8,
    },
    /// Print telemetry as JSON lines until interrupted
    Monitor,
    /// Serve bridge requests as JSON lines on stdin/stdout
    Bridge,
    /// Inspect or edit stored tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// List stored tokens
    Show,
    /// Store a token for a charger address
    Set {
        address: String,
        #[arg(value_parser = parse_byte)]
        token: u8,
    },
    /// Forget the token of a charger address
    Clear { address: String },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?} is not a byte: {e}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if cli.target.is_some() {
        config.target = cli.target.clone();
    }
    if cli.token.is_some() {
        config.token = cli.token;
    }
    if cli.no_bruteforce {
        config.auto_bruteforce = false;
    }

    match cli.command {
        Commands::Scan { duration } => scan(&config, duration).await?,
        Commands::Exec { command, params } => {
            let params: JsonValue = match params {
                Some(params) => serde_json::from_str(&params)?,
                None => JsonValue::Null,
            };
            let host = Host::new(start_engine(config).await?);
            let response = host.handle(BridgeRequest::new(&command, params)).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Bruteforce { start, end } => {
            config.auto_bruteforce = false;
            let engine = start_engine(config).await?;
            println!("Searching 0x{start:02x}..=0x{end:02x}...");
            match engine.bruteforce(start..=end).await? {
                Some(token) => println!("Token found: 0x{token:02x} ({token})"),
                None => println!("No token accepted"),
            }
        }
        Commands::Monitor => {
            let engine = start_engine(config).await?;
            let mut telemetry = engine.subscribe();
            loop {
                tokio::select! {
                    event = telemetry.recv() => match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("dropped {n} telemetry events");
                        }
                        Err(_) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            engine.disconnect().await?;
        }
        Commands::Bridge => bridge(config).await?,
        Commands::Token { action } => token(action)?,
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save(&config_path)?;
                println!("Saved to {}", config_path.display());
            }
        }
    }

    Ok(())
}

async fn scan(config: &Config, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for chargers ({duration} seconds)...");
    let (mut link, _events) = BtleLink::new().await?;
    let found = link.scan(std::time::Duration::from_secs(duration)).await?;
    let filter = config.scan_filter();

    println!("\nFound {} devices:", found.len());
    for adv in &found {
        let name = adv.name.as_deref().unwrap_or("Unknown");
        let rssi = adv.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        let marker = if filter.matches(adv) { " [CP02]" } else { "" };
        println!("  {name} ({}) RSSI: {rssi}{marker}", adv.address);
    }
    Ok(())
}

async fn start_engine(config: Config) -> Result<EngineHandle, Box<dyn std::error::Error>> {
    let tokens = TokenStore::new(JsonTokenFile::new(Config::tokens_path()), config.token).shared();
    let (link, events) = BtleLink::new().await?;
    let engine = Engine::spawn(link, events, config, tokens);
    engine.connect(None).await?;
    if let Some(device) = engine.status().await?.device {
        log::info!("connected to {} ({})", device.name, device.address);
    }
    Ok(engine)
}

async fn bridge(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let engine = start_engine(config).await?;
    let host = Host::new(engine);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<BridgeRequest>(&line) {
            Ok(request) => host.handle(request).await,
            Err(e) => cp02_node::BridgeResponse::err(&cp02_node::Error::invalid_params("request", e.to_string())),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
    host.engine().disconnect().await?;
    Ok(())
}

fn token(action: TokenAction) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = JsonTokenFile::new(Config::tokens_path());
    match action {
        TokenAction::Show => {
            let records = file.records()?;
            if records.is_empty() {
                println!("No tokens stored in {}", file.path().display());
            }
            let mut records: Vec<_> = records.into_iter().collect();
            records.sort_by(|a, b| a.0.cmp(&b.0));
            for (address, record) in records {
                println!("  {address}  0x{:02x}  last used {}", record.token, record.last_used);
            }
        }
        TokenAction::Set { address, token } => {
            file.save(&address, token)?;
            println!("Stored 0x{token:02x} for {address}");
        }
        TokenAction::Clear { address } => {
            file.remove(&address)?;
            println!("Cleared token for {address}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_parse_as_decimal_or_hex() {
        assert_eq!(parse_byte("66"), Ok(66));
        assert_eq!(parse_byte("0x42"), Ok(0x42));
        assert_eq!(parse_byte("0XfF"), Ok(255));
        assert!(parse_byte("256").is_err());
        assert!(parse_byte("0xzz").is_err());
    }

    #[test]
    fn cli_parses_exec_with_global_flags() {
        let cli = Cli::try_parse_from(["cp02-ble", "exec", "turn_on_port", r#"{"port_id":1}"#, "--token", "0x42"]).unwrap();
        assert_eq!(cli.token, Some(0x42));
        assert!(matches!(cli.command, Commands::Exec { ref command, .. } if command == "turn_on_port"));
    }
}
