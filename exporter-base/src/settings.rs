//! Process settings from environment variables and the chain configuration
//! from TOML, with `${VAR}` interpolation applied to the raw file text
//! before parsing. Unknown keys are rejected with the offending field name.

use std::collections::HashSet;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::FileFormat;
use ethers_core::types::{H160, U256};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use exporter_core::{AccountSpec, ChainSpec, ContractAccountSpec, ContractSpec};

pub const ENV_CONFIG_PATH: &str = "BLOCKCHAIN_EXPORTER_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
pub const ENV_POLL_DEFAULT_INTERVAL: &str = "POLL_DEFAULT_INTERVAL";
pub const ENV_MAX_FAILURE_BACKOFF: &str = "MAX_FAILURE_BACKOFF_SECONDS";
pub const ENV_RPC_REQUEST_TIMEOUT: &str = "RPC_REQUEST_TIMEOUT_SECONDS";
pub const ENV_READINESS_STALE_THRESHOLD: &str = "READINESS_STALE_THRESHOLD_SECONDS";
pub const ENV_HEALTH_PORT: &str = "HEALTH_PORT";
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";
pub const ENV_WARM_POLL: &str = "WARM_POLL_ENABLED";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no .toml config files found at {0}")]
    NoConfigFiles(PathBuf),

    #[error("unexpanded placeholder ${{{name}}}: environment variable not set")]
    UnexpandedPlaceholder { name: String },

    #[error("invalid config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("duplicate blockchain name `{0}`")]
    DuplicateChain(String),

    #[error("invalid address `{value}` for {context}")]
    InvalidAddress { context: String, value: String },

    #[error("invalid duration `{value}` for {context}: {source}")]
    InvalidDuration {
        context: String,
        value: String,
        source: humantime::DurationError,
    },

    #[error("invalid value for {name}: {message}")]
    InvalidEnv { name: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected `text` or `json`, got `{other}`")),
        }
    }
}

/// Operational tuning resolved once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub config_path: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub poll_default_interval: Duration,
    pub max_failure_backoff: Duration,
    pub rpc_request_timeout: Duration,
    pub readiness_stale_threshold: Duration,
    pub health_port: u16,
    pub metrics_port: u16,
    pub warm_poll: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_default_interval = env_duration_str(ENV_POLL_DEFAULT_INTERVAL, "5m")?;
        let max_failure_backoff =
            Duration::from_secs(env_parse::<u64>(ENV_MAX_FAILURE_BACKOFF, 900)?);
        let timeout_secs = env_parse::<f64>(ENV_RPC_REQUEST_TIMEOUT, 10.0)?;
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(ConfigError::InvalidEnv {
                name: ENV_RPC_REQUEST_TIMEOUT.into(),
                message: "must be a positive number of seconds".into(),
            });
        }
        Ok(Self {
            config_path: PathBuf::from(env_string(ENV_CONFIG_PATH, "./config.toml")),
            log_level: env_string(ENV_LOG_LEVEL, "INFO"),
            log_format: env_from_str(ENV_LOG_FORMAT, LogFormat::Text)?,
            poll_default_interval,
            max_failure_backoff,
            rpc_request_timeout: Duration::from_secs_f64(timeout_secs),
            readiness_stale_threshold: Duration::from_secs(env_parse::<u64>(
                ENV_READINESS_STALE_THRESHOLD,
                300,
            )?),
            health_port: env_parse::<u16>(ENV_HEALTH_PORT, 8080)?,
            metrics_port: env_parse::<u16>(ENV_METRICS_PORT, 9100)?,
            warm_poll: env_bool(ENV_WARM_POLL, false)?,
        })
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.parse::<T>().map_err(|e| ConfigError::InvalidEnv {
            name: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_from_str<T: FromStr<Err = String>>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse::<T>().map_err(|message| ConfigError::InvalidEnv {
            name: name.into(),
            message,
        }),
        Err(_) => Ok(default),
    }
}

fn env_duration_str(name: &str, default: &str) -> Result<Duration, ConfigError> {
    let value = env_string(name, default);
    humantime::parse_duration(&value).map_err(|source| ConfigError::InvalidDuration {
        context: name.into(),
        value,
        source,
    })
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::InvalidEnv {
                name: name.into(),
                message: format!("expected a boolean, got `{other}`"),
            }),
        },
        Err(_) => Ok(default),
    }
}

// -- chain configuration -----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    blockchains: Vec<RawChain>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChain {
    name: String,
    rpc_url: String,
    poll_interval: Option<String>,
    transfer_lookback_blocks: Option<u64>,
    #[serde(default)]
    accounts: Vec<RawAccount>,
    #[serde(default)]
    contracts: Vec<RawContract>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccount {
    name: String,
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContract {
    name: String,
    address: String,
    transfer_lookback_blocks: Option<u64>,
    #[serde(default)]
    accounts: Vec<RawContractAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContractAccount {
    name: String,
    address: String,
    token_ids: Option<Vec<u64>>,
}

/// Load and validate the chain configuration the settings point at.
pub fn load_chain_specs(settings: &Settings) -> Result<Vec<ChainSpec>, ConfigError> {
    let raw = load_raw(&settings.config_path)?;
    validate(raw)
}

fn load_raw(path: &Path) -> Result<RawConfig, ConfigError> {
    let meta = fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return parse_one(path);
    }

    // Directory: every *.toml inside, lexicographic, chain lists concatenated.
    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(ConfigError::NoConfigFiles(path.to_path_buf()));
    }

    let mut merged = RawConfig {
        blockchains: Vec::new(),
    };
    for file in files {
        let mut part = parse_one(&file)?;
        merged.blockchains.append(&mut part.blockchains);
    }
    Ok(merged)
}

fn parse_one(path: &Path) -> Result<RawConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let expanded = interpolate(&text, |name| env::var(name).ok())?;
    let cfg = config::Config::builder()
        .add_source(config::File::from_str(&expanded, FileFormat::Toml))
        .build()?;
    Ok(cfg.try_deserialize::<RawConfig>()?)
}

/// Expand `${VAR}` placeholders. A variable missing from the environment is a
/// fatal config error, not a silently-kept placeholder.
fn interpolate(
    text: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
    });
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for capture in PLACEHOLDER.captures_iter(text) {
        let whole = capture.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let name = &capture[1];
        let value = lookup(name).ok_or_else(|| ConfigError::UnexpandedPlaceholder {
            name: name.to_string(),
        })?;
        out.push_str(&text[last..whole.0]);
        out.push_str(&value);
        last = whole.1;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn validate(raw: RawConfig) -> Result<Vec<ChainSpec>, ConfigError> {
    let mut seen = HashSet::new();
    let mut chains = Vec::with_capacity(raw.blockchains.len());
    for chain in raw.blockchains {
        if !seen.insert(chain.name.clone()) {
            return Err(ConfigError::DuplicateChain(chain.name));
        }
        let poll_interval = chain
            .poll_interval
            .map(|value| {
                humantime::parse_duration(&value).map_err(|source| ConfigError::InvalidDuration {
                    context: format!("blockchains.{}.poll_interval", chain.name),
                    value,
                    source,
                })
            })
            .transpose()?;

        let mut accounts = Vec::with_capacity(chain.accounts.len());
        for account in chain.accounts {
            accounts.push(AccountSpec {
                address: parse_address(
                    &account.address,
                    &format!("account `{}` on `{}`", account.name, chain.name),
                )?,
                name: account.name,
            });
        }

        let mut contracts = Vec::with_capacity(chain.contracts.len());
        for contract in chain.contracts {
            let mut contract_accounts = Vec::with_capacity(contract.accounts.len());
            for account in contract.accounts {
                contract_accounts.push(ContractAccountSpec {
                    address: parse_address(
                        &account.address,
                        &format!(
                            "account `{}` on contract `{}` of `{}`",
                            account.name, contract.name, chain.name
                        ),
                    )?,
                    name: account.name,
                    token_ids: account
                        .token_ids
                        .unwrap_or_default()
                        .into_iter()
                        .map(U256::from)
                        .collect(),
                });
            }
            contracts.push(ContractSpec {
                address: parse_address(
                    &contract.address,
                    &format!("contract `{}` on `{}`", contract.name, chain.name),
                )?,
                name: contract.name,
                transfer_lookback_blocks: contract.transfer_lookback_blocks,
                accounts: contract_accounts,
            });
        }

        chains.push(ChainSpec {
            name: chain.name,
            rpc_url: chain.rpc_url,
            poll_interval,
            transfer_lookback_blocks: chain.transfer_lookback_blocks.unwrap_or(0),
            accounts,
            contracts,
        });
    }
    Ok(chains)
}

fn parse_address(value: &str, context: &str) -> Result<H160, ConfigError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.len() != 40 {
        return Err(ConfigError::InvalidAddress {
            context: context.to_string(),
            value: value.to_string(),
        });
    }
    let bytes = hex::decode(digits).map_err(|_| ConfigError::InvalidAddress {
        context: context.to_string(),
        value: value.to_string(),
    })?;
    Ok(H160::from_slice(&bytes))
}

/// Re-serialise resolved chains as TOML. Used by the `config` CLI command;
/// the output parses back to an identical chain list.
pub fn render_chains_toml(chains: &[ChainSpec]) -> String {
    let mut out = String::new();
    for chain in chains {
        let _ = writeln!(out, "[[blockchains]]");
        let _ = writeln!(out, "name = {}", quote(&chain.name));
        let _ = writeln!(out, "rpc_url = {}", quote(&chain.rpc_url));
        if let Some(interval) = chain.poll_interval {
            let _ = writeln!(
                out,
                "poll_interval = {}",
                quote(&humantime::format_duration(interval).to_string())
            );
        }
        if chain.transfer_lookback_blocks > 0 {
            let _ = writeln!(
                out,
                "transfer_lookback_blocks = {}",
                chain.transfer_lookback_blocks
            );
        }
        for account in &chain.accounts {
            let _ = writeln!(out, "\n[[blockchains.accounts]]");
            let _ = writeln!(out, "name = {}", quote(&account.name));
            let _ = writeln!(out, "address = {}", quote(&format!("{:#x}", account.address)));
        }
        for contract in &chain.contracts {
            let _ = writeln!(out, "\n[[blockchains.contracts]]");
            let _ = writeln!(out, "name = {}", quote(&contract.name));
            let _ = writeln!(
                out,
                "address = {}",
                quote(&format!("{:#x}", contract.address))
            );
            if let Some(lookback) = contract.transfer_lookback_blocks {
                let _ = writeln!(out, "transfer_lookback_blocks = {lookback}");
            }
            for account in &contract.accounts {
                let _ = writeln!(out, "\n[[blockchains.contracts.accounts]]");
                let _ = writeln!(out, "name = {}", quote(&account.name));
                let _ = writeln!(
                    out,
                    "address = {}",
                    quote(&format!("{:#x}", account.address))
                );
                if !account.token_ids.is_empty() {
                    let ids: Vec<String> =
                        account.token_ids.iter().map(|id| id.to_string()).collect();
                    let _ = writeln!(out, "token_ids = [{}]", ids.join(", "));
                }
            }
        }
        let _ = writeln!(out);
    }
    out
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
