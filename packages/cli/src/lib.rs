//! `wasmcc`: run one chaincode transaction locally.
//!
//! The world state is seeded from a JSON object, the transaction runs in a
//! pooled wasm instance exactly as it would under a peer, and the payload
//! and resulting world state are reported as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use wasmcc_ledger::MemoryLedger;
use wasmcc_runtime::{HostConfig, Invocation, WasmChaincode};

/// wasmcc - run a wasm chaincode transaction against an in-memory ledger
#[derive(Parser, Debug)]
#[command(name = "wasmcc")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Wasm module to run (defaults to $CHAINCODE_WASM_FILE)
    #[arg(long)]
    pub module: Option<PathBuf>,

    /// JSON host configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of pooled wasm instances
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Milliseconds to wait for a free instance
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Channel the transaction runs on
    #[arg(long, default_value = "mychannel")]
    pub channel: String,

    /// Transaction id (random if omitted)
    #[arg(long)]
    pub tx_id: Option<String>,

    /// JSON object of key/value strings to seed the world state with
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Transient data entry, as KEY=VALUE
    #[arg(long = "transient", value_parser = parse_key_val)]
    pub transient: Vec<(String, String)>,

    /// Contract function to invoke
    pub function: String,

    /// Function arguments
    pub args: Vec<String>,
}

impl Args {
    /// Host configuration: the config file or environment, then flags.
    pub fn host_config(&self) -> anyhow::Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::from_json_file(path)?,
            None => HostConfig::from_env()?,
        };
        if let Some(module) = &self.module {
            config.module_path = Some(module.clone());
        }
        if let Some(size) = self.pool_size {
            config.pool_size = size;
        }
        if let Some(ms) = self.timeout_ms {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    fn invocation(&self) -> Invocation {
        let tx_id = self
            .tx_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.transient.iter().fold(
            Invocation::new(&self.channel, tx_id, &self.function).with_args(self.args.clone()),
            |invocation, (key, value)| invocation.with_transient(key, value.as_bytes()),
        )
    }
}

/// Outcome of a transaction.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Report {
    pub tx_id: String,
    pub payload: String,
    pub world_state: BTreeMap<String, String>,
}

/// Run the transaction described by `args`.
pub async fn run(args: Args) -> anyhow::Result<Report> {
    let config = args.host_config()?;
    let ledger = match &args.state {
        Some(path) => load_world_state(path)?,
        None => MemoryLedger::new(),
    };

    let host = WasmChaincode::from_config(&config).context("cannot start chaincode host")?;
    let invocation = args.invocation();
    let tx_id = invocation.tx_id.clone();
    info!(tx_id = %tx_id, function = %invocation.function, "running transaction");

    let payload = host
        .invoke(Arc::new(ledger.clone()), invocation)
        .await
        .with_context(|| format!("transaction {} failed", tx_id))?;

    Ok(Report {
        tx_id,
        payload: String::from_utf8_lossy(&payload).into_owned(),
        world_state: ledger
            .world_state()
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
            .collect(),
    })
}

/// Seed a ledger from a JSON object of string keys and values.
pub fn load_world_state(path: &Path) -> anyhow::Result<MemoryLedger> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let entries: BTreeMap<String, String> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON object of strings", path.display()))?;
    Ok(MemoryLedger::with_world_state(entries))
}

fn parse_key_val(s: &str) -> anyhow::Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected KEY=VALUE, got {:?}", s),
    }
}
