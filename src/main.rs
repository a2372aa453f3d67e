use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bitcoin::consensus::deserialize;
use bitcoin::{ScriptBuf, Transaction, Txid};
use clap::{Parser, Subcommand};

use zeroconf_index::chain::MemoryChain;
use zeroconf_index::fetcher::{ElectrumFetcher, TxFetcher};
use zeroconf_index::ledger::AddressLedger;
use zeroconf_index::mempool::MempoolView;
use zeroconf_index::store::persistence::load_or_create;
use zeroconf_index::{IndexConfig, IndexService, ScriptAddress};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON file with index settings; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a transaction through Electrum and decode it.
    Fetch {
        #[arg(long, default_value = "ssl://electrum.blockstream.info:60002")]
        electrum_url: String,

        #[arg(long)]
        txid: Txid,
    },

    /// Broadcast a raw transaction and wait for the network to relay it back.
    Broadcast {
        #[arg(long, default_value = "ssl://electrum.blockstream.info:60002")]
        electrum_url: String,

        /// Consensus-encoded transaction, hex.
        #[arg(long)]
        raw: String,

        #[arg(long, default_value = "index_snapshot.json")]
        store: PathBuf,
    },

    /// Print balances and history pages of an address from a store snapshot.
    Inspect {
        #[arg(long, default_value = "index_snapshot.json")]
        store: PathBuf,

        /// Output script, hex.
        #[arg(long)]
        script: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => IndexConfig::from_json_file(path)?,
        None => IndexConfig::default(),
    };

    match args.command {
        Command::Fetch { electrum_url, txid } => run_fetch(&config, &electrum_url, txid),
        Command::Broadcast {
            electrum_url,
            raw,
            store,
        } => run_broadcast(config, &electrum_url, &raw, &store),
        Command::Inspect { store, script } => run_inspect(&config, &store, &script),
    }
}

fn connect(config: &IndexConfig, url: &str) -> Result<ElectrumFetcher> {
    println!("[MAIN] Connecting to Electrum: {}", url);
    ElectrumFetcher::connect(url, config.fetch_timeout() + Duration::from_secs(5))
}

fn run_fetch(config: &IndexConfig, url: &str, txid: Txid) -> Result<()> {
    let fetcher = connect(config, url)?;
    let raw = fetcher.fetch_transaction(&txid, config.fetch_timeout())?;
    let tx: Transaction = deserialize(&raw).context("peer sent a malformed transaction")?;

    println!("-----------------------------------");
    println!("Txid:     {}", tx.compute_txid());
    println!("RBF:      {}", tx.is_explicitly_rbf());
    for (vin, input) in tx.input.iter().enumerate() {
        println!("in  {:>3}: {}", vin, input.previous_output);
    }
    for (vout, output) in tx.output.iter().enumerate() {
        println!(
            "out {:>3}: {} sats -> {}",
            vout,
            output.value.to_sat(),
            ScriptAddress::from_script(&output.script_pubkey)
        );
    }
    println!("-----------------------------------");
    Ok(())
}

fn run_broadcast(config: IndexConfig, url: &str, raw_hex: &str, store: &PathBuf) -> Result<()> {
    let raw = hex::decode(raw_hex.trim()).context("raw transaction is not hex")?;
    let fetcher = connect(&config, url)?;
    let store = Arc::new(load_or_create(store)?);
    let timeout = config.broadcast_timeout();

    let service = IndexService::new(
        config,
        store,
        Arc::new(MemoryChain::new()),
        Arc::new(fetcher),
    )?;
    let result = service.tracker().broadcast(&raw, timeout, None);
    service.shutdown();

    let txid = result?;
    println!("[MAIN] Broadcast accepted: {}", txid);
    Ok(())
}

fn run_inspect(config: &IndexConfig, store: &PathBuf, script_hex: &str) -> Result<()> {
    let script = ScriptBuf::from_bytes(hex::decode(script_hex.trim()).context("script is not hex")?);
    let address = ScriptAddress::new(script);
    let store = Arc::new(load_or_create(store)?);
    let ledger = AddressLedger::new(address.clone(), store, MempoolView::default(), config)?;

    let summary = ledger.summary();
    println!("-----------------------------------");
    println!("Address:      {}", address);
    println!("Synced to:    {:?}", summary.sync_height);
    println!("Txio events:  {}", summary.txio_count);
    println!("Balance:      {} sats", ledger.confirmed_balance());
    println!("-----------------------------------");

    for id in 0..ledger.page_count() {
        let entries = ledger.history_page(id)?;
        println!("Page {} ({} entries)", id, entries.len());
        for entry in entries.iter() {
            println!(
                "  {:>10} {:>14} {}",
                entry
                    .height()
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "pending".into()),
                entry.value,
                entry.txid
            );
        }
    }
    Ok(())
}
