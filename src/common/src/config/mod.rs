use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "txngc.toml";

/// Prefix of environment variable overrides, e.g. `TXNGC__PRUNE__PRUNE_FACTOR`.
pub const ENV_PREFIX: &str = "TXNGC__";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Name of the database holding the transaction collections
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::from("txngc"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

/// How batched deletions are submitted to the store.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoverStrategy {
    /// One `id in {...}` removal per flush
    #[default]
    Batch,
    /// One unordered bulk request of single-id removals per flush
    Bulk,
}

/// Pruning run parameters.
///
/// Zero values (and unset durations) mean "use the built-in default"; the
/// pruner resolves them before a run starts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PruneConfig {
    /// Base transaction collection. `<name>.stash` and `<name>.prune` are
    /// derived from it.
    pub txns_collection: String,
    /// Growth ratio of the transaction collection that triggers a prune
    pub prune_factor: f64,
    /// Fewer new transactions than this never trigger a prune
    pub min_new_transactions: u64,
    /// More new transactions than this always trigger a prune
    pub max_new_transactions: u64,
    /// Concurrent sweeps; two or more enables the reverse-order sweep
    pub max_batches: u32,
    /// Pause between transaction batches
    #[serde(with = "humantime_serde")]
    pub batch_sleep: Option<Duration>,
    /// Transactions read per batch
    pub txn_batch_size: usize,
    /// Resolved transactions evaluated per run (0 = no cap)
    pub max_txns_to_process: usize,
    /// Only transactions older than this are pruned (unset = no horizon)
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
    /// Run a reverse-order sweep next to the forward sweep
    pub multithreaded: bool,
    pub remover: RemoverStrategy,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            txns_collection: String::from("txns"),
            prune_factor: 0.0,
            min_new_transactions: 0,
            max_new_transactions: 0,
            max_batches: 0,
            batch_sleep: None,
            txn_batch_size: 0,
            max_txns_to_process: 0,
            max_age: None,
            multithreaded: false,
            remover: RemoverStrategy::Batch,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    /// Document store connection
    pub database: DatabaseConfig,
    /// Pruning parameters
    pub prune: PruneConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Configuration {
    /// Load defaults, then `txngc.toml` if present, then `TXNGC__` env vars.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(CONFIG_FILE))
    }

    /// Like [`Configuration::load`] but reads an explicit file.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(file: figment::providers::Data<Toml>) -> Result<Self, Box<figment::Error>> {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)
    }
}
