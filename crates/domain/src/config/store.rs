use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Location of the SQLite file holding the outbox and the context cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: d_store_path(),
        }
    }
}

fn d_store_path() -> PathBuf {
    PathBuf::from("./data/tether.db")
}
