use crate::error::{PipelineError, Result};
use log::debug;
use rand::seq::IndexedRandom;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

const ONE_MILLION_PREFIX: &str = "1Mstations";
const ONE_BILLION_PREFIX: &str = "stations";
const DATA_SUFFIX: &str = ".csv.gz";

/// Opened station dataset and the key it was found under.
#[derive(Debug)]
pub struct StationData {
    pub key: String,
    pub reader: File,
}

/// Directory of cached, gzip-compressed station datasets.
///
/// Files are named `<prefix>*.csv.gz`, with `1Mstations` holding one-million-row sets and
/// `stations` the one-billion-row set.
#[derive(Debug, Clone)]
pub struct StationStore {
    root: PathBuf,
}

impl StationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens the dataset for `count` rows. Only 1,000,000 and 1,000,000,000 are stocked.
    ///
    /// Several one-million-row sets can share their prefix; one of them is picked at random
    /// so repeated races see different data. The one-billion-row set is the last by name.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Storage` for an unsupported count or an empty prefix, and
    /// `PipelineError::Io` if the directory or file cannot be read.
    pub fn station_data(&self, count: u64) -> Result<StationData> {
        let prefix = match count {
            1_000_000 => ONE_MILLION_PREFIX,
            1_000_000_000 => ONE_BILLION_PREFIX,
            _ => return Err(PipelineError::Storage(format!("unsupported count {}", count))),
        };

        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(prefix) && name.ends_with(DATA_SUFFIX) {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        debug!(
            "Found {} datasets under prefix {} in {}",
            keys.len(),
            prefix,
            self.root.display()
        );

        let key = if prefix == ONE_MILLION_PREFIX {
            keys.choose(&mut rand::rng()).cloned()
        } else {
            keys.pop()
        }
        .ok_or_else(|| {
            PipelineError::Storage(format!("no station data under prefix {}", prefix))
        })?;
        debug!("Selected dataset {}", key);
        let reader = File::open(self.root.join(&key))?;
        Ok(StationData { key, reader })
    }
}
