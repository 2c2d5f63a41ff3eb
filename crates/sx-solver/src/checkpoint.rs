use std::path::{Path, PathBuf};
use tracing::{debug, info};

use sx_types::{Checkpoint, CheckpointConfig, SxError, SxResult};

const LATEST: &str = "latest.json";

/// Directory of checkpoint records: one file per saved generation plus a
/// copy of the newest as `latest.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
    keep_last: usize,
}

impl CheckpointStore {
    pub fn open(config: &CheckpointConfig) -> SxResult<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory.clone(),
            keep_last: config.keep_last,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn generation_path(&self, generation: usize) -> PathBuf {
        self.directory.join(format!("gen-{generation:08}.json"))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> SxResult<PathBuf> {
        let text = checkpoint.to_json()?;
        let path = self.generation_path(checkpoint.generation);

        // latest.json is only ever replaced by rename.
        let staging = self.directory.join(".latest.json.tmp");
        std::fs::write(&path, &text)?;
        std::fs::write(&staging, &text)?;
        std::fs::rename(&staging, self.directory.join(LATEST))?;

        info!(
            generation = checkpoint.generation,
            path = %path.display(),
            "checkpoint saved"
        );
        self.prune()?;
        Ok(path)
    }

    pub fn load(&self, generation: usize) -> SxResult<Checkpoint> {
        read(&self.generation_path(generation))
    }

    pub fn load_latest(&self) -> SxResult<Checkpoint> {
        read(&self.directory.join(LATEST))
    }

    /// Saved generations, oldest first.
    pub fn generations(&self) -> SxResult<Vec<usize>> {
        let mut generations = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(number) = name
                .strip_prefix("gen-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<usize>().ok())
            {
                generations.push(number);
            }
        }
        generations.sort_unstable();
        Ok(generations)
    }

    fn prune(&self) -> SxResult<()> {
        if self.keep_last == 0 {
            return Ok(());
        }
        let generations = self.generations()?;
        let excess = generations.len().saturating_sub(self.keep_last);
        for generation in &generations[..excess] {
            debug!(generation, "pruning checkpoint");
            std::fs::remove_file(self.generation_path(*generation))?;
        }
        Ok(())
    }
}

fn read(path: &Path) -> SxResult<Checkpoint> {
    let text = std::fs::read_to_string(path).map_err(|e| SxError::Checkpoint {
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    Checkpoint::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sx_types::Termination;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn checkpoint(generation: usize) -> Checkpoint {
        Checkpoint::new(
            Uuid::nil(),
            "store-test",
            generation,
            Termination::new(),
            json!({ "Mcmc": { "generation": generation } }),
        )
    }

    #[test]
    fn latest_tracks_the_newest_save() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&CheckpointConfig::in_directory(dir.path())).unwrap();
        store.save(&checkpoint(1)).unwrap();
        store.save(&checkpoint(2)).unwrap();

        assert_eq!(store.load_latest().unwrap().generation, 2);
        assert_eq!(store.load(1).unwrap().solver["Mcmc"]["generation"], 1);
    }

    #[test]
    fn keeps_only_the_most_recent_files() {
        let dir = tempdir().unwrap();
        let mut config = CheckpointConfig::in_directory(dir.path());
        config.keep_last = 3;
        let store = CheckpointStore::open(&config).unwrap();
        for generation in 1..=6 {
            store.save(&checkpoint(generation)).unwrap();
        }
        assert_eq!(store.generations().unwrap(), vec![4, 5, 6]);
        assert!(store.load(2).is_err());
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(&CheckpointConfig::in_directory(dir.path())).unwrap();
        assert!(matches!(
            store.load_latest(),
            Err(SxError::Checkpoint { .. })
        ));
    }
}
