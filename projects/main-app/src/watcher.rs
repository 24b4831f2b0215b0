use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::warn;

/// Looks up the most recent capture in the captures directory.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    dir: PathBuf,
}

impl FileWatcher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub async fn latest_file(&self) -> Option<String> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read {}: {err}", self.dir.display());
                return None;
            }
        };

        let mut latest: Option<(SystemTime, String)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if latest.as_ref().is_none_or(|(newest, _)| modified > *newest) {
                latest = Some((modified, entry.file_name().to_string_lossy().into_owned()));
            }
        }

        latest.map(|(_, name)| name)
    }
}
