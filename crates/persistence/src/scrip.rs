//! Scrip-master day cache
//!
//! The broker's instrument table (trading symbol <-> websocket token) is
//! large and changes daily at most, so each trading day's copy is cached to
//! one dated file and reused for the rest of the day.

use chrono::NaiveDate;
use neodip_core::errors::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Trading symbol -> instrument token
pub type ScripMap = HashMap<String, String>;

pub struct ScripMasterStore {
    dir: PathBuf,
}

impl ScripMasterStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("scrip_master_{}.json", day))
    }

    /// Load the cached table for `day`, if one exists
    pub async fn load(&self, day: NaiveDate) -> Result<Option<ScripMap>> {
        let path = self.path_for(day);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let map: ScripMap = serde_json::from_str(&raw)
                    .map_err(|e| Error::Persistence(format!("corrupt scrip cache: {}", e)))?;
                debug!("scrip master cache hit for {} ({} symbols)", day, map.len());
                Ok(Some(map))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Persistence(e.to_string())),
        }
    }

    /// Write the table for `day` (temp + rename, same as the ledger)
    pub async fn save(&self, day: NaiveDate, map: &ScripMap) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(day);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(map)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!("scrip master cached for {} ({} symbols)", day, map.len());
        Ok(())
    }

    /// Drop cache files older than `keep_days`
    pub async fn prune(&self, today: NaiveDate, keep_days: u32) -> Result<()> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return Ok(());
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date_part) = name
                .strip_prefix("scrip_master_")
                .and_then(|s| s.strip_suffix(".json"))
            else {
                continue;
            };
            if let Ok(day) = date_part.parse::<NaiveDate>() {
                if (today - day).num_days() > keep_days as i64 {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
        Ok(())
    }
}
