use std::fs::File;
use std::path::{Path, PathBuf};

use parquet::file::reader::SerializedFileReader;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::fsutil;

pub const SHARD_EXTENSION: &str = "parquet";
const ARTIFACT_SUFFIX: &str = "__inferred";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStatus::Pending => write!(f, "pending"),
            ShardStatus::Assigned => write!(f, "assigned"),
            ShardStatus::InProgress => write!(f, "in_progress"),
            ShardStatus::Completed => write!(f, "completed"),
            ShardStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One input file. Shards order by name, which is also the partitioning order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkShard {
    pub name: String,
    pub path: PathBuf,
}

impl WorkShard {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FleetError::InvalidArgument(format!("shard path {} has no name", path.display()))
            })?
            .to_string();
        Ok(Self { name, path })
    }

    pub fn stem(&self) -> &str {
        self.name
            .strip_suffix(&format!(".{SHARD_EXTENSION}"))
            .unwrap_or(&self.name)
    }

    /// File name of this shard's output artifact.
    pub fn artifact_name(&self) -> String {
        format!("{}{ARTIFACT_SUFFIX}.{SHARD_EXTENSION}", self.stem())
    }

    pub fn artifact_path(&self, dst_dir: &Path) -> PathBuf {
        dst_dir.join(self.artifact_name())
    }
}

/// List `*.parquet` files directly under `src_dir`, sorted by name.
pub fn discover_shards(src_dir: &Path) -> Result<Vec<WorkShard>> {
    let mut shards = Vec::new();
    for entry in std::fs::read_dir(src_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || fsutil::is_temp_file(&path) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXTENSION) {
            continue;
        }
        shards.push(WorkShard::from_path(path)?);
    }
    shards.sort();
    tracing::debug!(dir = %src_dir.display(), count = shards.len(), "Discovered shards");
    Ok(shards)
}

/// True when the shard's artifact exists in `dst_dir` and has a readable
/// Parquet footer. Truncated or foreign files do not count.
pub fn artifact_exists(shard: &WorkShard, dst_dir: &Path) -> bool {
    let path = shard.artifact_path(dst_dir);
    let Ok(file) = File::open(&path) else {
        return false;
    };
    match SerializedFileReader::new(file) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(artifact = %path.display(), error = %e, "Ignoring unreadable artifact");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_from_stem() {
        let shard = WorkShard::from_path("/in/equations_0007.parquet").unwrap();
        assert_eq!(shard.name, "equations_0007.parquet");
        assert_eq!(shard.stem(), "equations_0007");
        assert_eq!(shard.artifact_name(), "equations_0007__inferred.parquet");
        assert_eq!(
            shard.artifact_path(Path::new("/out")),
            PathBuf::from("/out/equations_0007__inferred.parquet")
        );
    }

    #[test]
    fn discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.parquet", "a.parquet", "notes.txt", ".b.parquet.tmp-1"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.parquet")).unwrap();

        let shards = discover_shards(dir.path()).unwrap();
        let names: Vec<&str> = shards.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
    }

    #[test]
    fn garbage_artifact_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let shard = WorkShard::from_path("/in/s.parquet").unwrap();
        assert!(!artifact_exists(&shard, dir.path()));

        std::fs::write(shard.artifact_path(dir.path()), b"not parquet").unwrap();
        assert!(!artifact_exists(&shard, dir.path()));
    }
}
