use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// A migration loaded from disk. `name` is the file stem (`0001_create_users`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub name: String,
    pub sequence: u64,
    pub sql: String,
    /// Hex SHA-256 of `sql`.
    pub hash: String,
}

impl MigrationFile {
    pub fn new(file_name: &str, sql: String) -> Result<Self> {
        let (sequence, name) = parse_file_name(file_name)?;
        Ok(Self {
            name,
            sequence,
            hash: content_hash(&sql),
            sql,
        })
    }
}

pub fn content_hash(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// `<digits>_<label>.sql` -> `(sequence, stem)`.
pub fn parse_file_name(file_name: &str) -> Result<(u64, String)> {
    let invalid = || Error::InvalidMigrationName(file_name.to_string());

    let stem = file_name.strip_suffix(".sql").ok_or_else(invalid)?;
    let (prefix, label) = stem.split_once('_').ok_or_else(invalid)?;
    if prefix.is_empty() || label.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let sequence = prefix.parse().map_err(|_| invalid())?;
    Ok((sequence, stem.to_string()))
}

/// Loads every `.sql` file in `dir`, sorted by numeric prefix (not by file
/// name, so `10_x` comes after `9_y`). Non-SQL files are ignored; SQL files
/// without a numeric prefix are an error.
pub async fn load_migrations(dir: &Path) -> Result<Vec<MigrationFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(".sql") {
            continue;
        }
        let sql = tokio::fs::read_to_string(entry.path()).await?;
        files.push(MigrationFile::new(&file_name, sql)?);
    }

    sort_migrations(&mut files);
    debug!("Loaded {} migration(s) from {}", files.len(), dir.display());
    Ok(files)
}

pub fn sort_migrations(files: &mut [MigrationFile]) {
    files.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
}
