pub fn unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn format_instant(unix_ms: u64) -> String {
    use chrono::{Local, TimeZone};
    match Local.timestamp_millis_opt(unix_ms as i64).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => unix_ms.to_string(),
    }
}

/// True if `path` holds anything besides the instance lock file.
fn dir_has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|rd| rd.flatten().any(|e| e.file_name() != LOCK_FILE))
        .unwrap_or(false)
}

/// Digest over `(id, encoded record)` pairs in key order. Length prefixes
/// keep `("ab","c")` and `("a","bc")` apart.
fn encoded_digest<'a>(entries: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> String {
    let mut hasher = Sha256::new();
    for (id, body) in entries {
        hasher.update((id.len() as u64).to_le_bytes());
        hasher.update(id.as_bytes());
        hasher.update((body.len() as u64).to_le_bytes());
        hasher.update(body);
    }
    format!("{:x}", hasher.finalize())
}

/// Digest of records as they are encoded on disk.
fn records_digest(records: &BTreeMap<String, Value>) -> String {
    let encoded: Vec<(&str, String)> = records
        .iter()
        .map(|(id, value)| (id.as_str(), value.to_string()))
        .collect();
    encoded_digest(encoded.iter().map(|(id, body)| (*id, body.as_bytes())))
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    digest: String,
    records: BTreeMap<String, Value>,
}

fn backup_path(root: &Path, unix_ms: u64) -> PathBuf {
    root.join(BACKUPS_DIR).join(format!("{unix_ms}.json.gz"))
}

fn write_backup(
    root: &Path,
    unix_ms: u64,
    records: &BTreeMap<String, Value>,
) -> Result<(), EngineError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let dir = root.join(BACKUPS_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| EngineError::io("create backups dir", e))?;
    let body = serde_json::to_vec(&BackupFile {
        digest: records_digest(records),
        records: records.clone(),
    })
    .map_err(|e| EngineError::Other(format!("encode backup: {e}")))?;

    // Write next to the target and rename so a crash never leaves a torn
    // backup under its final name.
    let target = backup_path(root, unix_ms);
    let tmp = dir.join(format!("{unix_ms}.json.gz.tmp"));
    let file = File::create(&tmp).map_err(|e| EngineError::io("create backup", e))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder
        .write_all(&body)
        .map_err(|e| EngineError::io("write backup", e))?;
    let file = encoder
        .finish()
        .map_err(|e| EngineError::io("finish backup", e))?;
    file.sync_all()
        .map_err(|e| EngineError::io("sync backup", e))?;
    std::fs::rename(&tmp, &target).map_err(|e| EngineError::io("install backup", e))?;
    log::debug!("backup written to {}", target.display());
    Ok(())
}

/// Reads and verifies one backup. Any decode error or digest mismatch makes
/// the backup unusable.
fn read_backup(path: &Path) -> Option<BTreeMap<String, Value>> {
    use flate2::read::GzDecoder;

    let file = File::open(path).ok()?;
    let mut body = Vec::new();
    if let Err(e) = GzDecoder::new(file).read_to_end(&mut body) {
        log::warn!("backup {} unreadable: {e}", path.display());
        return None;
    }
    let parsed: BackupFile = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("backup {} malformed: {e}", path.display());
            return None;
        }
    };
    if records_digest(&parsed.records) != parsed.digest {
        log::warn!("backup {} failed digest check", path.display());
        return None;
    }
    Some(parsed.records)
}

/// Backup timestamps on disk, newest first.
fn list_backups(root: &Path) -> Vec<u64> {
    let Ok(rd) = std::fs::read_dir(root.join(BACKUPS_DIR)) else {
        return Vec::new();
    };
    let mut out: Vec<u64> = rd
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_suffix(".json.gz")?.parse::<u64>().ok()
        })
        .collect();
    out.sort_unstable_by(|a, b| b.cmp(a));
    out
}

fn newest_backup_unix_ms(root: &Path) -> u64 {
    list_backups(root).first().copied().unwrap_or(0)
}

fn newest_valid_backup(root: &Path) -> Option<(u64, BTreeMap<String, Value>)> {
    list_backups(root)
        .into_iter()
        .find_map(|ms| read_backup(&backup_path(root, ms)).map(|records| (ms, records)))
}

fn prune_backups(root: &Path, retain: usize) {
    for ms in list_backups(root).into_iter().skip(retain.max(1)) {
        let path = backup_path(root, ms);
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("failed to prune backup {}: {e}", path.display());
        }
    }
}

/// Moves a corrupted store aside so nothing is lost for later inspection.
fn quarantine_dir(root: &Path, current: &Path) -> Result<(), EngineError> {
    if !current.exists() {
        return Ok(());
    }
    let target = root.join(format!("corrupt.{}", unix_ms()));
    if let Err(e) = std::fs::rename(current, &target) {
        // Rename across filesystems fails; the quarantine copy is lost then.
        log::warn!(
            "failed to move corrupted store to {}: {e}",
            target.display()
        );
        std::fs::remove_dir_all(current)
            .map_err(|e2| EngineError::io("remove corrupted store", e2))?;
    }
    Ok(())
}

fn newest_mtime_unix_ms(path: &Path) -> u64 {
    fn walk(p: &Path, newest: &mut u64) {
        let Ok(rd) = std::fs::read_dir(p) else {
            return;
        };
        for entry in rd.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                walk(&entry.path(), newest);
                continue;
            }
            let ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            *newest = (*newest).max(ms);
        }
    }

    let mut newest = 0u64;
    walk(path, &mut newest);
    newest
}

fn query_integrity(root: &Path) -> Result<RollbackInfo, EngineError> {
    let Some((backup_ms, _)) = newest_valid_backup(root) else {
        return Err(EngineError::NotFound);
    };
    let corrupted_ms = newest_mtime_unix_ms(&root.join(CURRENT_DIR));
    Ok(RollbackInfo {
        corrupted_instant: format_instant(corrupted_ms),
        rollback_candidate_instant: format_instant(backup_ms),
    })
}
