// backuptool/src/snapshot/db_dump.rs
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::engine::Runtime;

/// Marker pg_dumpall writes as its final line. Seeing it proves the dump ran
/// to completion rather than being cut off mid-stream.
const DUMP_COMPLETE_MARKER: &str = "PostgreSQL database cluster dump complete";

/// Dumps the whole cluster (roles and privileges included, so a bare-metal
/// restore can recreate users) through the engine and gzips it into `dest`.
/// A single-database or schema-only dump is not enough for disaster recovery.
pub async fn dump_cluster<R: Runtime + ?Sized>(
    runtime: &R,
    db_service: &str,
    db_user: &str,
    dest: &Path,
) -> Result<u64> {
    let dump = runtime
        .exec_capture(db_service, &["pg_dumpall", "-U", db_user, "--clean", "--if-exists"])
        .await
        .with_context(|| format!("pg_dumpall in service {} failed", db_service))?;

    if dump.is_empty() {
        anyhow::bail!("pg_dumpall produced no output");
    }

    let file = File::create(dest)
        .with_context(|| format!("Failed to create dump file {}", dest.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder
        .write_all(&dump)
        .with_context(|| format!("Failed to write dump to {}", dest.display()))?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish gzip stream for {}", dest.display()))?;

    let size = std::fs::metadata(dest)?.len();
    Ok(size)
}

/// Re-opens the produced dump and scans it for the completion marker.
pub fn verify_dump(path: &Path) -> Result<()> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Dump file missing: {}", path.display()))?
        .len();
    if size == 0 {
        anyhow::bail!("dump file {} is empty", path.display());
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open dump file {}", path.display()))?;
    let reader = BufReader::new(flate2::read::GzDecoder::new(file));
    for line in reader.lines() {
        let line = line.with_context(|| format!("Failed to read dump {}", path.display()))?;
        if line.contains(DUMP_COMPLETE_MARKER) {
            return Ok(());
        }
    }
    anyhow::bail!(
        "dump file {} does not contain the completion marker; the dump was cut short",
        path.display()
    )
}
