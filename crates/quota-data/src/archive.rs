//! Gzip expansion of rotated flow logs.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use quota_core::error::{QuotaError, Result};
use tracing::info;

/// Suffix of the in-progress output; never matches the `*.log` discovery rule.
const PARTIAL_SUFFIX: &str = ".partial";

/// Plain-text sibling path for `archive`.
///
/// Strips a trailing `.gz` and appends `.log` unless the remaining name
/// already ends with it: `conn.log.gz` becomes `conn.log`, `dns.gz` becomes
/// `dns.log`.
pub fn extracted_path(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(".gz").unwrap_or(&name);
    let plain = if base.ends_with(".log") {
        base.to_string()
    } else {
        format!("{}.log", base)
    };
    archive.with_file_name(plain)
}

/// Expand `archive` next to itself and return the plain file's path.
///
/// Output goes to a `.partial` file that is renamed into place only after the
/// whole stream decoded, so a corrupt archive leaves no `.log` behind. The
/// archive itself is kept.
pub fn decompress_archive(archive: &Path) -> Result<PathBuf> {
    let target = extracted_path(archive);
    let mut partial_name = target.clone().into_os_string();
    partial_name.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial_name);

    info!("Extracting {} to {}", archive.display(), target.display());

    let result = expand_into(archive, &partial).and_then(|()| std::fs::rename(&partial, &target));
    if let Err(source) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(QuotaError::Decompression {
            path: archive.to_path_buf(),
            source,
        });
    }

    Ok(target)
}

fn expand_into(archive: &Path, out: &Path) -> std::io::Result<()> {
    let input = File::open(archive)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(File::create(out)?);
    std::io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(())
}
