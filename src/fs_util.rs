use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::EnviroError;

/// Whether a source path or URL names a zip archive, ignoring any query string.
pub fn is_zip_source(source: &str) -> bool {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.to_ascii_lowercase().ends_with(".zip"))
}

/// Reads the first archive member with `extension`, by member path.
///
/// Directories and members whose names would escape the archive are ignored.
/// Returns the member path together with its bytes, or `None` if no member matches.
pub fn read_zip_member(
    zip_path: &Path,
    extension: &str,
) -> Result<Option<(PathBuf, Vec<u8>)>, EnviroError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        EnviroError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|err| EnviroError::Decode(format!("{}: {err}", zip_path.display())))?;

    let mut candidates = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| EnviroError::Decode(err.to_string()))?;
        let Some(name) = entry.enclosed_name() else {
            tracing::warn!(member = entry.name(), "skipping zip member outside the archive root");
            continue;
        };
        if entry.is_file()
            && name
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        {
            candidates.push((name, index));
        }
    }
    candidates.sort();

    let Some((name, index)) = candidates.into_iter().next() else {
        return Ok(None);
    };
    let mut entry = archive
        .by_index(index)
        .map_err(|err| EnviroError::Decode(err.to_string()))?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|err| EnviroError::Decode(format!("{}: {err}", name.display())))?;
    Ok(Some((name, content)))
}
