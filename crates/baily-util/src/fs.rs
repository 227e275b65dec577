use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Read a module source file, tolerating broken encodings.
///
/// Editors save sources in whatever encoding they happen to use, and the
/// transform pipeline would rather ship a replacement character to the
/// browser than fail the whole request over one stray byte.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn read_source_lossy(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) => Ok(String::from_utf8_lossy(err.as_bytes()).into_owned()),
    }
}

/// Replace `path` with `bytes`, all at once or not at all.
///
/// The dep-cache manifest is read back on every server start; a crash
/// mid-write must leave either the previous manifest or the new one,
/// never a truncated file. The bytes go to a temp file in the target's
/// directory (same filesystem, so the final step is a rename) and are
/// synced before the swap.
///
/// # Errors
/// Returns an error if the temp file cannot be created, written, or
/// moved into place.
pub fn persist_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_read_source_lossy_clean_module() {
        let dir = tempdir().unwrap();
        let module = dir.path().join("main.js");
        fs::write(&module, "import './app.js';\n").unwrap();

        assert_eq!(read_source_lossy(&module).unwrap(), "import './app.js';\n");
    }

    #[test]
    fn test_read_source_lossy_salvages_bad_encoding() {
        let dir = tempdir().unwrap();
        let module = dir.path().join("latin1.js");
        // A Latin-1 comment byte (0xE9, "é") that is not valid UTF-8.
        fs::write(&module, b"// caf\xe9\nexport const n = 1;\n").unwrap();

        let source = read_source_lossy(&module).unwrap();
        assert!(source.contains('\u{FFFD}'));
        assert!(source.contains("export const n = 1;"));
    }

    #[test]
    fn test_persist_atomic_manifest_survives_rewrite() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("_metadata.json");

        // First optimization generation, then a re-optimization swap.
        persist_atomic(&manifest, br#"{"browserHash":"aaaa1111","optimized":{}}"#).unwrap();
        persist_atomic(&manifest, br#"{"browserHash":"bbbb2222","optimized":{}}"#).unwrap();

        let on_disk = fs::read_to_string(&manifest).unwrap();
        assert!(on_disk.contains("bbbb2222"));
        assert!(!on_disk.contains("aaaa1111"));
    }

    #[test]
    fn test_persist_atomic_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("_metadata.json");
        persist_atomic(&manifest, b"{}").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["_metadata.json"]);
    }
}
