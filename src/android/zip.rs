use log::debug;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK reading helpers.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    MissingEntry(String),
}

impl std::fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::Zip(err) => write!(f, "ZIP error: {err}"),
            ApkZipError::MissingEntry(name) => write!(f, "APK has no entry named {name}"),
        }
    }
}

impl std::error::Error for ApkZipError {}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkZipError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkZipError::Zip(value)
    }
}

/// A single file entry read out of an [`ApkFile`].
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub data: Vec<u8>,
}

/// An in-memory snapshot of an APK (ZIP) file's entries.
///
/// Entries are stored in a deterministic `BTreeMap`, keyed by their archive
/// path, so lookups behave the same on every platform.
pub struct ApkFile {
    entries: BTreeMap<String, ApkEntry>,
}

impl ApkFile {
    /// Load an APK from disk into memory.
    pub fn from_file(path: impl AsRef<Path>) -> ApkZipResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut entries = BTreeMap::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx)?;
            if entry.name().ends_with('/') {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            let name = entry.mangled_name().to_string_lossy().into_owned();
            entries.insert(name, ApkEntry { data });
        }
        debug!("Loaded {} entries from {}", entries.len(), path.display());
        Ok(ApkFile { entries })
    }

    /// Iterate over entry names.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Borrow an entry by name (e.g., `AndroidManifest.xml`).
    pub fn entry(&self, name: &str) -> Option<&ApkEntry> {
        self.entries.get(name)
    }

    /// Borrow an entry by name, failing with [`ApkZipError::MissingEntry`] when absent.
    pub fn required_entry(&self, name: &str) -> ApkZipResult<&ApkEntry> {
        self.entry(name)
            .ok_or_else(|| ApkZipError::MissingEntry(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn write_fixture_zip(path: &Path) {
        let file = File::create(path).expect("create fixture zip");
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer
            .start_file("AndroidManifest.xml", options)
            .expect("start entry");
        writer.write_all(b"<manifest/>").expect("write entry");
        writer
            .add_directory("res/", options)
            .expect("add directory");
        writer
            .start_file("res/values.xml", options)
            .expect("start nested entry");
        writer.write_all(b"<resources/>").expect("write nested entry");
        writer.finish().expect("finish zip");
    }

    #[test]
    fn reads_entries_and_skips_directories() {
        let path = std::env::temp_dir().join("apkinfo-zip-read-test.apk");
        write_fixture_zip(&path);

        let apk = ApkFile::from_file(&path).expect("read fixture apk");
        let names: Vec<&str> = apk.entry_names().collect();
        assert_eq!(names, vec!["AndroidManifest.xml", "res/values.xml"]);
        assert_eq!(
            apk.entry("AndroidManifest.xml").expect("manifest entry").data,
            b"<manifest/>"
        );
        assert!(apk.entry("classes.dex").is_none());

        let err = apk.required_entry("classes.dex").unwrap_err();
        assert!(err.to_string().contains("classes.dex"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = ApkFile::from_file("/nonexistent/path/to.apk");
        assert!(matches!(result, Err(ApkZipError::Io(_))));
    }
}
