use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{
    revision_parser::{parse_fragment, ParseError, RevisionRecord, TextMode},
    timestamp::DatePath,
};

pub const RECORD_EXTENSION: &str = "xml";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O failure at `{}`", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{0}` cannot be used as a document directory name")]
    InvalidDocumentName(String),
}

fn io_failure(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::IoFailure {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadRecordError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("stored record at `{}` does not parse", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Written,
    /// A record with the same path was already stored, nothing was written.
    AlreadyExists,
}

/// Revision counts of one document, recomputed from the directory tree on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSummary {
    pub total: usize,
    pub by_year: BTreeMap<i32, usize>,
    pub by_day: BTreeMap<DatePath, usize>,
}

impl CoverageSummary {
    fn add(&mut self, date: DatePath, count: usize) {
        self.total += count;
        *self.by_year.entry(date.year).or_insert(0) += count;
        *self.by_day.entry(date).or_insert(0) += count;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Owns the on-disk layout `root/<document>/<YYYY>/<MM>/<DD>/<revision id>.xml`.
///
/// The directory tree is the index: a record exists iff its file exists, and
/// files only ever appear fully written.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_dir(&self, document: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(encode_document_name(document)?))
    }

    pub fn document_exists(&self, document: &str) -> Result<bool, StorageError> {
        let dir = self.document_dir(document)?;
        dir.try_exists().map_err(io_failure(&dir))
    }

    /// Depends only on the document name, the revision id and the revision date.
    pub fn path_for(
        &self,
        document: &str,
        record: &RevisionRecord,
    ) -> Result<PathBuf, StorageError> {
        let date = record.timestamp.year_month_day();
        let mut path = self.document_dir(document)?;
        path.push(date.year_component());
        path.push(date.month_component());
        path.push(date.day_component());
        path.push(format!("{}.{}", record.id, RECORD_EXTENSION));
        Ok(path)
    }

    /// Writes `contents` to `path` unless a record is already there.
    ///
    /// The data goes to a temporary sibling first and is hard-linked into place,
    /// so readers never see a partial record and the first writer of a path wins.
    pub fn store(&self, path: &Path, contents: &[u8]) -> Result<StoreOutcome, StorageError> {
        if path.try_exists().map_err(io_failure(path))? {
            return Ok(StoreOutcome::AlreadyExists);
        }

        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(StorageError::IoFailure {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a record path"),
            });
        };
        fs::create_dir_all(dir).map_err(io_failure(dir))?;

        let tmp_path = dir.join(format!(
            ".{}.tmp-{:016x}",
            file_name.to_string_lossy(),
            rand::random::<u64>()
        ));
        if let Err(e) = write_synced(&tmp_path, contents) {
            remove_tmp(&tmp_path);
            return Err(StorageError::IoFailure {
                path: tmp_path,
                source: e,
            });
        }

        let result = match fs::hard_link(&tmp_path, path) {
            Ok(()) => Ok(StoreOutcome::Written),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(StoreOutcome::AlreadyExists),
            Err(e) => {
                // some file systems have no hard links, fall back to a plain atomic rename
                tracing::debug!(
                    message = "hard link failed, renaming instead",
                    path = %path.display(),
                    error = %e
                );
                match path.try_exists() {
                    Ok(true) => Ok(StoreOutcome::AlreadyExists),
                    Ok(false) => fs::rename(&tmp_path, path)
                        .map(|()| StoreOutcome::Written)
                        .map_err(io_failure(path)),
                    Err(e) => Err(io_failure(path)(e)),
                }
            }
        };
        remove_tmp(&tmp_path);
        result
    }

    pub fn read_record(&self, path: &Path, mode: TextMode) -> Result<RevisionRecord, ReadRecordError> {
        let contents = fs::read(path).map_err(io_failure(path))?;
        parse_fragment(&contents, mode).map_err(|source| ReadRecordError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Walks the year/month/day hierarchy once. A missing document counts as empty.
    pub fn count_all(&self, document: &str) -> Result<CoverageSummary, StorageError> {
        let mut summary = CoverageSummary::default();
        self.walk_days(document, |date, day_dir| {
            let count = record_files(day_dir)?.len();
            if count > 0 {
                summary.add(date, count);
            }
            Ok(())
        })?;
        Ok(summary)
    }

    /// Every stored record path of `document`, oldest day first and by revision id within a day.
    pub fn record_paths(&self, document: &str) -> Result<Vec<PathBuf>, StorageError> {
        let mut paths = Vec::new();
        self.walk_days(document, |_, day_dir| {
            paths.extend(record_files(day_dir)?);
            Ok(())
        })?;
        Ok(paths)
    }

    pub fn earliest(&self, document: &str) -> Result<Option<YearMonth>, StorageError> {
        self.boundary_month(document, false)
    }

    pub fn latest(&self, document: &str) -> Result<Option<YearMonth>, StorageError> {
        self.boundary_month(document, true)
    }

    // directory names are fixed width, so sorting the names sorts the dates
    fn boundary_month(
        &self,
        document: &str,
        newest: bool,
    ) -> Result<Option<YearMonth>, StorageError> {
        let document_dir = self.document_dir(document)?;

        let mut years = numbered_dirs(&document_dir, 4)?;
        if newest {
            years.reverse();
        }
        for (year, year_dir) in years {
            let mut months = numbered_dirs(&year_dir, 2)?;
            if newest {
                months.reverse();
            }
            for (month, month_dir) in months {
                if month_has_records(&month_dir)? {
                    return Ok(Some(YearMonth {
                        year: year as i32,
                        month,
                    }));
                }
            }
        }
        Ok(None)
    }

    fn walk_days(
        &self,
        document: &str,
        mut visit: impl FnMut(DatePath, &Path) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let document_dir = self.document_dir(document)?;

        for (year, year_dir) in numbered_dirs(&document_dir, 4)? {
            for (month, month_dir) in numbered_dirs(&year_dir, 2)? {
                for (day, day_dir) in numbered_dirs(&month_dir, 2)? {
                    let date = DatePath {
                        year: year as i32,
                        month,
                        day,
                    };
                    visit(date, &day_dir)?;
                }
            }
        }
        Ok(())
    }
}

// Keeps the name injective while making sure it stays a single path component.
fn encode_document_name(name: &str) -> Result<String, StorageError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidDocumentName(name.to_string()));
    }

    let mut encoded = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '/' => encoded.push_str("%2F"),
            '\\' => encoded.push_str("%5C"),
            '\0' => encoded.push_str("%00"),
            c => encoded.push(c),
        }
    }
    Ok(encoded)
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn remove_tmp(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(
                message = "failed to remove temporary file",
                path = %path.display(),
                error = %e
            );
        }
    }
}

/// Subdirectories whose name is exactly `width` ASCII digits, sorted by name.
fn numbered_dirs(dir: &Path, width: usize) -> Result<Vec<(u32, PathBuf)>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_failure(dir)(e)),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_failure(dir))?;
        let file_type = entry.file_type().map_err(io_failure(dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let is_component = name.len() == width && name.bytes().all(|b| b.is_ascii_digit());
        if !file_type.is_dir() || !is_component {
            tracing::debug!(
                message = "ignoring unexpected entry in record tree",
                path = %entry.path().display()
            );
            continue;
        }
        if let Ok(value) = name.parse() {
            dirs.push((name.into_owned(), value, entry.path()));
        }
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirs
        .into_iter()
        .map(|(_, value, path)| (value, path))
        .collect())
}

fn is_record_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| !name.starts_with('.'));
    visible && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
}

fn record_files(day_dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(day_dir).map_err(io_failure(day_dir))? {
        let entry = entry.map_err(io_failure(day_dir))?;
        let path = entry.path();
        if is_record_file(&path) && entry.file_type().map_err(io_failure(&path))?.is_file() {
            files.push(path);
        }
    }
    // numeric revision ids first in id order, anything else after them by name
    files.sort_by_cached_key(|path| {
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok());
        (id.is_none(), id, path.clone())
    });
    Ok(files)
}

fn month_has_records(month_dir: &Path) -> Result<bool, StorageError> {
    for (_, day_dir) in numbered_dirs(month_dir, 2)? {
        if !record_files(&day_dir)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}
