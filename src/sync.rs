use std::fmt::{self, Display};

use rayon::prelude::*;
use tracing::instrument;

use crate::{
    fetch::{FetchError, FetchMode, Fetcher, ProgressSink, RawFragment, Transport},
    revision_parser::{parse_fragment, ParseError, TextMode},
    storage::{CoverageSummary, RecordStore, StorageError, StoreOutcome},
};

pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub mode: FetchMode,
    /// Download even if the document already has stored records.
    pub full_refresh: bool,
    pub text: TextMode,
    /// Upper bound on documents synced at the same time by [`SyncOrchestrator::sync_many`].
    pub max_parallel: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: FetchMode::default(),
            full_refresh: false,
            text: TextMode::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Fetching,
    Storing,
    Synced,
    Failed(String),
}

impl Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Unsynced => write!(f, "unsynced"),
            SyncState::Fetching => write!(f, "fetching"),
            SyncState::Storing => write!(f, "storing"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub document: String,
    /// Whether a download happened, `false` if existing data was used as is.
    pub fetched: bool,
    pub before: CoverageSummary,
    pub after: CoverageSummary,
    /// Records written by this run.
    pub stored: usize,
    /// Fragments whose record was already on disk.
    pub already_present: usize,
    /// Fragments that failed to parse or store.
    pub skipped: usize,
    pub state: SyncState,
}

impl SyncReport {
    pub fn newly_added(&self) -> usize {
        self.after.total.saturating_sub(self.before.total)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("fetching `{document}` failed")]
    Fetch {
        document: String,
        #[source]
        source: FetchError,
    },
    #[error("storage for `{document}` is unusable")]
    Storage {
        document: String,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, thiserror::Error)]
enum FragmentError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn transition(document: &str, state: &mut SyncState, next: SyncState) {
    tracing::debug!(
        message = "sync state change",
        document,
        from = %state,
        to = %next
    );
    *state = next;
}

/// Drives fetch, parse and store for a document, one fragment at a time.
pub struct SyncOrchestrator<T: Transport> {
    fetcher: Fetcher<T>,
    store: RecordStore,
}

impl<T: Transport> SyncOrchestrator<T> {
    pub fn new(fetcher: Fetcher<T>, store: RecordStore) -> Self {
        Self { fetcher, store }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Brings the stored history of `document` up to date.
    ///
    /// A document that already has a directory is left alone unless
    /// `options.full_refresh` is set. Fragments that fail to parse or store are
    /// counted in [`SyncReport::skipped`]; only a failing fetch fails the run.
    #[instrument(skip(self, progress))]
    pub fn sync<P: ProgressSink>(
        &self,
        document: &str,
        options: SyncOptions,
        progress: P,
    ) -> Result<SyncReport, SyncError> {
        let storage_error = |source: StorageError| SyncError::Storage {
            document: document.to_string(),
            source,
        };

        let mut state = SyncState::Unsynced;
        let before = self.store.count_all(document).map_err(storage_error)?;
        let exists = self.store.document_exists(document).map_err(storage_error)?;

        let mut report = SyncReport {
            document: document.to_string(),
            fetched: false,
            before: before.clone(),
            after: before,
            stored: 0,
            already_present: 0,
            skipped: 0,
            state: SyncState::Unsynced,
        };

        if exists && !options.full_refresh {
            tracing::info!(
                message = "document already downloaded, skipping fetch",
                document
            );
            transition(document, &mut state, SyncState::Synced);
            report.state = state;
            return Ok(report);
        }

        transition(document, &mut state, SyncState::Fetching);
        report.fetched = true;
        let stream = match self.fetcher.fetch_history(document, options.mode, progress) {
            Ok(stream) => stream,
            Err(source) => {
                transition(document, &mut state, SyncState::Failed(source.to_string()));
                tracing::error!(message = "fetch failed", document, error = %source);
                return Err(SyncError::Fetch {
                    document: document.to_string(),
                    source,
                });
            }
        };

        transition(document, &mut state, SyncState::Storing);
        for item in stream {
            let fragment = match item {
                Ok(fragment) => fragment,
                Err(source) => {
                    transition(document, &mut state, SyncState::Failed(source.to_string()));
                    tracing::error!(
                        message = "fetch failed while streaming",
                        document,
                        stored = report.stored,
                        error = %source
                    );
                    return Err(SyncError::Fetch {
                        document: document.to_string(),
                        source,
                    });
                }
            };

            match self.store_fragment(document, &fragment, options.text) {
                Ok(StoreOutcome::Written) => report.stored += 1,
                Ok(StoreOutcome::AlreadyExists) => report.already_present += 1,
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(
                        message = "skipping revision",
                        document,
                        position = fragment.index,
                        error = %e,
                        cause = ?std::error::Error::source(&e).map(ToString::to_string)
                    );
                }
            }
        }

        report.after = self.store.count_all(document).map_err(storage_error)?;
        transition(document, &mut state, SyncState::Synced);
        report.state = state;

        tracing::info!(
            message = "sync finished",
            document,
            total = report.after.total,
            new = report.newly_added(),
            already_present = report.already_present,
            skipped = report.skipped
        );
        Ok(report)
    }

    fn store_fragment(
        &self,
        document: &str,
        fragment: &RawFragment,
        text: TextMode,
    ) -> Result<StoreOutcome, FragmentError> {
        let record = parse_fragment(&fragment.bytes, text)?;
        let path = self.store.path_for(document, &record)?;
        Ok(self.store.store(&path, &fragment.bytes)?)
    }
}

impl<T: Transport + Sync> SyncOrchestrator<T> {
    /// Syncs the documents on a pool of at most `options.max_parallel` threads.
    /// Results come back in input order and a failing document does not affect the others.
    pub fn sync_many<P, F>(
        &self,
        documents: &[String],
        options: SyncOptions,
        make_progress: F,
    ) -> Vec<Result<SyncReport, SyncError>>
    where
        P: ProgressSink,
        F: Fn(&str) -> P + Sync,
    {
        let sync_one = |document: &String| self.sync(document, options, make_progress(document));

        let threads = options.max_parallel.clamp(1, documents.len().max(1));
        if threads == 1 {
            return documents.iter().map(sync_one).collect();
        }

        match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(|| documents.par_iter().map(sync_one).collect()),
            Err(e) => {
                tracing::warn!(
                    message = "could not start sync threads, syncing one document at a time",
                    error = %e
                );
                documents.iter().map(sync_one).collect()
            }
        }
    }
}
