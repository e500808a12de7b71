// SPDX-License-Identifier: MPL-2.0
//! # wikihistory
//!
//! Downloads the complete edit history of Wikimedia pages and stores every revision as its own file.
//!
//! ## Overview
//!
//! `wikihistory` talks to the `Special:Export` endpoint of a MediaWiki installation (English Wikipedia by
//! default), streams the exported XML and cuts it into one fragment per `<revision>`. Each fragment is
//! written verbatim to
//!
//! ```text
//! <data root>/<page>/<YYYY>/<MM>/<DD>/<revision id>.xml
//! ```
//!
//! The directory tree is the database: it is crash-safe (records appear atomically), inspectable with
//! ordinary tools and deduplicating (a revision that is already on disk is never written again). Later
//! analysis steps only need to read the files under the data root.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use wikihistory::config::Config;
//! use wikihistory::fetch::NoProgress;
//! use wikihistory::report::format_sync_report;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let orchestrator = config.orchestrator()?;
//!
//!     let report = orchestrator.sync("Taylor_Swift", config.sync, NoProgress)?;
//!     println!("{}", format_sync_report(&report));
//!     Ok(())
//! }
//! ```
//!
//! ### Reading the stored records
//!
//! ```no_run
//! use wikihistory::revision_parser::TextMode;
//! use wikihistory::storage::RecordStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RecordStore::new("data");
//!     for path in store.record_paths("Taylor_Swift")? {
//!         let record = store.read_record(&path, TextMode::LengthOnly)?;
//!         println!("{} {} {:?}", record.id, record.timestamp, record.text_length());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! - `timestamp`: the `YYYY-MM-DDTHH:MM:SSZ` wire format and the date components used in paths.
//! - `revision_parser`: decodes one `<revision>` fragment into a [`revision_parser::RevisionRecord`].
//!   Missing optional elements stay `None`, missing `id`/`timestamp` reject the fragment.
//! - `fetch`: builds export requests, retries transient failures with exponential backoff and yields
//!   raw fragments lazily from the response body.
//! - `storage`: maps records to paths, stores them idempotently and counts what is on disk.
//! - `sync`: decides whether to download and runs fetch → parse → store for one or many pages.
//! - `report`: formats counts and run summaries.
//! - `config`: default settings and construction of the HTTP-backed pipeline.
//!
//! ## Memory Usage
//!
//! Fragments are parsed and stored one at a time while the response is still downloading, so memory
//! use does not grow with the length of the history. With [`revision_parser::TextMode::LengthOnly`]
//! the page text is not even kept for the fragment being parsed, only its length.
//!
//! ## Logging and Error Handling
//!
//! - Uses the `tracing` crate; the binary installs a `tracing-subscriber` formatter on stderr whose
//!   level is chosen with `-v`/`-q`.
//! - A fragment that fails to parse or store is logged and counted, the run continues. Only a failed
//!   download fails the run for that page; other pages of a batch are unaffected.

pub mod config;
pub mod fetch;
pub mod report;
pub mod revision_parser;
pub mod storage;
pub mod sync;
#[cfg(test)]
mod test_support;
pub mod timestamp;
