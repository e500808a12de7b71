use std::{
    fmt::Debug,
    io::{BufReader, Read},
    sync::Arc,
    time::Duration,
};

use quick_xml::{events::Event, Writer};

pub const DEFAULT_EXPORT_URL: &str = "https://en.wikipedia.org/w/index.php";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "wikihistory/",
    env!("CARGO_PKG_VERSION"),
    " (revision history downloader)"
);
// Special:Export refuses to return more than 1000 revisions per bounded request
pub const MAX_EXPORT_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Most recent revisions first.
    #[default]
    Desc,
    Asc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Desc => "desc",
            Direction::Asc => "asc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Up to `limit` revisions from one end of the history in a single request.
    Limited { limit: u32, direction: Direction },
    /// The whole history, streamed in a single request.
    #[default]
    FullHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One call against the export endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub title: String,
    pub method: Method,
    pub url: String,
    pub params: Vec<(&'static str, String)>,
}

impl ExportRequest {
    pub fn new(export_url: &str, title: &str, mode: FetchMode) -> Self {
        let mut params = vec![
            ("title", "Special:Export".to_string()),
            ("pages", title.to_string()),
        ];

        let method = match mode {
            FetchMode::Limited { limit, direction } => {
                params.push(("limit", limit.clamp(1, MAX_EXPORT_LIMIT).to_string()));
                params.push(("dir", direction.as_str().to_string()));
                Method::Post
            }
            FetchMode::FullHistory => {
                params.push(("history", "1".to_string()));
                Method::Get
            }
        };
        params.push(("action", "submit".to_string()));

        Self {
            title: title.to_string(),
            method,
            url: export_url.to_string(),
            params,
        }
    }
}

/// Exponential backoff: the n-th retry waits `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub export_url: String,
    pub user_agent: String,
    /// Per-attempt timeout of the HTTP client.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            export_url: DEFAULT_EXPORT_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("page `{title}` not found (HTTP {status})")]
    NotFound { title: String, status: u16 },
    #[error("export of `{title}` contains no page element, the page probably does not exist")]
    InvalidDocument { title: String },
    #[error("giving up after {attempts} attempts, last failure: {last_failure}")]
    Exhausted { attempts: u32, last_failure: String },
    #[error("timed out while reading the response body")]
    Timeout,
    #[error("I/O error while reading the response body")]
    Io(#[source] Arc<std::io::Error>),
    #[error("XML error in the response body")]
    Stream(#[source] quick_xml::Error),
    #[error("response body ended in the middle of a revision")]
    UnexpectedEof,
    #[error("failed to copy revision fragment: {0}")]
    Capture(String),
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

fn stream_error(e: quick_xml::Error) -> FetchError {
    match e {
        quick_xml::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            FetchError::Timeout
        }
        quick_xml::Error::Io(io) => FetchError::Io(io),
        e => FetchError::Stream(e),
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Failure to get any response at all. Always considered transient.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
}

pub trait Transport {
    fn send(&self, request: &ExportRequest) -> Result<TransportResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: &ExportRequest) -> Result<TransportResponse, TransportError> {
        (**self).send(request)
    }
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ExportRequest) -> Result<TransportResponse, TransportError> {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url).query(&request.params),
            Method::Post => self.client.post(&request.url).form(&request.params),
        };

        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        Ok(TransportResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// Receives download progress; must not block.
pub trait ProgressSink {
    fn on_bytes(&self, received: u64, total: Option<u64>);
    fn finish(&self) {}
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_bytes(&self, _received: u64, _total: Option<u64>) {}
}

impl<P: ProgressSink + ?Sized> ProgressSink for &P {
    fn on_bytes(&self, received: u64, total: Option<u64>) {
        (**self).on_bytes(received, total)
    }

    fn finish(&self) {
        (**self).finish()
    }
}

pub struct ProgressReader<R, P> {
    inner: R,
    sink: P,
    received: u64,
    total: Option<u64>,
    finished: bool,
}

impl<R: Read, P: ProgressSink> ProgressReader<R, P> {
    pub fn new(inner: R, sink: P, total: Option<u64>) -> Self {
        Self {
            inner,
            sink,
            received: 0,
            total,
            finished: false,
        }
    }
}

impl<R: Read, P: ProgressSink> Read for ProgressReader<R, P> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.received += n as u64;
            self.sink.on_bytes(self.received, self.total);
        } else if !buf.is_empty() && !self.finished {
            self.finished = true;
            self.sink.finish();
        }
        Ok(n)
    }
}

/// Raw bytes of one `<revision>` element as found in the export, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFragment {
    /// Position in the stream, starting at 0.
    pub index: usize,
    pub bytes: Vec<u8>,
}

impl AsRef<[u8]> for RawFragment {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Page,
    Other,
}

/// Lazily cuts revision fragments out of an export response.
///
/// Single pass: once it returned `None` or an error it stays exhausted.
/// Only revisions that are direct children of a `<page>` are yielded; a
/// response without any `<page>` is reported as [`FetchError::InvalidDocument`].
pub struct RevisionStream<R: Read> {
    title: String,
    xml_parser: quick_xml::Reader<BufReader<R>>,
    buf: Vec<u8>,
    current_path: Vec<Level>,
    seen_page: bool,
    emitted: usize,
    exhausted: bool,
}

impl<R: Read> Debug for RevisionStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStream")
            .field("title", &self.title)
            .field("buf.len", &self.buf.len())
            .field("current_path", &self.current_path)
            .field("seen_page", &self.seen_page)
            .field("emitted", &self.emitted)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

fn write_captured(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), FetchError> {
    writer
        .write_event(event)
        .map_err(|e| FetchError::Capture(e.to_string()))
}

impl<R: Read> RevisionStream<R> {
    pub fn new(title: &str, reader: R) -> Self {
        Self {
            title: title.to_string(),
            xml_parser: quick_xml::Reader::from_reader(BufReader::new(reader)),
            buf: Vec::with_capacity(64 * 1024),
            current_path: Vec::new(),
            seen_page: false,
            emitted: 0,
            exhausted: false,
        }
    }

    fn next_fragment(&mut self) -> Result<Option<RawFragment>, FetchError> {
        loop {
            let mut open_revision = None;
            let mut empty_revision = None;

            match self.xml_parser.read_event_into(&mut self.buf).map_err(stream_error)? {
                Event::Start(ref e) => {
                    let is_revision = e.local_name().as_ref() == b"revision";
                    if is_revision && self.current_path.last() == Some(&Level::Page) {
                        let mut writer = Writer::new(Vec::new());
                        write_captured(&mut writer, Event::Start(e.clone()))?;
                        open_revision = Some(writer);
                    } else if e.local_name().as_ref() == b"page" {
                        self.seen_page = true;
                        self.current_path.push(Level::Page);
                    } else {
                        if is_revision {
                            tracing::debug!(
                                message = "ignoring revision outside of a page",
                                position = self.xml_parser.buffer_position()
                            );
                        }
                        self.current_path.push(Level::Other);
                    }
                }
                Event::Empty(ref e) => {
                    if e.local_name().as_ref() == b"page" {
                        self.seen_page = true;
                    } else if e.local_name().as_ref() == b"revision"
                        && self.current_path.last() == Some(&Level::Page)
                    {
                        // an empty revision will not parse, but it still occupies a position
                        let mut writer = Writer::new(Vec::new());
                        write_captured(&mut writer, Event::Empty(e.clone()))?;
                        empty_revision = Some(writer);
                    }
                }
                Event::End(_) => {
                    self.current_path.pop();
                }
                Event::Eof => {
                    if !self.seen_page {
                        return Err(FetchError::InvalidDocument {
                            title: self.title.clone(),
                        });
                    }
                    if !self.current_path.is_empty() {
                        tracing::error!(
                            message = "response ended with unclosed elements",
                            depth = self.current_path.len()
                        );
                        return Err(FetchError::UnexpectedEof);
                    }
                    return Ok(None);
                }
                _ => {}
            }
            self.buf.clear();

            if let Some(writer) = open_revision {
                return self.capture_revision(writer).map(Some);
            }
            if let Some(writer) = empty_revision {
                return Ok(Some(self.emit(writer)));
            }
        }
    }

    // copies events verbatim until the matching </revision>
    fn capture_revision(&mut self, mut writer: Writer<Vec<u8>>) -> Result<RawFragment, FetchError> {
        let mut depth = 1usize;
        loop {
            let event = self
                .xml_parser
                .read_event_into(&mut self.buf)
                .map_err(stream_error)?;
            match &event {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth -= 1,
                Event::Eof => {
                    tracing::error!(
                        message = "response ended inside a revision",
                        position = self.emitted
                    );
                    return Err(FetchError::UnexpectedEof);
                }
                _ => {}
            }
            write_captured(&mut writer, event)?;
            self.buf.clear();

            if depth == 0 {
                return Ok(self.emit(writer));
            }
        }
    }

    fn emit(&mut self, writer: Writer<Vec<u8>>) -> RawFragment {
        let fragment = RawFragment {
            index: self.emitted,
            bytes: writer.into_inner(),
        };
        self.emitted += 1;
        fragment
    }

    /// Number of fragments yielded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl<R: Read> Iterator for RevisionStream<R> {
    type Item = Result<RawFragment, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        match self.next_fragment() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

pub type ResponseBody<P> = ProgressReader<Box<dyn Read + Send>, P>;

pub struct Fetcher<T: Transport> {
    transport: T,
    config: FetchConfig,
}

impl Fetcher<HttpTransport> {
    pub fn from_config(config: FetchConfig) -> Result<Self, FetchError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, config: FetchConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Requests the history of `title` and returns a lazy stream of its revision fragments.
    ///
    /// Transient failures (no response, 5xx, 408, 429) are retried according to the
    /// [`RetryPolicy`]; any other 4xx fails right away with [`FetchError::NotFound`].
    pub fn fetch_history<P: ProgressSink>(
        &self,
        title: &str,
        mode: FetchMode,
        progress: P,
    ) -> Result<RevisionStream<ResponseBody<P>>, FetchError> {
        let request = ExportRequest::new(&self.config.export_url, title, mode);
        let response = self.send_with_retry(&request)?;

        tracing::info!(
            message = "receiving revisions",
            title,
            content_length = response.content_length
        );

        let body = ProgressReader::new(response.body, progress, response.content_length);
        Ok(RevisionStream::new(title, body))
    }

    fn send_with_retry(&self, request: &ExportRequest) -> Result<TransportResponse, FetchError> {
        let retry = self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            match self.transport.send(request) {
                Ok(response) if (200..300).contains(&response.status) => {
                    tracing::debug!(message = "export request succeeded", attempt);
                    return Ok(response);
                }
                Ok(response) if is_permanent(response.status) => {
                    return Err(FetchError::NotFound {
                        title: request.title.clone(),
                        status: response.status,
                    });
                }
                Ok(response) => last_failure = format!("HTTP status {}", response.status),
                Err(e) => last_failure = e.to_string(),
            }

            if attempt < max_attempts {
                let delay = retry.delay_after(attempt);
                tracing::warn!(
                    message = "export request failed, retrying",
                    title = request.title.as_str(),
                    attempt,
                    max_attempts,
                    failure = last_failure.as_str(),
                    delay = ?delay
                );
                std::thread::sleep(delay);
            }
        }

        Err(FetchError::Exhausted {
            attempts: max_attempts,
            last_failure,
        })
    }
}

// request timeout and rate limiting are client errors, but worth another try
fn is_permanent(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}
