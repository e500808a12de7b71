//! Fixtures shared by the unit tests: export documents, a scripted transport and a recording progress sink.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::{
    collections::{HashMap, VecDeque},
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::fetch::{
    ExportRequest, FetchConfig, ProgressSink, RetryPolicy, Transport, TransportError,
    TransportResponse,
};

pub fn zero_delay_config() -> FetchConfig {
    FetchConfig {
        export_url: "http://export.invalid/w/index.php".to_string(),
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::ZERO,
        },
        ..FetchConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct RevisionFixture {
    id: u64,
    timestamp: String,
    username: Option<String>,
    ip: Option<String>,
    comment: Option<String>,
    text: Option<String>,
}

impl RevisionFixture {
    pub fn new(id: u64, timestamp: &str) -> Self {
        Self {
            id,
            timestamp: timestamp.to_string(),
            username: None,
            ip: None,
            comment: None,
            text: None,
        }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn anonymous(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn to_xml(&self) -> Vec<u8> {
        let mut xml = Vec::new();
        let mut writer = quick_xml::Writer::new(Cursor::new(&mut xml));

        writer
            .write_event(Event::Start(BytesStart::new("revision")))
            .unwrap();
        write_element(&mut writer, "id", &self.id.to_string());
        write_element(&mut writer, "timestamp", &self.timestamp);

        if self.username.is_some() || self.ip.is_some() {
            writer
                .write_event(Event::Start(BytesStart::new("contributor")))
                .unwrap();
            if let Some(username) = &self.username {
                write_element(&mut writer, "username", username);
                write_element(&mut writer, "id", &self.id.wrapping_mul(10).to_string());
            }
            if let Some(ip) = &self.ip {
                write_element(&mut writer, "ip", ip);
            }
            writer
                .write_event(Event::End(BytesEnd::new("contributor")))
                .unwrap();
        }

        if let Some(comment) = &self.comment {
            write_element(&mut writer, "comment", comment);
        }
        write_element(&mut writer, "model", "wikitext");

        if let Some(text) = &self.text {
            let bytes_str = text.len().to_string();
            let attributes = vec![("bytes", bytes_str.as_str()), ("xml:space", "preserve")];
            writer
                .write_event(Event::Start(
                    BytesStart::new("text").with_attributes(attributes.into_iter()),
                ))
                .unwrap();
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .unwrap();
            writer
                .write_event(Event::End(BytesEnd::new("text")))
                .unwrap();
        }

        writer
            .write_event(Event::End(BytesEnd::new("revision")))
            .unwrap();
        xml
    }
}

fn write_element<W: std::io::Write>(writer: &mut quick_xml::Writer<W>, name: &str, value: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .unwrap();
    writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
}

const HEADER: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.11/" version="0.11" xml:lang="en">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <dbname>enwiki</dbname>
    <namespaces>
      <namespace key="0" case="first-letter" />
      <namespace key="1" case="first-letter">Talk</namespace>
    </namespaces>
  </siteinfo>
"#;

/// A Special:Export response for one page containing the given revision fragments.
pub fn export_xml(title: &str, revisions: &[Vec<u8>]) -> Vec<u8> {
    let mut xml = HEADER.as_bytes().to_vec();
    xml.extend_from_slice(b"  <page>\n    <title>");
    xml.extend_from_slice(title.as_bytes());
    xml.extend_from_slice(b"</title>\n    <ns>0</ns>\n    <id>20</id>\n");
    for revision in revisions {
        xml.extend_from_slice(b"    ");
        xml.extend_from_slice(revision);
        xml.push(b'\n');
    }
    xml.extend_from_slice(b"  </page>\n</mediawiki>\n");
    xml
}

/// What Special:Export answers for a title that does not exist.
pub fn missing_page_xml() -> Vec<u8> {
    let mut xml = HEADER.as_bytes().to_vec();
    xml.extend_from_slice(b"</mediawiki>\n");
    xml
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(u16, Vec<u8>),
    Fail(TransportError),
}

impl Scripted {
    pub fn ok(body: Vec<u8>) -> Self {
        Scripted::Respond(200, body)
    }

    pub fn status(status: u16) -> Self {
        Scripted::Respond(status, Vec::new())
    }

    pub fn timeout() -> Self {
        Scripted::Fail(TransportError::Timeout)
    }
}

/// Plays back canned responses, per title if registered with [`ScriptedTransport::with_title`].
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    default_script: Mutex<VecDeque<Scripted>>,
    by_title: Mutex<HashMap<String, VecDeque<Scripted>>>,
    attempts: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            default_script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn with_title(self, title: &str, script: Vec<Scripted>) -> Self {
        self.by_title
            .lock()
            .unwrap()
            .insert(title.to_string(), script.into());
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &ExportRequest) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let next = match self.by_title.lock().unwrap().get_mut(&request.title) {
            Some(script) => script.pop_front(),
            None => self.default_script.lock().unwrap().pop_front(),
        };

        match next {
            Some(Scripted::Respond(status, body)) => Ok(TransportResponse {
                status,
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body)),
            }),
            Some(Scripted::Fail(e)) => Err(e),
            None => Err(TransportError::Connection("script exhausted".to_string())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingProgress {
    received: Arc<AtomicU64>,
    total: Arc<Mutex<Option<u64>>>,
    finished: Arc<AtomicBool>,
}

impl RecordingProgress {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> Option<u64> {
        *self.total.lock().unwrap()
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingProgress {
    fn on_bytes(&self, received: u64, total: Option<u64>) {
        self.received.store(received, Ordering::SeqCst);
        *self.total.lock().unwrap() = total;
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
