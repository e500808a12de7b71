use std::fmt::{self, Debug, Display};

use compact_str::CompactString;
use quick_xml::events::{BytesStart, Event};

use crate::timestamp::{FormatError, Timestamp};

// tags of a single <revision> fragment that carry values we keep, plus their parents
#[derive(Debug, PartialEq, Eq)]
enum Tag {
    Revision, // <revision>...tags are (id, parentid, timestamp, contributor, minor, comment, text, sha1)</revision>
    Id,       // <id>500</id>
    ParentId, // <parentid>499</parentid>
    Timestamp, // <timestamp>2003-12-05T06:41:50Z</timestamp>
    Contributor { deleted: bool }, // <contributor><username>blah</username><id>500</id></contributor> or <contributor deleted="deleted" />
    Username, // <username>blah</username>
    Ip,       // <ip>127.0.0.1</ip> for anonymous edits
    Comment { deleted: bool }, // <comment>blah</comment> or <comment deleted="deleted" />
    Text { deleted: bool }, // <text bytes="20" xml:space="preserve">blah</text> or <text bytes="20" deleted="deleted" />
    Sha1,  // <sha1>3h3w...</sha1>
    Minor, // <minor />
    Unknown, // model, format, origin, ...
}

impl Tag {
    fn from_start_bytes(e: &BytesStart) -> Result<Self, quick_xml::Error> {
        let tag = match e.local_name().as_ref() {
            b"revision" => Tag::Revision,
            b"id" => Tag::Id,
            b"parentid" => Tag::ParentId,
            b"timestamp" => Tag::Timestamp,
            b"contributor" => Tag::Contributor {
                deleted: has_deleted_attribute(e)?,
            },
            b"username" => Tag::Username,
            b"ip" => Tag::Ip,
            b"comment" => Tag::Comment {
                deleted: has_deleted_attribute(e)?,
            },
            b"text" => Tag::Text {
                deleted: has_deleted_attribute(e)?,
            },
            b"sha1" => Tag::Sha1,
            b"minor" => Tag::Minor,
            _ => Tag::Unknown,
        };
        Ok(tag)
    }
}

fn has_deleted_attribute(e: &BytesStart) -> Result<bool, quick_xml::Error> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == b"deleted" {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Numeric revision identifier assigned by the wiki.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(pub u64);

impl Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who made an edit.
///
/// A `None` field means the element was not part of the `<contributor>` block,
/// which is different from an element that is present but empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Contributor {
    pub username: Option<CompactString>,
    pub userid: Option<CompactString>,
    /// Set for anonymous edits instead of `username`/`userid`.
    pub ip: Option<CompactString>,
    /// The contributor has been suppressed on the wiki.
    pub deleted: bool,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Text {
    /// Full body, kept with [`TextMode::Full`].
    Full(String),
    /// Number of characters in the body, kept with [`TextMode::LengthOnly`].
    Length(usize),
    Deleted,
}

impl Text {
    /// Length in characters; deleted text counts as empty.
    pub fn len(&self) -> usize {
        match self {
            Text::Full(text) => text.chars().count(),
            Text::Length(len) => *len,
            Text::Deleted => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Text::Full(text) => write!(f, "{:?}", text),
            Text::Length(len) => write!(f, "Length({})", len),
            Text::Deleted => write!(f, "Deleted"),
        }
    }
}

/// How much of the revision body to keep while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextMode {
    /// Only count characters, the body itself is dropped while streaming.
    #[default]
    LengthOnly,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionRecord {
    pub id: RevisionId,
    pub parent_id: Option<RevisionId>,
    pub timestamp: Timestamp,
    pub contributor: Option<Contributor>,
    pub comment: Option<CompactString>,
    /// The edit summary has been suppressed; `comment` is `None` in that case.
    pub comment_deleted: bool,
    pub text: Option<Text>,
    pub sha1: Option<CompactString>,
    pub minor: bool,
}

impl RevisionRecord {
    pub fn text_length(&self) -> Option<usize> {
        self.text.as_ref().map(Text::len)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing mandatory field: {0}")]
    MissingField(&'static str),
    #[error("malformed revision: {0}")]
    Malformed(String),
    #[error("invalid revision timestamp")]
    InvalidTimestamp(#[from] FormatError),
    #[error("XML error")]
    Xml(#[from] quick_xml::Error),
}

enum TextBuffer {
    Full(String),
    Length(usize),
    Deleted,
}

impl TextBuffer {
    fn push_str(&mut self, s: &str) {
        match self {
            TextBuffer::Full(text) => text.push_str(s),
            TextBuffer::Length(len) => *len += s.chars().count(),
            TextBuffer::Deleted => {}
        }
    }
}

struct RecordBuilder {
    mode: TextMode,
    id: Option<String>,
    parent_id: Option<String>,
    timestamp: Option<String>,
    contributor: Option<Contributor>,
    comment: Option<CompactString>,
    comment_deleted: bool,
    text: Option<TextBuffer>,
    sha1: Option<CompactString>,
    minor: bool,
}

impl RecordBuilder {
    fn new(mode: TextMode) -> Self {
        Self {
            mode,
            id: None,
            parent_id: None,
            timestamp: None,
            contributor: None,
            comment: None,
            comment_deleted: false,
            text: None,
            sha1: None,
            minor: false,
        }
    }

    // an opened element counts as present even if it never receives any text
    fn open(&mut self, path: &[Tag]) {
        use Tag::*;

        match path {
            [Revision] => {}
            [Revision, Id] => self.id = Some(String::new()),
            [Revision, ParentId] => self.parent_id = Some(String::new()),
            [Revision, Timestamp] => self.timestamp = Some(String::new()),
            [Revision, Contributor { deleted }] => {
                self.contributor = Some(self::Contributor {
                    deleted: *deleted,
                    ..Default::default()
                });
            }
            [Revision, Contributor { .. }, Username] => {
                if let Some(contributor) = &mut self.contributor {
                    contributor.username = Some(CompactString::default());
                }
            }
            [Revision, Contributor { .. }, Id] => {
                if let Some(contributor) = &mut self.contributor {
                    contributor.userid = Some(CompactString::default());
                }
            }
            [Revision, Contributor { .. }, Ip] => {
                if let Some(contributor) = &mut self.contributor {
                    contributor.ip = Some(CompactString::default());
                }
            }
            [Revision, Comment { deleted: false }] => self.comment = Some(CompactString::default()),
            [Revision, Comment { deleted: true }] => self.comment_deleted = true,
            [Revision, Text { deleted }] => {
                self.text = Some(match (*deleted, self.mode) {
                    (true, _) => TextBuffer::Deleted,
                    (false, TextMode::Full) => TextBuffer::Full(String::new()),
                    (false, TextMode::LengthOnly) => TextBuffer::Length(0),
                });
            }
            [Revision, Sha1] => self.sha1 = Some(CompactString::default()),
            [Revision, Minor] => self.minor = true,
            [.., last] => {
                // debugging aid for format changes
                if *last != Unknown && !path.contains(&Unknown) {
                    tracing::debug!(
                        message = "found known tag in unexpected location",
                        tag = ?last,
                        path = ?path
                    );
                }
            }
            [] => {}
        }
    }

    fn append(&mut self, path: &[Tag], s: &str) {
        use Tag::*;

        match path {
            [Revision, Id] => push_opt(&mut self.id, s),
            [Revision, ParentId] => push_opt(&mut self.parent_id, s),
            [Revision, Timestamp] => push_opt(&mut self.timestamp, s),
            [Revision, Contributor { .. }, Username] => {
                if let Some(contributor) = &mut self.contributor {
                    push_compact(&mut contributor.username, s);
                }
            }
            [Revision, Contributor { .. }, Id] => {
                if let Some(contributor) = &mut self.contributor {
                    push_compact(&mut contributor.userid, s);
                }
            }
            [Revision, Contributor { .. }, Ip] => {
                if let Some(contributor) = &mut self.contributor {
                    push_compact(&mut contributor.ip, s);
                }
            }
            [Revision, Comment { .. }] => push_compact(&mut self.comment, s),
            [Revision, Text { .. }] => {
                if let Some(text) = &mut self.text {
                    text.push_str(s);
                }
            }
            [Revision, Sha1] => push_compact(&mut self.sha1, s),
            _ => {}
        }
    }

    fn try_build(self) -> Result<RevisionRecord, ParseError> {
        let id = self.id.ok_or(ParseError::MissingField("id"))?;
        let id = parse_revision_id(&id).ok_or_else(|| {
            ParseError::Malformed(format!("revision id `{}` is not a number", id.trim()))
        })?;

        let timestamp = self.timestamp.ok_or(ParseError::MissingField("timestamp"))?;
        let timestamp = Timestamp::parse(timestamp.trim())?;

        let parent_id = self.parent_id.and_then(|text| {
            let parsed = parse_revision_id(&text);
            if parsed.is_none() {
                tracing::warn!(
                    message = "Found invalid parent revision id, ignoring it",
                    revision = %id,
                    parent_id = text.as_str()
                );
            }
            parsed
        });

        Ok(RevisionRecord {
            id,
            parent_id,
            timestamp,
            contributor: self.contributor,
            comment: self.comment,
            comment_deleted: self.comment_deleted,
            text: self.text.map(|text| match text {
                TextBuffer::Full(text) => Text::Full(text),
                TextBuffer::Length(len) => Text::Length(len),
                TextBuffer::Deleted => Text::Deleted,
            }),
            sha1: self.sha1,
            minor: self.minor,
        })
    }
}

fn push_opt(target: &mut Option<String>, s: &str) {
    if let Some(value) = target {
        value.push_str(s);
    }
}

fn push_compact(target: &mut Option<CompactString>, s: &str) {
    if let Some(value) = target {
        value.push_str(s);
    }
}

fn parse_revision_id(text: &str) -> Option<RevisionId> {
    text.trim().parse().ok().map(RevisionId)
}

/// Decodes a single `<revision>...</revision>` fragment.
///
/// Optional elements that are missing from the fragment come back as `None`;
/// `id` and `timestamp` are mandatory and a fragment without them is rejected.
pub fn parse_fragment(raw: &[u8], mode: TextMode) -> Result<RevisionRecord, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(raw);
    let mut buf = Vec::new();
    let mut path: Vec<Tag> = Vec::new();
    let mut builder = RecordBuilder::new(mode);

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let tag = Tag::from_start_bytes(e)?;
                if path.is_empty() && tag != Tag::Revision {
                    return Err(ParseError::Malformed(format!(
                        "root element is `{}`, expected `revision`",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                path.push(tag);
                builder.open(&path);
            }
            Event::Empty(ref e) => {
                let tag = Tag::from_start_bytes(e)?;
                if path.is_empty() {
                    // <revision /> has neither id nor timestamp
                    return Err(ParseError::MissingField("id"));
                }
                path.push(tag);
                builder.open(&path);
                path.pop();
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                builder.append(&path, &text);
            }
            Event::CData(e) => {
                let bytes = e.into_inner();
                builder.append(&path, &String::from_utf8_lossy(&bytes));
            }
            Event::End(_) => {
                path.pop();
                if path.is_empty() {
                    break;
                }
            }
            Event::Eof => {
                return Err(ParseError::Malformed(if path.is_empty() {
                    "fragment contains no revision element".to_string()
                } else {
                    "unexpected end of fragment".to_string()
                }));
            }
            _ => {}
        }
        buf.clear();
    }

    builder.try_build()
}

/// Parses a sequence of fragments, yielding one result per fragment in input order.
pub fn parse_fragments<I>(
    fragments: I,
    mode: TextMode,
) -> impl Iterator<Item = Result<RevisionRecord, ParseError>>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    fragments
        .into_iter()
        .map(move |fragment| parse_fragment(fragment.as_ref(), mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RevisionFixture;

    const FULL: &str = r#"<revision>
      <id>1187041563</id>
      <parentid>1186998442</parentid>
      <timestamp>2023-11-25T18:02:11Z</timestamp>
      <contributor>
        <username>Some &amp; Editor</username>
        <id>4242</id>
      </contributor>
      <minor />
      <comment>fix typo</comment>
      <origin>1187041563</origin>
      <model>wikitext</model>
      <format>text/x-wiki</format>
      <text bytes="11" sha1="abc" xml:space="preserve">Grüße, 世界</text>
      <sha1>abc</sha1>
    </revision>"#;

    #[test]
    fn parses_all_fields() {
        let record = parse_fragment(FULL.as_bytes(), TextMode::Full).unwrap();

        assert_eq!(record.id, RevisionId(1187041563));
        assert_eq!(record.parent_id, Some(RevisionId(1186998442)));
        assert_eq!(record.timestamp.to_string(), "2023-11-25T18:02:11Z");
        assert_eq!(
            record.contributor,
            Some(Contributor {
                username: Some("Some & Editor".into()),
                userid: Some("4242".into()),
                ip: None,
                deleted: false,
            })
        );
        assert!(record.minor);
        assert_eq!(record.comment.as_deref(), Some("fix typo"));
        assert_eq!(record.text, Some(Text::Full("Grüße, 世界".to_string())));
        assert_eq!(record.text_length(), Some(9));
        assert_eq!(record.sha1.as_deref(), Some("abc"));
    }

    #[test]
    fn length_only_mode_drops_body() {
        let record = parse_fragment(FULL.as_bytes(), TextMode::LengthOnly).unwrap();
        assert_eq!(record.text, Some(Text::Length(9)));
    }

    #[test]
    fn revision_id_is_not_confused_with_contributor_id() {
        let xml = "<revision><contributor><id>7</id></contributor><timestamp>2020-01-01T00:00:00Z</timestamp></revision>";
        assert!(matches!(
            parse_fragment(xml.as_bytes(), TextMode::LengthOnly),
            Err(ParseError::MissingField("id"))
        ));
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let xml = "<revision><id>1</id></revision>";
        assert!(matches!(
            parse_fragment(xml.as_bytes(), TextMode::LengthOnly),
            Err(ParseError::MissingField("timestamp"))
        ));
    }

    #[test]
    fn unparsable_timestamp_is_rejected() {
        let xml = "<revision><id>1</id><timestamp>2020-01-01 00:00</timestamp></revision>";
        assert!(matches!(
            parse_fragment(xml.as_bytes(), TextMode::LengthOnly),
            Err(ParseError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn non_numeric_id_is_malformed() {
        let xml = "<revision><id>abc</id><timestamp>2020-01-01T00:00:00Z</timestamp></revision>";
        assert!(matches!(
            parse_fragment(xml.as_bytes(), TextMode::LengthOnly),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_root_and_broken_xml_are_errors() {
        assert!(matches!(
            parse_fragment(b"<page><id>1</id></page>", TextMode::LengthOnly),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_fragment(b"", TextMode::LengthOnly),
            Err(ParseError::Malformed(_))
        ));
        assert!(parse_fragment(b"<revision><id>1</timestamp></revision>", TextMode::LengthOnly).is_err());
        assert!(matches!(
            parse_fragment(b"<revision><id>1</id>", TextMode::LengthOnly),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn optional_fields_keep_presence() {
        let minimal = "<revision><id>1</id><timestamp>2020-01-01T00:00:00Z</timestamp></revision>";
        let record = parse_fragment(minimal.as_bytes(), TextMode::Full).unwrap();
        assert_eq!(record.contributor, None);
        assert_eq!(record.comment, None);
        assert!(!record.comment_deleted);
        assert_eq!(record.text, None);
        assert_eq!(record.text_length(), None);
        assert_eq!(record.parent_id, None);
        assert!(!record.minor);

        let empty = "<revision><id>1</id><timestamp>2020-01-01T00:00:00Z</timestamp><contributor></contributor><comment></comment><text bytes=\"0\" /></revision>";
        let record = parse_fragment(empty.as_bytes(), TextMode::Full).unwrap();
        assert_eq!(record.contributor, Some(Contributor::default()));
        assert_eq!(record.comment.as_deref(), Some(""));
        assert_eq!(record.text, Some(Text::Full(String::new())));
    }

    #[test]
    fn anonymous_and_suppressed_edits() {
        let anonymous = "<revision><id>2</id><timestamp>2020-01-01T00:00:00Z</timestamp><contributor><ip>192.0.2.1</ip></contributor></revision>";
        let record = parse_fragment(anonymous.as_bytes(), TextMode::LengthOnly).unwrap();
        let contributor = record.contributor.unwrap();
        assert_eq!(contributor.username, None);
        assert_eq!(contributor.ip.as_deref(), Some("192.0.2.1"));

        let suppressed = r#"<revision><id>3</id><timestamp>2020-01-01T00:00:00Z</timestamp><contributor deleted="deleted" /><comment deleted="deleted" /><text bytes="10" deleted="deleted" /></revision>"#;
        let record = parse_fragment(suppressed.as_bytes(), TextMode::Full).unwrap();
        assert_eq!(
            record.contributor,
            Some(Contributor {
                deleted: true,
                ..Default::default()
            })
        );
        assert_eq!(record.comment, None);
        assert!(record.comment_deleted);
        assert_eq!(record.text, Some(Text::Deleted));
        assert_eq!(record.text_length(), Some(0));
    }

    #[test]
    fn malformed_fragment_does_not_affect_neighbours() {
        let mut fragments: Vec<Vec<u8>> = (1..=5)
            .map(|id| RevisionFixture::new(id, "2021-05-01T12:00:00Z").to_xml())
            .collect();
        fragments[2] = b"<revision><timestamp>2021-05-01T12:00:00Z</timestamp></revision>".to_vec();

        let results: Vec<_> = parse_fragments(&fragments, TextMode::LengthOnly).collect();
        assert_eq!(results.len(), 5);
        for (position, result) in results.iter().enumerate() {
            if position == 2 {
                assert!(matches!(result, Err(ParseError::MissingField("id"))));
            } else {
                assert_eq!(result.as_ref().unwrap().id, RevisionId(position as u64 + 1));
            }
        }
    }
}
