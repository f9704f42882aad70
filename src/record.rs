//! Header extraction and validation for fetched record XML.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

use crate::setspec;

/// A freshly fetched record, ready to be committed to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub identifier: String,
    pub prefix: String,
    /// Relative content store path of the cached XML.
    pub path: String,
    /// Datestamp declared in the record header.
    pub datestamp: DateTime<Utc>,
    /// Declared set specs plus all of their ancestors.
    pub set_specs: Vec<String>,
}

impl ParsedRecord {
    /// Parse the header of the cached file at `file`.
    pub fn parse(identifier: &str, prefix: &str, path: &str, file: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let header = parse_header(&xml)?;

        let Some(datestamp) = header.datestamp else {
            bail!("Record header has no datestamp");
        };
        let datestamp = parse_datestamp(&datestamp)?;

        let mut set_specs: Vec<String> = Vec::new();
        for spec in &header.set_specs {
            for s in setspec::all_sets_for(spec) {
                if !set_specs.contains(&s) {
                    set_specs.push(s);
                }
            }
        }

        Ok(Self {
            identifier: identifier.to_string(),
            prefix: prefix.to_string(),
            path: path.to_string(),
            datestamp,
            set_specs,
        })
    }
}

#[derive(Debug, Default)]
struct Header {
    identifier: Option<String>,
    datestamp: Option<String>,
    set_specs: Vec<String>,
    closed: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Identifier,
    Datestamp,
    SetSpec,
}

/// Scan `xml` up to the end of its `header` element.
fn parse_header(xml: &str) -> Result<Header> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut header = Header::default();
    let mut in_header = false;
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"header" => in_header = true,
                b"identifier" if in_header => field = Field::Identifier,
                b"datestamp" if in_header => field = Field::Datestamp,
                b"setSpec" if in_header => field = Field::SetSpec,
                _ => field = Field::None,
            },
            Ok(Event::Text(t)) => {
                if field != Field::None {
                    let text = t.unescape()?.trim().to_string();
                    match field {
                        Field::Identifier => header.identifier = Some(text),
                        Field::Datestamp => header.datestamp = Some(text),
                        Field::SetSpec => header.set_specs.push(text),
                        Field::None => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"header" {
                    header.closed = true;
                    break;
                }
                field = Field::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("Malformed record XML at {}: {}", reader.buffer_position(), e),
            _ => {}
        }
    }

    if !header.closed {
        bail!("Record has no complete header element");
    }
    Ok(header)
}

/// Accepts `YYYY-MM-DDThh:mm:ssZ` or `YYYY-MM-DD`.
pub fn parse_datestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ") {
        return Ok(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    bail!("Unparsable datestamp: {:?}", value)
}

/// Checks fetched record XML before it is accepted into the cache.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, prefix: &str, xml: &str) -> Result<()>;
}

/// Requires a well-formed document rooted at `record` whose header carries an
/// identifier and a datestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct WellFormedValidator;

impl RecordValidator for WellFormedValidator {
    fn validate(&self, _prefix: &str, xml: &str) -> Result<()> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut root: Option<String> = None;
        let mut depth: usize = 0;
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if root.is_none() {
                        root = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                    } else if depth == 0 {
                        bail!("Content after the root element");
                    }
                    depth += 1;
                }
                Ok(Event::Empty(e)) => {
                    if root.is_none() {
                        root = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                    }
                }
                Ok(Event::End(_)) => depth = depth.saturating_sub(1),
                Ok(Event::Eof) => break,
                Err(e) => bail!("Malformed XML at {}: {}", reader.buffer_position(), e),
                _ => {}
            }
        }

        match root.as_deref() {
            Some("record") => {}
            Some(other) => bail!("Expected a record element, found {}", other),
            None => bail!("Empty document"),
        }
        if depth != 0 {
            bail!("Unclosed elements at end of document");
        }

        let header = parse_header(xml)?;
        if header.identifier.as_deref().map_or(true, str::is_empty) {
            bail!("Record header has no identifier");
        }
        match header.datestamp {
            Some(d) => {
                parse_datestamp(&d)?;
            }
            None => bail!("Record header has no datestamp"),
        }
        Ok(())
    }
}
