//! The pipe-delimited HL7 v2 grammar.
//!
//! A [`Message`] is a list of [`Segment`]s. Each segment is split into fields by the field separator,
//! fields into repetitions, repetitions into components and components into sub-components, using
//! the delimiters declared by the message's own `MSH` header. Values are read lazily and unescaped
//! on access. Indices follow HL7 conventions: `PID-5.1.1` is field 5, component 1, sub-component 1,
//! and only the first repetition of a field is ever addressed by the component accessors.

use std::borrow::Cow;

use log::{debug, warn};

use crate::error::ParseError;

const HEADER_ID: &str = "MSH";

/// Segment ids recognised when rebuilding segment boundaries from a payload that lost its CRs.
/// Site-defined `Z` segments are recognised as well.
const KNOWN_SEGMENT_IDS: &[&str] = &[
    "MSH", "MSA", "ERR", "SFT", "UAC", "EVN", "PID", "PD1", "PV1", "PV2", "NK1", "NTE", "ROL", "MRG",
    "AL1", "IAM", "DG1", "DRG", "PR1", "GT1", "IN1", "IN2", "IN3", "ACC", "UB1", "UB2", "DB1", "PDA",
    "ORC", "OBR", "OBX", "TQ1", "TQ2", "CTD", "CTI", "FT1", "BLG", "SPM", "SAC", "INV", "TXA", "RXO",
    "RXE", "RXD", "RXG", "RXA", "RXR", "RXC", "QRD", "QRF", "QPD", "QAK", "RCP", "DSC",
];

/// Field separators a segment must already hold before another segment may start inside it.
/// Keeps identifiers such as `OBX-3` whole when their text ends in a segment id.
const MIN_FIELD_SEPARATORS: &[(&str, usize)] = &[(HEADER_ID, 8), ("PID", 3), ("OBX", 5)];

/// The separator and escape characters a message is encoded with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: Option<char>,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: Some('\\'),
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// Reads the delimiters declared at the start of an `MSH` segment (MSH-1 and MSH-2).
    fn from_header(header: &str) -> Result<Self, ParseError> {
        let mut chars = header.chars().skip(HEADER_ID.len());
        let field = chars.next().ok_or_else(|| {
            ParseError::MalformedMessage("MSH segment has no field separator".to_owned())
        })?;
        if field.is_alphanumeric() || field.is_whitespace() {
            return Err(ParseError::MalformedMessage(format!(
                "invalid field separator {field:?} in MSH segment"
            )));
        }

        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        let defaults = Self::default();
        Ok(Self {
            field,
            component: encoding.first().copied().unwrap_or(defaults.component),
            repetition: encoding.get(1).copied().unwrap_or(defaults.repetition),
            escape: encoding.get(2).copied().or(defaults.escape),
            subcomponent: encoding.get(3).copied().unwrap_or(defaults.subcomponent),
        })
    }

    /// The MSH-2 encoding characters for these delimiters.
    pub fn encoding_characters(&self) -> String {
        let mut encoding = String::with_capacity(4);
        encoding.push(self.component);
        encoding.push(self.repetition);
        if let Some(escape) = self.escape {
            encoding.push(escape);
        }
        encoding.push(self.subcomponent);
        encoding
    }
}

/// One decoded HL7 message. The first segment is always the `MSH` header.
#[derive(Clone, Debug)]
pub struct Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
}

impl Message {
    /// Splits `text` into segments.
    ///
    /// Segments are separated by CR or LF. Anything before the first `MSH` segment is ignored. When the
    /// whole payload is a single line (an MLLP framer that strips every CR produces exactly that), the
    /// line is cut in front of each known segment id followed by the field separator.
    ///
    /// # Errors
    ///
    /// [`ParseError::MalformedMessage`] when no `MSH` segment exists or its delimiters can't be read.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let lines: Vec<&str> = text
            .split(['\r', '\n'])
            .filter(|line| !line.trim().is_empty())
            .collect();

        let header_index = lines
            .iter()
            .position(|line| line.trim_start().starts_with(HEADER_ID))
            .ok_or_else(|| {
                ParseError::MalformedMessage("message has no MSH header segment".to_owned())
            })?;
        if header_index > 0 {
            debug!("HL7: Ignoring {} segment(s) before the MSH header", header_index);
        }

        let header = lines[header_index].trim_start();
        let delimiters = Delimiters::from_header(header)?;

        let segment_lines = if lines.len() == 1 {
            split_run_together_segments(header, delimiters.field)
        } else {
            let mut rest = vec![header];
            rest.extend(&lines[header_index + 1..]);
            rest
        };

        let segments = segment_lines
            .into_iter()
            .map(|line| Segment::parse(line, delimiters))
            .collect();

        Ok(Self {
            delimiters,
            segments,
        })
    }

    pub fn delimiters(&self) -> Delimiters {
        self.delimiters
    }

    /// The `MSH` segment.
    pub fn header(&self) -> &Segment {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

}

/// Cuts a line in front of every known segment id that is followed by the field separator, once
/// the segment being cut has reached its minimum number of fields.
fn split_run_together_segments(line: &str, field: char) -> Vec<&str> {
    let mut starts = vec![0];
    let mut current = HEADER_ID;
    // skip past "MSH" + field separator, the encoding characters can't start a segment id
    let mut separators = 1;
    let mut i = HEADER_ID.len() + field.len_utf8();
    while i + 3 < line.len() {
        let Some(rest) = line.get(i..) else {
            i += 1;
            continue;
        };
        if rest.starts_with(field) {
            separators += 1;
            i += field.len_utf8();
            continue;
        }

        let candidate = rest
            .get(..3)
            .filter(|id| is_segment_id(id) && rest[3..].starts_with(field));
        match candidate {
            Some(id) if separators >= min_field_separators(current) => {
                starts.push(i);
                current = id;
                separators = 0;
                i += 3;
            }
            _ => i += 1,
        }
    }

    warn!(
        "HL7: Payload has no segment separators, rebuilt {} segment(s) from known segment ids",
        starts.len()
    );

    starts
        .iter()
        .zip(starts.iter().skip(1).chain(std::iter::once(&line.len())))
        .map(|(start, end)| &line[*start..*end])
        .collect()
}

fn is_segment_id(id: &str) -> bool {
    KNOWN_SEGMENT_IDS.contains(&id)
        || id.strip_prefix('Z').is_some_and(|rest| {
            rest.bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        })
}

fn min_field_separators(id: &str) -> usize {
    MIN_FIELD_SEPARATORS
        .iter()
        .find(|(known, _)| *known == id)
        .map_or(1, |(_, min)| *min)
}

/// A single segment. Field `n` is addressed the HL7 way, so for `MSH` field 1 is the field
/// separator itself and field 2 the encoding characters.
#[derive(Clone, Debug)]
pub struct Segment {
    fields: Vec<String>,
    delimiters: Delimiters,
}

impl Segment {
    fn parse(line: &str, delimiters: Delimiters) -> Self {
        let mut parts = line.split(delimiters.field).map(str::to_owned);
        let mut fields: Vec<String> = Vec::new();
        if let Some(id) = parts.next() {
            let is_header = id == HEADER_ID;
            fields.push(id);
            if is_header {
                fields.push(delimiters.field.to_string());
            }
        }
        fields.extend(parts);
        Self { fields, delimiters }
    }

    /// The segment type, e.g. `PID`.
    pub fn id(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or_default()
    }

    /// The raw, still-escaped text of field `index`.
    pub fn field(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.fields.get(index).map(String::as_str)
    }

    /// The raw repetitions of field `index`.
    pub fn repetitions(&self, index: usize) -> impl Iterator<Item = &str> {
        let separator = self.delimiters.repetition;
        self.field(index)
            .filter(|field| !field.is_empty())
            .into_iter()
            .flat_map(move |field| field.split(separator))
    }

    /// The first repetition of field `index`, unescaped.
    pub fn text(&self, index: usize) -> Option<String> {
        self.repetitions(index)
            .next()
            .and_then(|raw| self.present(raw))
    }

    /// Component `component` of the first repetition of field `index`, unescaped.
    pub fn component(&self, index: usize, component: usize) -> Option<String> {
        self.raw_component(index, component)
            .and_then(|raw| self.present(raw))
    }

    /// Sub-component `subcomponent` of [`Segment::component`], unescaped.
    pub fn subcomponent(
        &self,
        index: usize,
        component: usize,
        subcomponent: usize,
    ) -> Option<String> {
        self.raw_component(index, component)
            .and_then(|raw| nth_part(raw, self.delimiters.subcomponent, subcomponent))
            .and_then(|raw| self.present(raw))
    }

    fn raw_component(&self, index: usize, component: usize) -> Option<&str> {
        self.repetitions(index)
            .next()
            .and_then(|repetition| nth_part(repetition, self.delimiters.component, component))
    }

    /// Unescapes a leaf value. Empty values, whitespace and the HL7 explicit null `""` read as absent.
    fn present(&self, raw: &str) -> Option<String> {
        if raw.trim().is_empty() || raw == "\"\"" {
            return None;
        }
        let value = unescape(raw, &self.delimiters);
        (!value.trim().is_empty()).then(|| value.into_owned())
    }
}

fn nth_part(text: &str, separator: char, position: usize) -> Option<&str> {
    position
        .checked_sub(1)
        .and_then(|skip| text.split(separator).nth(skip))
}

/// Decodes HL7 escape sequences.
///
/// Delimiter escapes (`\F\ \S\ \T\ \R\ \E\`), hex data (`\Xhh..\`) and line breaks (`\.br\`) are
/// decoded; formatting escapes are dropped. An unterminated escape is kept literally.
pub fn unescape<'a>(text: &'a str, delimiters: &Delimiters) -> Cow<'a, str> {
    let Some(escape) = delimiters.escape else {
        return Cow::Borrowed(text);
    };
    if !text.contains(escape) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(escape) {
        out.push_str(&rest[..start]);
        let after = &rest[start + escape.len_utf8()..];
        match after.find(escape) {
            Some(end) => {
                push_escape_sequence(&after[..end], delimiters, escape, &mut out);
                rest = &after[end + escape.len_utf8()..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn push_escape_sequence(sequence: &str, delimiters: &Delimiters, escape: char, out: &mut String) {
    match sequence {
        "F" => out.push(delimiters.field),
        "S" => out.push(delimiters.component),
        "T" => out.push(delimiters.subcomponent),
        "R" => out.push(delimiters.repetition),
        "E" => out.push(escape),
        ".br" => out.push('\n'),
        hex if hex.starts_with('X') => {
            let digits = &hex[1..];
            for pair in digits.as_bytes().chunks(2) {
                let byte = std::str::from_utf8(pair)
                    .ok()
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                if let Some(byte) = byte {
                    out.push(if byte.is_ascii() { byte as char } else { '?' });
                }
            }
        }
        _ => {}
    }
}

/// Escapes free text so it can be embedded in a single field.
pub fn escape(text: &str, delimiters: &Delimiters) -> String {
    let escape = delimiters.escape.unwrap_or('\\');
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let sequence = match c {
            c if c == delimiters.field => "F",
            c if c == delimiters.component => "S",
            c if c == delimiters.subcomponent => "T",
            c if c == delimiters.repetition => "R",
            c if c == escape => "E",
            '\r' => "X0D",
            '\n' => "X0A",
            _ => {
                out.push(c);
                continue;
            }
        };
        out.push(escape);
        out.push_str(sequence);
        out.push(escape);
    }
    out
}
