//! Decoded records: schema-validated headers, machine-id substitution, staged text layout.

use std::fmt;
use std::io::{self, Write};

use crate::protocol::{HeaderSchema, CFG_PREFIX_MARKER, MACHINE_ID_HEADER};
use crate::wire::{until_nul, DecodeError};

/// Longest slice of an offending header line kept in an error.
const MAX_REPORTED_LINE: usize = 64;

/// One `name: value` header, in schema order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// A record after decoding. Exists only for the duration of one stage operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Config file that produced the record, if the client sent a tag.
    pub cfg_path: Option<String>,
    /// One header per schema name, in schema order.
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl DecodedRecord {
    /// Replace the machine-id header value with the daemon's id.
    pub fn substitute_machine_id(&mut self, machine_id: &str) {
        for h in self.headers.iter_mut().filter(|h| h.name == MACHINE_ID_HEADER) {
            h.value = machine_id.to_string();
        }
    }

    /// Write the staged-file layout consumed by the uploader.
    pub fn write_staged<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if let Some(cfg) = &self.cfg_path {
            writeln!(out, "{CFG_PREFIX_MARKER}{cfg}")?;
        }
        for h in &self.headers {
            writeln!(out, "{h}")?;
        }
        out.write_all(&self.body)?;
        out.write_all(b"\n")
    }

    pub fn to_staged_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_staged(&mut out);
        out
    }
}

/// Match the header block against the schema, one line per name, in order.
///
/// Empty lines are skipped and lines after the last schema header are ignored.
pub fn parse_headers(block: &[u8], schema: &HeaderSchema) -> Result<Vec<Header>, DecodeError> {
    let text = std::str::from_utf8(until_nul(block)).map_err(|_| DecodeError::HeaderEncoding)?;
    let mut lines = text.split('\n').filter(|l| !l.is_empty());

    let mut headers = Vec::with_capacity(schema.len());
    for (position, name) in schema.names().iter().enumerate() {
        let line = lines.next().ok_or_else(|| DecodeError::MissingHeader {
            name: name.clone(),
            position,
        })?;
        let value = header_value(line, name).ok_or_else(|| DecodeError::UnexpectedHeader {
            expected: name.clone(),
            position,
            found: line.chars().take(MAX_REPORTED_LINE).collect(),
        })?;
        headers.push(Header {
            name: name.clone(),
            value: value.to_string(),
        });
    }
    Ok(headers)
}

/// `name: value`, separator exact, so the line re-renders byte for byte.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?.strip_prefix(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> HeaderSchema {
        HeaderSchema::new(["classification", "machine_id", "build"]).unwrap()
    }

    #[test]
    fn parses_in_order_and_skips_blank_lines() {
        let block =
            b"classification: org.test/hello\n\nmachine_id: PLACEHOLDER\nbuild: 42\nextra: ignored";
        let headers = parse_headers(block, &schema()).unwrap();
        assert_eq!(
            headers.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
            [
                "classification: org.test/hello",
                "machine_id: PLACEHOLDER",
                "build: 42"
            ]
        );
    }

    #[test]
    fn missing_header_reports_position() {
        let block = b"classification: a\nmachine_id: b";
        assert_eq!(
            parse_headers(block, &schema()),
            Err(DecodeError::MissingHeader {
                name: "build".into(),
                position: 2
            })
        );
    }

    #[test]
    fn prefix_only_match_is_not_enough() {
        // "buildx" must not satisfy "build".
        let block = b"classification: a\nmachine_id: b\nbuildx: 1";
        assert!(matches!(
            parse_headers(block, &schema()),
            Err(DecodeError::UnexpectedHeader { position: 2, .. })
        ));
    }

    #[test]
    fn separator_must_be_colon_space() {
        let block = b"classification: a\nmachine_id:b\nbuild: c";
        assert!(matches!(
            parse_headers(block, &schema()),
            Err(DecodeError::UnexpectedHeader { position: 1, .. })
        ));
        let block = "classification: a\nmachine_id: \nbuild:  two spaces";
        let headers = parse_headers(block.as_bytes(), &schema()).unwrap();
        let rendered: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        assert_eq!(rendered.join("\n"), block);
    }

    #[test]
    fn block_is_cut_at_nul() {
        let block = b"classification: a\nmachine_id: b\nbuild: c\0garbage\xff";
        assert!(parse_headers(block, &schema()).is_ok());
        let block = b"classification: a\0machine_id: b\nbuild: c";
        assert!(matches!(
            parse_headers(block, &schema()),
            Err(DecodeError::MissingHeader { position: 1, .. })
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert_eq!(
            parse_headers(b"classification: \xff", &schema()),
            Err(DecodeError::HeaderEncoding)
        );
    }

    #[test]
    fn staged_layout() {
        let mut rec = DecodedRecord {
            cfg_path: Some("/etc/t.conf".into()),
            headers: parse_headers(
                b"classification: c\nmachine_id: PLACEHOLDER\nbuild: 1",
                &schema(),
            )
            .unwrap(),
            body: b"hello".to_vec(),
        };
        rec.substitute_machine_id("0123456789abcdef0123456789abcdef");
        assert_eq!(
            String::from_utf8(rec.to_staged_bytes()).unwrap(),
            concat!(
                "_cfg_file=/etc/t.conf\nclassification: c\n",
                "machine_id: 0123456789abcdef0123456789abcdef\nbuild: 1\nhello\n"
            )
        );
        rec.cfg_path = None;
        assert!(!String::from_utf8(rec.to_staged_bytes())
            .unwrap()
            .contains(CFG_PREFIX_MARKER));
    }
}
