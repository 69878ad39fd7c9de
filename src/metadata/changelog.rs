//! Changelog / replay (spec §4.8, component C8).
//!
//! Each record is `<metaversion>|<timestamp>|<OP>(<args>):<result>`. Lines
//! are parsed with `nom`, mirroring the teacher's declared-but-unexercised
//! dependency, repurposed here for this grammar rather than a mount-option
//! string.

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::multi::separated_list;
use nom::sequence::{delimited, tuple};
use nom::IResult;

use crate::error::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogRecord {
    pub metaversion: u64,
    pub timestamp: i64,
    pub op: String,
    pub args: Vec<String>,
    pub result: Status,
}

impl ChangelogRecord {
    /// Renders this record in its on-disk line format (spec §4.8); control
    /// bytes in string args are backslash-escaped by the caller before being
    /// passed in as an arg.
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}({}):{}",
            self.metaversion,
            self.timestamp,
            self.op,
            self.args.join(","),
            self.result.as_str()
        )
    }
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn signed_number(input: &str) -> IResult<&str, i64> {
    map_res(
        nom::sequence::pair(opt(char('-')), digit1),
        |(sign, digits): (Option<char>, &str)| -> Result<i64, std::num::ParseIntError> {
            let n: i64 = digits.parse()?;
            Ok(if sign.is_some() { -n } else { n })
        },
    )(input)
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

/// One argument: a run of bytes up to the next unescaped `,` or `)`, with
/// backslash-escapes for control bytes unescaped in place (spec §4.8:
/// "strings that may contain control bytes are quoted with backslash
/// escapes").
fn arg(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c != ',' && c != ')'), unescape)(input)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn args_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(char('('), separated_list(char(','), arg), char(')'))(input)
}

fn status(input: &str) -> IResult<&str, Status> {
    map_res(take_while1(|c: char| c.is_ascii_uppercase()), |s: &str| {
        Status::from_str(s).ok_or(())
    })(input)
}

fn record(input: &str) -> IResult<&str, ChangelogRecord> {
    map(
        tuple((
            number,
            char('|'),
            signed_number,
            char('|'),
            ident,
            args_list,
            char(':'),
            status,
        )),
        |(metaversion, _, timestamp, _, op, args, _, result)| ChangelogRecord {
            metaversion,
            timestamp,
            op: op.to_string(),
            args,
            result,
        },
    )(input)
}

/// Parses one changelog line. Returns `None` on any grammar violation; the
/// caller treats this the same as a replay mismatch.
pub fn parse_line(line: &str) -> Option<ChangelogRecord> {
    record(line.trim_end()).ok().and_then(|(rest, rec)| if rest.is_empty() { Some(rec) } else { None })
}

/// Append-only changelog writer with size/time based rotation (spec §6
/// supplement: `changelog.<n>.lfs`).
pub struct ChangelogWriter {
    segment_index: u64,
    lines_in_segment: u64,
    max_lines_per_segment: u64,
    buffer: Vec<String>,
}

impl ChangelogWriter {
    pub fn new(max_lines_per_segment: u64) -> Self {
        ChangelogWriter {
            segment_index: 0,
            lines_in_segment: 0,
            max_lines_per_segment,
            buffer: Vec::new(),
        }
    }

    /// Appends one record, rotating to a new segment file name if the
    /// current one is full. Returns the segment file name the line landed
    /// in, e.g. `changelog.3.lfs`.
    pub fn append(&mut self, record: &ChangelogRecord) -> String {
        if self.lines_in_segment >= self.max_lines_per_segment && self.max_lines_per_segment > 0 {
            self.segment_index += 1;
            self.lines_in_segment = 0;
        }
        self.buffer.push(record.to_line());
        self.lines_in_segment += 1;
        self.segment_name()
    }

    pub fn segment_name(&self) -> String {
        format!("changelog.{}.lfs", self.segment_index)
    }

    pub fn pending_lines(&self) -> &[String] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_record() {
        let line = "42|1700000000|UNLINK(5,foo.txt):OK";
        let rec = parse_line(line).expect("parses");
        assert_eq!(rec.metaversion, 42);
        assert_eq!(rec.timestamp, 1_700_000_000);
        assert_eq!(rec.op, "UNLINK");
        assert_eq!(rec.args, vec!["5".to_string(), "foo.txt".to_string()]);
        assert_eq!(rec.result, Status::Ok);
    }

    #[test]
    fn round_trips_through_to_line_and_back() {
        let rec = ChangelogRecord {
            metaversion: 7,
            timestamp: -5,
            op: "CREATE".to_string(),
            args: vec!["1".to_string(), "a".to_string()],
            result: Status::EExist,
        };
        let parsed = parse_line(&rec.to_line()).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_line("not a changelog line").is_none());
    }

    #[test]
    fn writer_rotates_after_max_lines() {
        let mut writer = ChangelogWriter::new(2);
        let rec = ChangelogRecord { metaversion: 1, timestamp: 0, op: "NEXTCHUNKID".into(), args: vec![], result: Status::Ok };
        assert_eq!(writer.append(&rec), "changelog.0.lfs");
        assert_eq!(writer.append(&rec), "changelog.0.lfs");
        assert_eq!(writer.append(&rec), "changelog.1.lfs");
    }
}
