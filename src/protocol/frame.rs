//! Response frame decoding.
//!
//! Device responses are single ASCII lines with fixed field offsets:
//!
//! ```text
//! @ U SS AAAA BBBB <checksum>                         acknowledgement
//! $ U SS AAAA BBBB [TAG] [DDDD ±AAAAA] <checksum>     completion
//! 0 1 2  4    8    12    16   20
//! ```
//!
//! `U` is the unit number, `SS` the status, `AAAA`/`BBBB` the alarm code and
//! subcode. The distance/angle offsets follow the tag only on `MALN` completions.

use super::command::CommandTag;
use serde::Serialize;
use thiserror::Error;

/// Minimum number of characters after the marker.
pub const MIN_PAYLOAD_LEN: usize = 12;

/// Alarm code + subcode of a successful completion.
pub const SUCCESS_CODE: &str = "00000000";

const DISTANCE_LEN: usize = 4;
const ANGLE_LEN: usize = 6;

/// Why a line is not a response frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Nothing left after trimming.
    #[error("empty line")]
    Empty,
    /// Contains non-ASCII bytes; fixed offsets would be meaningless.
    #[error("line contains non-ASCII characters")]
    NotAscii,
    /// First character is neither `@` nor `$`.
    #[error("line does not start with '@' or '$'")]
    MissingMarker,
    /// Payload after the marker is too short.
    #[error("payload is {len} characters, need at least {MIN_PAYLOAD_LEN}")]
    TooShort {
        /// Payload length after the marker.
        len: usize,
    },
    /// MALN offset fields are not numeric.
    #[error("invalid offset field '{0}'")]
    InvalidOffset(String),
}

/// First character of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// `@`: immediate receipt confirmation.
    Acknowledgement,
    /// `$`: command finished.
    Completion,
}

impl Marker {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'@' => Some(Marker::Acknowledgement),
            b'$' => Some(Marker::Completion),
            _ => None,
        }
    }

    /// Wire character.
    pub fn as_char(&self) -> char {
        match self {
            Marker::Acknowledgement => '@',
            Marker::Completion => '$',
        }
    }
}

/// One parsed device response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseFrame {
    /// Frame kind.
    pub marker: Marker,
    /// Unit number (1 character).
    pub unit: char,
    /// Status field (2 characters, informational).
    pub status: String,
    /// Alarm code (4 characters).
    pub alarm_code: String,
    /// Alarm subcode (4 characters).
    pub alarm_subcode: String,
    /// Completed command tag, when a known tag follows the alarm fields.
    pub tag: Option<CommandTag>,
    /// Raw offset distance (MALN completion only).
    pub offset_distance_raw: Option<String>,
    /// Raw signed offset angle (MALN completion only).
    pub offset_angle_raw: Option<String>,
    /// Remainder of the line; not validated.
    pub checksum: String,
}

impl ResponseFrame {
    /// Alarm code and subcode concatenated.
    pub fn alarm_field(&self) -> String {
        format!("{}{}", self.alarm_code, self.alarm_subcode)
    }

    /// Parse the MALN offset fields, if the frame carries them.
    pub fn alignment_offset(&self) -> Option<Result<AlignmentOffset, FrameError>> {
        match (&self.offset_distance_raw, &self.offset_angle_raw) {
            (Some(distance), Some(angle)) => Some(AlignmentOffset::parse(distance, angle)),
            (Some(distance), None) => Some(Err(FrameError::InvalidOffset(distance.clone()))),
            _ => None,
        }
    }
}

/// Decode one received line.
///
/// Trailing CR/LF and surrounding whitespace are stripped first.
pub fn decode(line: &str) -> Result<ResponseFrame, FrameError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(FrameError::Empty);
    }
    if !line.is_ascii() {
        return Err(FrameError::NotAscii);
    }

    let marker = Marker::from_byte(line.as_bytes()[0]).ok_or(FrameError::MissingMarker)?;
    let payload_len = line.len() - 1;
    if payload_len < MIN_PAYLOAD_LEN {
        return Err(FrameError::TooShort { len: payload_len });
    }

    let unit = line[1..2].chars().next().ok_or(FrameError::Empty)?;
    let status = line[2..4].to_string();
    let alarm_code = line[4..8].to_string();
    let alarm_subcode = line[8..12].to_string();

    let mut rest = &line[12..];
    let mut tag = None;
    let mut offset_distance_raw = None;
    let mut offset_angle_raw = None;

    if marker == Marker::Completion && rest.len() >= 4 {
        if let Some(found) = CommandTag::from_wire(&rest[..4]) {
            tag = Some(found);
            rest = &rest[4..];

            if found == CommandTag::Maln && rest.len() >= DISTANCE_LEN {
                offset_distance_raw = Some(rest[..DISTANCE_LEN].to_string());
                rest = &rest[DISTANCE_LEN..];
                if rest.len() >= ANGLE_LEN {
                    offset_angle_raw = Some(rest[..ANGLE_LEN].to_string());
                    rest = &rest[ANGLE_LEN..];
                }
            }
        }
    }

    Ok(ResponseFrame {
        marker,
        unit,
        status,
        alarm_code,
        alarm_subcode,
        tag,
        offset_distance_raw,
        offset_angle_raw,
        checksum: rest.to_string(),
    })
}

/// Wafer offset reported by a MALN completion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlignmentOffset {
    /// Radial offset in millimetres.
    pub distance_mm: f64,
    /// Angular offset in degrees.
    pub angle_deg: f64,
}

impl AlignmentOffset {
    /// Parse fixed-point fields with two implied decimals.
    ///
    /// The angle may carry a leading `+` or `-`.
    pub fn parse(distance_raw: &str, angle_raw: &str) -> Result<Self, FrameError> {
        let distance = parse_hundredths(distance_raw, false)?;
        let angle = parse_hundredths(angle_raw, true)?;
        Ok(Self {
            distance_mm: distance,
            angle_deg: angle,
        })
    }
}

impl std::fmt::Display for AlignmentOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}mm {:.2}deg", self.distance_mm, self.angle_deg)
    }
}

fn parse_hundredths(raw: &str, signed: bool) -> Result<f64, FrameError> {
    let invalid = || FrameError::InvalidOffset(raw.to_string());
    let (negative, digits) = match raw.as_bytes().first() {
        Some(b'-') if signed => (true, &raw[1..]),
        Some(b'+') if signed => (false, &raw[1..]),
        _ => (false, raw),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: i64 = digits.parse().map_err(|_| invalid())?;
    let value = value as f64 / 100.0;
    Ok(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_acknowledgement() {
        let frame = decode("@2300000000015\r\n").unwrap();
        assert_eq!(frame.marker, Marker::Acknowledgement);
        assert_eq!(frame.unit, '2');
        assert_eq!(frame.status, "30");
        assert_eq!(frame.alarm_field(), SUCCESS_CODE);
        assert_eq!(frame.tag, None);
        assert_eq!(frame.checksum, "015");
    }

    #[test]
    fn decodes_mtrs_completion() {
        let frame = decode("$23200000000MTRS5D").unwrap();
        assert_eq!(frame.marker, Marker::Completion);
        assert_eq!(frame.tag, Some(CommandTag::Mtrs));
        assert_eq!(frame.checksum, "5D");
        assert!(frame.alignment_offset().is_none());
    }

    #[test]
    fn decodes_maln_offsets() {
        let frame = decode("$24200000000MALN001701085137").unwrap();
        assert_eq!(frame.tag, Some(CommandTag::Maln));
        assert_eq!(frame.offset_distance_raw.as_deref(), Some("0017"));
        assert_eq!(frame.offset_angle_raw.as_deref(), Some("010851"));
        assert_eq!(frame.checksum, "37");

        let offset = frame.alignment_offset().unwrap().unwrap();
        assert!((offset.distance_mm - 0.17).abs() < 1e-9);
        assert!((offset.angle_deg - 108.51).abs() < 1e-9);
        assert_eq!(offset.to_string(), "0.17mm 108.51deg");
    }

    #[test]
    fn negative_angles_keep_their_sign() {
        let offset = AlignmentOffset::parse("0005", "-12726").unwrap();
        assert!((offset.distance_mm - 0.05).abs() < 1e-9);
        assert!((offset.angle_deg + 127.26).abs() < 1e-9);
        assert!(AlignmentOffset::parse("00x5", "000000").is_err());
        assert!(AlignmentOffset::parse("-005", "000000").is_err());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(decode("  \r\n"), Err(FrameError::Empty));
        assert_eq!(decode("#2300000000015"), Err(FrameError::MissingMarker));
        assert_eq!(decode("@23000000000"), Err(FrameError::TooShort { len: 11 }));
        assert_eq!(decode("@2300000000°15"), Err(FrameError::NotAscii));
    }

    #[test]
    fn unknown_tags_stay_in_checksum() {
        let frame = decode("$23200050002WXYZ11").unwrap();
        assert_eq!(frame.tag, None);
        assert_eq!(frame.alarm_code, "0005");
        assert_eq!(frame.alarm_subcode, "0002");
        assert_eq!(frame.checksum, "WXYZ11");
    }

    #[test]
    fn acknowledgements_never_carry_tags() {
        let frame = decode("@23000000000MTRS").unwrap();
        assert_eq!(frame.tag, None);
        assert_eq!(frame.checksum, "MTRS");
    }
}
