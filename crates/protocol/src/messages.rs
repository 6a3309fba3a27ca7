//! Typed views over pipe-delimited `data` payloads.

use std::fmt;
use std::str::FromStr;

/// Errors produced while parsing a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, PayloadError> {
    value.trim().parse().map_err(|_| PayloadError::Invalid {
        field,
        value: value.to_string(),
    })
}

fn non_empty(field: &'static str, value: Option<&str>) -> Result<String, PayloadError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(PayloadError::Missing(field)),
    }
}

fn optional_checksum(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// FILESTART payload: `path|size[|sha256]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStart {
    pub path: String,
    pub size: u64,
    pub checksum: Option<String>,
}

impl fmt::Display for FileStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.path, self.size)?;
        if let Some(sum) = &self.checksum {
            write!(f, "|{sum}")?;
        }
        Ok(())
    }
}

impl FromStr for FileStart {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let path = non_empty("path", parts.next())?;
        let size = parse_u64("size", parts.next().ok_or(PayloadError::Missing("size"))?)?;
        Ok(Self {
            path,
            size,
            checksum: optional_checksum(parts.next()),
        })
    }
}

/// FILEEND payload: `path[|sha256]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEnd {
    pub path: String,
    pub checksum: Option<String>,
}

impl fmt::Display for FileEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if let Some(sum) = &self.checksum {
            write!(f, "|{sum}")?;
        }
        Ok(())
    }
}

impl FromStr for FileEnd {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        Ok(Self {
            path: non_empty("path", parts.next())?,
            checksum: optional_checksum(parts.next()),
        })
    }
}

/// PROGRESS payload: `path|sent|total|speed_kbps`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub path: String,
    pub bytes: u64,
    pub total: u64,
    pub speed_kbps: f64,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{:.2}",
            self.path, self.bytes, self.total, self.speed_kbps
        )
    }
}

impl FromStr for ProgressReport {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() < 4 {
            return Err(PayloadError::Missing("progress fields"));
        }
        let speed = parts[3].trim();
        Ok(Self {
            path: non_empty("path", Some(parts[0]))?,
            bytes: parse_u64("bytes", parts[1])?,
            total: parse_u64("total", parts[2])?,
            speed_kbps: speed.parse().map_err(|_| PayloadError::Invalid {
                field: "speed",
                value: speed.to_string(),
            })?,
        })
    }
}

/// ERROR payload telling the peer that one side gave up on a file:
/// `Transfer aborted|path|reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAborted {
    pub path: String,
    pub reason: String,
}

const ABORT_TAG: &str = "Transfer aborted";

impl fmt::Display for TransferAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ABORT_TAG}|{}|{}", self.path, self.reason)
    }
}

impl FromStr for TransferAborted {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '|');
        if parts.next() != Some(ABORT_TAG) {
            return Err(PayloadError::Missing("abort tag"));
        }
        Ok(Self {
            path: non_empty("path", parts.next())?,
            reason: parts.next().unwrap_or_default().to_string(),
        })
    }
}

/// COMMAND payload: an upper-cased verb followed by whitespace-separated args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Creates a command from a verb and its arguments.
    pub fn new(name: &str, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the first argument, if any.
    pub fn arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in self.args.iter().filter(|a| !a.is_empty()) {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl FromStr for Command {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let name = words.next().ok_or(PayloadError::Missing("command"))?;
        Ok(Command::new(name, words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_start_with_and_without_checksum() {
        let plain: FileStart = "report.pdf|10000".parse().unwrap();
        assert_eq!(plain.path, "report.pdf");
        assert_eq!(plain.size, 10000);
        assert_eq!(plain.checksum, None);
        assert_eq!(plain.to_string(), "report.pdf|10000");

        let summed: FileStart = "docs/a.txt|5|abc123".parse().unwrap();
        assert_eq!(summed.checksum.as_deref(), Some("abc123"));
        assert_eq!(summed.to_string(), "docs/a.txt|5|abc123");
    }

    #[test]
    fn file_start_treats_trailing_empty_checksum_as_none() {
        let start: FileStart = "a.bin|42|".parse().unwrap();
        assert_eq!(start.checksum, None);
    }

    #[test]
    fn file_start_rejects_malformed() {
        assert_eq!(
            "report.pdf".parse::<FileStart>(),
            Err(PayloadError::Missing("size"))
        );
        assert_eq!(
            "|10".parse::<FileStart>(),
            Err(PayloadError::Missing("path"))
        );
        assert!(matches!(
            "a|ten".parse::<FileStart>(),
            Err(PayloadError::Invalid { field: "size", .. })
        ));
    }

    #[test]
    fn file_end_parses_optional_checksum() {
        let end: FileEnd = "report.pdf|deadbeef".parse().unwrap();
        assert_eq!(end.path, "report.pdf");
        assert_eq!(end.checksum.as_deref(), Some("deadbeef"));

        let bare: FileEnd = "report.pdf".parse().unwrap();
        assert_eq!(bare.checksum, None);
        assert!("".parse::<FileEnd>().is_err());
    }

    #[test]
    fn progress_report_format() {
        let report = ProgressReport {
            path: "big.iso".into(),
            bytes: 1_048_576,
            total: 4_194_304,
            speed_kbps: 512.0,
        };
        assert_eq!(report.to_string(), "big.iso|1048576|4194304|512.00");

        let parsed: ProgressReport = report.to_string().parse().unwrap();
        assert_eq!(parsed, report);
        assert!("big.iso|1|2".parse::<ProgressReport>().is_err());
    }

    #[test]
    fn transfer_aborted_notice() {
        let notice = TransferAborted {
            path: "video.mp4".into(),
            reason: "write failed: disk full".into(),
        };
        assert_eq!(
            notice.to_string(),
            "Transfer aborted|video.mp4|write failed: disk full"
        );
        assert_eq!(notice.to_string().parse::<TransferAborted>(), Ok(notice));
        assert!("file not found".parse::<TransferAborted>().is_err());
        assert!("Transfer aborted||x".parse::<TransferAborted>().is_err());
    }

    #[test]
    fn command_parse_uppercases_verb() {
        let cmd: Command = "get  docs/readme.md".parse().unwrap();
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.arg(), Some("docs/readme.md"));
        assert_eq!(cmd.to_string(), "GET docs/readme.md");

        let status: Command = "STATUS".parse().unwrap();
        assert!(status.args.is_empty());
        assert!("   ".parse::<Command>().is_err());
    }
}
