fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chrono::{Datelike, Timelike};
    use lanshare_protocol::{
        Command, FileStart, Message, MessageType, ProgressReport, TransferAborted,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a captured wire line.
    fn load_line(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn decode_fixture(name: &str) -> Message {
        let line = load_line(name);
        Message::decode(&line).unwrap_or_else(|e| panic!("failed to decode {name}: {e}"))
    }

    /// Re-encodes a decoded fixture and compares every field but the send
    /// time, which is restamped on each write.
    fn reencode_matches(name: &str) {
        let line = load_line(name);
        let original: serde_json::Value = serde_json::from_str(&line).unwrap();
        let msg = decode_fixture(name);
        let mut ours: serde_json::Value =
            serde_json::from_str(msg.encode().unwrap().trim_end()).unwrap();
        let mut theirs = original;
        for value in [&mut ours, &mut theirs] {
            value.as_object_mut().unwrap().remove("timestamp");
        }
        assert_eq!(ours, theirs, "re-encoding mismatch for {name}");
    }

    // --- Envelope ---

    #[test]
    fn fixture_handshake() {
        let msg = decode_fixture("handshake.json");
        assert_eq!(msg.msg_type, MessageType::Handshake);
        assert_eq!(msg.text(), "workstation-01");
        assert!(msg.id.is_none());

        let ts = msg.timestamp.expect("timestamp");
        assert_eq!((ts.year(), ts.month(), ts.day()), (2025, 3, 14));
        assert_eq!(ts.hour(), 8, "offset is normalized to UTC");
        assert_eq!(ts.nanosecond(), 589_793_238);
        reencode_matches("handshake.json");
    }

    #[test]
    fn fixture_command() {
        let msg = decode_fixture("command.json");
        assert_eq!(msg.msg_type, MessageType::Command);
        assert!(msg.requires_ack());
        assert_eq!(msg.id_str(), "cmd-1710404813589793238");

        let cmd: Command = msg.text().parse().unwrap();
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.arg(), Some("docs/report.pdf"));
        reencode_matches("command.json");
    }

    #[test]
    fn fixture_command_retry_keeps_count() {
        let msg = decode_fixture("command_retry.json");
        assert_eq!(msg.retry_count, 2);
        reencode_matches("command_retry.json");
    }

    // --- File pipeline ---

    #[test]
    fn fixture_file_start() {
        let msg = decode_fixture("file_start.json");
        assert_eq!(msg.msg_type, MessageType::FileStart);

        let start: FileStart = msg.text().parse().unwrap();
        assert_eq!(start.path, "docs/report.pdf");
        assert_eq!(start.size, 10_000);
        assert_eq!(start.checksum.as_deref().map(str::len), Some(64));
        assert_eq!(start.to_string(), msg.text());
        reencode_matches("file_start.json");
    }

    #[test]
    fn fixture_file_data_base64() {
        let msg = decode_fixture("file_data.json");
        assert_eq!(msg.msg_type, MessageType::FileData);
        assert!(!msg.requires_ack());
        assert_eq!(msg.binary_data().unwrap(), b"hello world");
        reencode_matches("file_data.json");
    }

    #[test]
    fn fixture_file_data_raw_is_resent_as_base64() {
        let msg = decode_fixture("file_data_raw.json");
        assert_eq!(msg.binary_data().unwrap(), b"hello world");

        let encoded: serde_json::Value =
            serde_json::from_str(msg.encode().unwrap().trim_end()).unwrap();
        assert!(encoded.get("binary").is_none());
        let resent = Message::decode(&encoded.to_string()).unwrap();
        assert_eq!(resent.binary_data().unwrap(), b"hello world");
    }

    #[test]
    fn fixture_path_ack() {
        let msg = decode_fixture("ack_path.json");
        assert_eq!(msg.msg_type, MessageType::Ack);
        assert!(msg.id.is_none());
        assert_eq!(msg.text(), "docs/report.pdf");
        reencode_matches("ack_path.json");
    }

    #[test]
    fn fixture_zero_time_is_accepted() {
        let msg = decode_fixture("ack_zero_time.json");
        assert_eq!(msg.id_str(), "reliable-1710404813601");
        assert_eq!(msg.timestamp.map(|t| t.year()), Some(1));
    }

    #[test]
    fn fixture_progress() {
        let msg = decode_fixture("progress.json");
        let report: ProgressReport = msg.text().parse().unwrap();
        assert_eq!(report.bytes, 262_144);
        assert_eq!(report.total, 10_485_760);
        assert!((report.speed_kbps - 512.5).abs() < f64::EPSILON);
        assert_eq!(report.to_string(), msg.text());
    }

    #[test]
    fn fixture_abort_notice() {
        let msg = decode_fixture("error_abort.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        let notice: TransferAborted = msg.text().parse().unwrap();
        assert_eq!(notice.path, "docs/report.pdf");
        assert_eq!(notice.reason, "disk full");
        reencode_matches("error_abort.json");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Message::decode(r#"{"type":"NACK","data":"","id":"x"}"#);
        assert!(err.is_err());
    }
}
