//! User-facing output.
//!
//! Every component reports through an [`Output`] handle; a single task owns
//! the terminal, so progress lines and messages never interleave mid-line.

use lanshare_transfer::{Direction, ProgressSnapshot, format_eta, render_bar};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const BAR_WIDTH: usize = 30;

/// Severity of a printed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
    /// A chat line from the peer.
    Chat,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Info | Level::Chat => "",
            Level::Success => "✓ ",
            Level::Warning => "! ",
            Level::Error => "✗ ",
        }
    }
}

/// Something to show the user.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Line { level: Level, text: String },
    /// Redraws the progress line in place.
    Progress(ProgressSnapshot),
    /// A transfer reached a terminal state; `error` is `None` on success.
    TransferFinished {
        snapshot: ProgressSnapshot,
        error: Option<String>,
    },
}

/// Cheap, cloneable sender of [`OutputEvent`]s.
#[derive(Debug, Clone)]
pub struct Output {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl Output {
    /// Starts the output task writing to `writer`. The task ends, handing
    /// the writer back, once every `Output` clone is dropped.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(output_task(rx, writer));
        (Self { tx }, handle)
    }

    /// Returns a handle and the raw event stream, for embedding or tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A handle whose events go nowhere.
    pub fn discard() -> Self {
        Self::channel().0
    }

    pub fn emit(&self, event: OutputEvent) {
        let _ = self.tx.send(event);
    }

    pub fn line(&self, level: Level, text: impl Into<String>) {
        self.emit(OutputEvent::Line {
            level,
            text: text.into(),
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.line(Level::Info, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.line(Level::Success, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.line(Level::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.line(Level::Error, text);
    }

    pub fn chat(&self, from: &str, text: &str) {
        self.line(Level::Chat, format!("[{from}] {text}"));
    }

    pub fn progress(&self, snapshot: ProgressSnapshot) {
        self.emit(OutputEvent::Progress(snapshot));
    }

    pub fn transfer_finished(&self, snapshot: ProgressSnapshot, error: Option<String>) {
        self.emit(OutputEvent::TransferFinished { snapshot, error });
    }
}

async fn output_task<W>(mut rx: mpsc::UnboundedReceiver<OutputEvent>, mut writer: W) -> W
where
    W: AsyncWrite + Unpin,
{
    let mut progress_open = false;
    while let Some(event) = rx.recv().await {
        let text = match event {
            OutputEvent::Progress(snapshot) => {
                progress_open = true;
                format!("\r\x1b[2K{}", render_progress(&snapshot))
            }
            OutputEvent::Line { level, text } => {
                let lead = if std::mem::take(&mut progress_open) { "\n" } else { "" };
                format!("{lead}{}{text}\n", level.prefix())
            }
            OutputEvent::TransferFinished { snapshot, error } => {
                let lead = if std::mem::take(&mut progress_open) { "\n" } else { "" };
                format!("{lead}{}\n", render_finished(&snapshot, error.as_deref()))
            }
        };
        if writer.write_all(text.as_bytes()).await.is_err() {
            continue;
        }
        let _ = writer.flush().await;
    }
    writer
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Send => "↑",
        Direction::Receive => "↓",
    }
}

/// `↑ Sending report.pdf: [=====>   ] 42.0% (512.00 KB/s) ETA: 3s`
pub fn render_progress(s: &ProgressSnapshot) -> String {
    let mut line = format!(
        "{} {} {}: {} {:.1}% ({:.2} KB/s)",
        arrow(s.direction),
        s.direction.verb(),
        s.path,
        render_bar(s.percent(), BAR_WIDTH),
        s.percent(),
        s.speed_kbps()
    );
    if let Some(eta) = s.eta.filter(|_| s.transferred < s.total) {
        line.push_str(&format!(" ETA: {}", format_eta(eta)));
    }
    line
}

fn render_finished(s: &ProgressSnapshot, error: Option<&str>) -> String {
    match error {
        None => format!(
            "✓ Transfer complete: {} ({} bytes)",
            s.path, s.transferred
        ),
        Some(reason) => format!("✗ Transfer failed: {}: {reason}", s.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_transfer::TransferStatus;
    use std::time::Duration;

    fn snapshot(transferred: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            id: 1,
            path: "report.pdf".into(),
            direction: Direction::Send,
            status: TransferStatus::InProgress,
            transferred,
            total: 1000,
            bytes_per_second: 2048.0,
            eta: Some(Duration::from_secs(3)),
        }
    }

    #[test]
    fn progress_line_shape() {
        let line = render_progress(&snapshot(500));
        assert!(line.starts_with("↑ Sending report.pdf: ["));
        assert!(line.contains("50.0% (2.00 KB/s)"));
        assert!(line.ends_with("ETA: 3s"));
        assert!(!render_progress(&snapshot(1000)).contains("ETA"));
    }

    #[tokio::test]
    async fn lines_after_progress_start_on_a_fresh_line() {
        let (output, handle) = Output::spawn(Vec::new());
        output.progress(snapshot(500));
        output.info("hello");
        output.error("boom");
        drop(output);

        let written = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(written.starts_with("\r\x1b[2K↑ Sending"));
        assert!(written.ends_with("\nhello\n✗ boom\n"));
    }

    #[tokio::test]
    async fn finished_transfers_render_outcome() {
        let (output, handle) = Output::spawn(Vec::new());
        output.transfer_finished(snapshot(1000), None);
        output.transfer_finished(snapshot(10), Some("cancelled".into()));
        drop(output);

        let written = String::from_utf8(handle.await.unwrap()).unwrap();
        assert_eq!(
            written,
            "✓ Transfer complete: report.pdf (1000 bytes)\n✗ Transfer failed: report.pdf: cancelled\n"
        );
    }

    #[tokio::test]
    async fn channel_exposes_events() {
        let (output, mut rx) = Output::channel();
        output.chat("laptop", "hi there");
        match rx.recv().await.unwrap() {
            OutputEvent::Line { level, text } => {
                assert_eq!(level, Level::Chat);
                assert_eq!(text, "[laptop] hi there");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
