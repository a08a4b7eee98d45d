/// Operator-facing output for a supervised transfer.
///
/// Progress is rendered on a single line rewritten with `\r` while a burst
/// of progress lines is active; other child output is echoed as-is.
/// Write failures are ignored so a closed terminal never stalls the loop.
use crate::progress::TelemetrySample;
use std::io::Write;

/// Receives everything the supervisor wants the operator to see.
pub trait ProgressSink {
    /// A line of child output echoed verbatim.
    fn raw_line(&mut self, line: &str);

    /// A parsed progress update. `filename` is the last status line seen;
    /// `continuing_run` is false for the first update of a burst.
    fn progress(&mut self, sample: &TelemetrySample, filename: &str, continuing_run: bool);

    /// A supervisor announcement (terminations, kills, interrupts).
    fn announce(&mut self, message: &str);
}

/// Sink writing to a terminal-like stream, stdout by default.
pub struct TerminalSink<W: Write = std::io::Stdout> {
    out: W,
    mid_line: bool,
}

impl TerminalSink {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn end_progress_line(&mut self) {
        if self.mid_line {
            let _ = writeln!(self.out);
            self.mid_line = false;
        }
    }
}

impl<W: Write> ProgressSink for TerminalSink<W> {
    fn raw_line(&mut self, line: &str) {
        self.end_progress_line();
        let _ = writeln!(self.out, "\t{line:?}");
    }

    fn progress(&mut self, sample: &TelemetrySample, filename: &str, continuing_run: bool) {
        if !continuing_run {
            self.end_progress_line();
            let _ = writeln!(self.out, "{filename}");
        }
        let _ = write!(self.out, "\r{}", format_sample(sample));
        let _ = self.out.flush();
        self.mid_line = true;
    }

    fn announce(&mut self, message: &str) {
        self.end_progress_line();
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }
}

/// One-line human summary of a sample.
pub fn format_sample(sample: &TelemetrySample) -> String {
    format!(
        "Rate: {} bytes/s, Bytes Transferred: {}, Percent Transferred: {}%, ETA: {}    ",
        group_thousands(sample.transfer_rate),
        group_thousands(sample.bytes_transferred),
        sample.percent_transferred,
        sample.eta
    )
}

/// `1234567` -> `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
