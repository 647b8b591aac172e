//! Progress display for interactive transfers.

use std::io::Write;
use std::time::Duration;

use tokio::time::Instant;

const REDRAW_INTERVAL: Duration = Duration::from_millis(500);

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TiB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Byte counter with rate and ETA, redrawn in place on standard error.
#[derive(Debug)]
pub struct ProgressMeter {
    total: Option<u64>,
    transferred: u64,
    started: Instant,
    last_draw: Option<Instant>,
}

impl ProgressMeter {
    /// Meter for a stream of `total` bytes, if known.
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            transferred: 0,
            started: Instant::now(),
            last_draw: None,
        }
    }

    /// Bytes counted so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Count `bytes` more and redraw if the interval has passed.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        let now = Instant::now();
        let due = self
            .last_draw
            .map_or(true, |last| now.duration_since(last) >= REDRAW_INTERVAL);
        if due {
            self.last_draw = Some(now);
            self.draw(false);
        }
    }

    /// Final redraw and line break.
    pub fn finish(&mut self) {
        self.draw(true);
    }

    /// One status line for the current state.
    pub fn render(&self) -> String {
        let elapsed = self.started.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            (self.transferred as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        let mut line = format!(
            "{} {}/s {}",
            format_bytes(self.transferred),
            format_bytes(rate),
            format_duration(elapsed)
        );
        if let Some(total) = self.total.filter(|t| *t > 0) {
            let pct = (self.transferred as f64 / total as f64 * 100.0).min(100.0);
            line.push_str(&format!(" [{:>5.1}% of {}]", pct, format_bytes(total)));
            if rate > 0 && self.transferred < total {
                let eta = Duration::from_secs((total - self.transferred) / rate);
                line.push_str(&format!(" ETA {}", format_duration(eta)));
            }
        }
        line
    }

    fn draw(&self, last: bool) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{}", self.render());
        if last {
            let _ = writeln!(err);
        }
        let _ = err.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_with_total() {
        let mut meter = ProgressMeter::new(Some(4096));
        tokio::time::advance(Duration::from_secs(2)).await;
        meter.advance(2048);
        let line = meter.render();
        assert!(line.starts_with("2.00 KiB 1.00 KiB/s 00:00:02"), "{}", line);
        assert!(line.contains(" 50.0% of 4.00 KiB"), "{}", line);
        assert!(line.contains("ETA 00:00:02"), "{}", line);
        assert_eq!(meter.transferred(), 2048);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_without_total() {
        let meter = ProgressMeter::new(None);
        let line = meter.render();
        assert!(!line.contains('%'));
    }
}
