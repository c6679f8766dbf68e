use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::backend::BackendKind;
use crate::types::{MetricsEvent, SessionEvent};

/// Live spinner showing the latest worker metrics
pub struct MetricsDisplay {
    bar: ProgressBar,
    start_time: Instant,
    backend: BackendKind,
    last: Option<MetricsEvent>,
}

impl MetricsDisplay {
    pub fn new(backend: BackendKind) -> Self {
        let bar = ProgressBar::new_spinner();

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("{} | starting worker...", backend));

        Self {
            bar,
            start_time: Instant::now(),
            backend,
            last: None,
        }
    }

    /// Reflect one session event; returns false once the session is over
    pub fn handle(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Metrics(metrics) => self.update(metrics),
            SessionEvent::WorkerRestarted { attempt } => {
                self.note(&format!("worker restarted (attempt {})", attempt))
            }
            SessionEvent::WorkerCrashed { status } => {
                self.note(&format!("{} worker crashed ({})", style("✗").red(), status))
            }
            SessionEvent::WorkerExited { status } => {
                self.note(&format!("worker exited ({})", status))
            }
            SessionEvent::LaunchFailed { reason } => {
                self.note(&format!("{} launch failed: {}", style("✗").red(), reason))
            }
            SessionEvent::Stopped => return false,
        }
        true
    }

    pub fn update(&mut self, metrics: &MetricsEvent) {
        let mut msg = format!(
            "{} | {} | accepted {} | rejected {}",
            self.backend,
            format_hashrate(metrics.hashrate),
            format_number(metrics.accepted),
            format_number(metrics.rejected),
        );
        if let Some(status) = &metrics.status {
            msg.push_str(" | ");
            msg.push_str(status);
        }
        self.bar.set_message(msg);
        self.last = Some(metrics.clone());
    }

    /// Print a line above the spinner
    pub fn note(&self, msg: &str) {
        self.bar.println(format!("   {}", msg));
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed();
        let summary = match &self.last {
            Some(m) => format!(
                "✅ Session ended after {} ({} accepted, {} rejected, last {})",
                format_duration(elapsed),
                m.accepted,
                m.rejected,
                format_hashrate(m.hashrate)
            ),
            None => format!(
                "Session ended after {} without metrics",
                format_duration(elapsed)
            ),
        };
        self.bar.finish_with_message(summary);
    }
}

const SI_PREFIXES: [(f64, &str); 3] = [(1e9, "G"), (1e6, "M"), (1e3, "K")];

/// Scale `value` down by the largest SI prefix it reaches
fn si_scale(value: f64) -> (f64, &'static str) {
    SI_PREFIXES
        .iter()
        .find(|(factor, _)| value >= *factor)
        .map(|(factor, prefix)| (value / factor, *prefix))
        .unwrap_or((value, ""))
}

pub fn format_hashrate(hashrate: f64) -> String {
    match si_scale(hashrate) {
        (value, "") => format!("{:.0} H/s", value),
        (value, prefix) => format!("{:.2} {}H/s", value, prefix),
    }
}

/// Share counters use the same prefixes as hashrates, without a unit
fn format_number(n: u64) -> String {
    match si_scale(n as f64) {
        (_, "") => n.to_string(),
        (value, prefix) => format!("{:.2}{}", value, prefix),
    }
}

/// Wall-clock style: `m:ss`, or `h:mm:ss` past the hour
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hashrate() {
        assert_eq!(format_hashrate(950.4), "950 H/s");
        assert_eq!(format_hashrate(2_345.6), "2.35 KH/s");
        assert_eq!(format_hashrate(1_500_000.0), "1.50 MH/s");
        assert_eq!(format_hashrate(3_000_000_000.0), "3.00 GH/s");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(950), "950");
        assert_eq!(format_number(2_346), "2.35K");
        assert_eq!(format_number(1_500_000), "1.50M");
        assert_eq!(format_number(4_200_000_000), "4.20G");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "0:42");
        assert_eq!(format_duration(Duration::from_secs(125)), "2:05");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
    }

    #[test]
    fn test_handle_stops_on_stopped() {
        let mut display = MetricsDisplay::new(BackendKind::Simulated);
        display.bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        assert!(display.handle(&SessionEvent::WorkerRestarted { attempt: 1 }));
        assert!(!display.handle(&SessionEvent::Stopped));
        display.finish();
    }
}
