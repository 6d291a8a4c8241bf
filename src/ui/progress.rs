use crate::engine::EngineEvent;
use crate::ui::icons::{CHECK, CROSS, NOTES, PLAN, RUNNING, SKIP, SPARKLE, TEMPO};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::Duration;

/// Output mode for session progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars
    #[default]
    Full,
    /// One plain line per event
    Minimal,
    /// One JSON object per event
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal rendering of engine events.
///
/// In full mode two bars are stacked: the session bar counts finished
/// destinations, the step spinner shows what the current one is doing.
pub struct SessionUI {
    mode: UiMode,
    multi: MultiProgress,
    session_bar: ProgressBar,
    step_bar: ProgressBar,
    term: Term,
}

impl SessionUI {
    pub fn new(mode: UiMode) -> Self {
        let multi = MultiProgress::new();

        let session_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let session_bar = multi.add(ProgressBar::new(0));
        session_bar.set_style(session_style);
        session_bar.set_prefix("Parts");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix(" Step");

        if mode != UiMode::Full {
            session_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
            step_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }

        Self {
            mode,
            multi,
            session_bar,
            step_bar,
            term: Term::stdout(),
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle_event(&self, event: &EngineEvent) {
        match self.mode {
            UiMode::Json => {
                if let Ok(json) = serde_json::to_string(event) {
                    let _ = writeln!(&self.term, "{}", json);
                }
            }
            UiMode::Minimal => {
                let _ = writeln!(&self.term, "{}", describe(event));
            }
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_full(&self, event: &EngineEvent) {
        match event {
            EngineEvent::SessionStarted { kind, destinations } => {
                self.session_bar.set_length(*destinations as u64);
                self.session_bar.set_message(format!("{}", style(kind).yellow()));
                self.step_bar.enable_steady_tick(Duration::from_millis(100));
                self.step_bar.set_message("waiting for the service...");
            }
            EngineEvent::PlanReady { summary, order } => {
                self.print_line(format!("{} {}", PLAN, style("Plan").bold()));
                if !summary.is_empty() {
                    self.print_line(format!("    {}", style(summary).dim()));
                }
                for (i, entry) in order.iter().enumerate() {
                    self.print_line(format!("    {}. {}", i + 1, entry));
                }
            }
            EngineEvent::PlanFailed { error } => {
                self.print_line(format!(
                    "{} Planning failed, keeping track order: {}",
                    CROSS,
                    style(error).dim()
                ));
            }
            EngineEvent::DestinationStarted {
                track,
                position,
                total,
                role,
            } => {
                let role = if role.is_empty() {
                    String::new()
                } else {
                    format!(" {}", style(format!("({})", role)).dim())
                };
                self.step_bar.set_message(format!(
                    "{}Generating {}{} {}/{}",
                    RUNNING,
                    style(track).cyan(),
                    role,
                    position,
                    total
                ));
            }
            EngineEvent::DestinationCommitted {
                track,
                notes,
                controllers,
            } => {
                self.session_bar.inc(1);
                self.print_line(format!(
                    "{} {} {}{} notes, {} controllers",
                    CHECK,
                    style(track).green().bold(),
                    NOTES,
                    notes,
                    controllers
                ));
            }
            EngineEvent::DestinationSkipped { track, reason } => {
                self.session_bar.inc(1);
                self.print_line(format!(
                    "{} {} skipped: {}",
                    SKIP,
                    style(track).yellow(),
                    reason
                ));
            }
            EngineEvent::TempoApplied { .. }
            | EngineEvent::TempoDiscarded { .. }
            | EngineEvent::CommitAborted { .. } => {
                self.print_line(describe(event));
            }
            EngineEvent::SessionFinished { .. } => {
                self.step_bar.finish_and_clear();
                self.session_bar.finish();
                self.print_line(format!(
                    "\n{} {}",
                    SPARKLE,
                    style(describe(event)).green().bold()
                ));
            }
            EngineEvent::SessionAborted { .. } | EngineEvent::Failed { .. } => {
                self.step_bar.finish_and_clear();
                self.session_bar.abandon();
                self.print_line(format!("{} {}", CROSS, style(describe(event)).red().bold()));
            }
            EngineEvent::PromptEnhanced { prompt } => {
                self.step_bar.finish_and_clear();
                self.print_line(format!("{} {}", SPARKLE, style("Enhanced prompt").bold()));
                self.print_line(prompt);
            }
        }
    }
}

/// One plain line for an event.
pub fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::SessionStarted { kind, destinations } => {
            format!("Started {} ({} destination(s))", kind, destinations)
        }
        EngineEvent::PlanReady { order, .. } => format!("Plan: {}", order.join(", ")),
        EngineEvent::PlanFailed { error } => format!("Planning failed: {}", error),
        EngineEvent::DestinationStarted {
            track,
            position,
            total,
            ..
        } => format!("[{}/{}] {}", position, total, track),
        EngineEvent::DestinationCommitted { track, notes, .. } => {
            format!("✓ {} ({} notes)", track, notes)
        }
        EngineEvent::DestinationSkipped { track, reason } => {
            format!("✗ {} skipped: {}", track, reason)
        }
        EngineEvent::TempoApplied {
            points,
            first_bpm,
            deferred,
        } => {
            let bpm = first_bpm
                .map(|b| format!(", starting at {:.1} BPM", b))
                .unwrap_or_default();
            let when = if *deferred { " from the plan" } else { "" };
            format!("{}Applied {} tempo point(s){}{}", TEMPO, points, when, bpm)
        }
        EngineEvent::TempoDiscarded { reason } => {
            format!("{}Tempo change ignored: {}", TEMPO, reason)
        }
        EngineEvent::CommitAborted { track, reason } => {
            format!("Commit to {} aborted: {}", track, reason)
        }
        EngineEvent::SessionFinished {
            kind,
            committed,
            skipped,
        } => {
            if *skipped > 0 {
                format!("Finished {}: {} committed, {} skipped", kind, committed, skipped)
            } else {
                format!("Finished {}: {} committed", kind, committed)
            }
        }
        EngineEvent::SessionAborted { kind, reason } => format!("Aborted {}: {}", kind, reason),
        EngineEvent::Failed { kind, error } => format!("{} failed: {}", kind, error),
        EngineEvent::PromptEnhanced { prompt } => prompt.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BusyKind;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("JSON"), UiMode::Json);
        assert_eq!(UiMode::parse("minimal"), UiMode::Minimal);
        assert_eq!(UiMode::parse("anything"), UiMode::Full);
    }

    #[test]
    fn test_describe_session_finished() {
        let line = describe(&EngineEvent::SessionFinished {
            kind: BusyKind::Compose,
            committed: 2,
            skipped: 1,
        });
        assert_eq!(line, "Finished compose session: 2 committed, 1 skipped");
    }

    #[test]
    fn test_describe_deferred_tempo() {
        let line = describe(&EngineEvent::TempoApplied {
            points: 2,
            first_bpm: Some(96.0),
            deferred: true,
        });
        assert!(line.contains("2 tempo point(s) from the plan"));
        assert!(line.contains("96.0 BPM"));
    }
}
