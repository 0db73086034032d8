use scout_core::{ProbeOutcome, ProbeStatus, ScanSummary, UserSummary};

const GREEN: (u8, u8, u8) = (38, 182, 82);
const RED: (u8, u8, u8) = (250, 41, 41);
const YELLOW: (u8, u8, u8) = (255, 211, 0);
const BLUE: (u8, u8, u8) = (110, 200, 255);

/// Writes result lines to stdout, optionally in 24-bit colour.
pub struct Console {
    color: bool,
}

impl Console {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn outcome(&self, outcome: &ProbeOutcome) {
        self.print(outcome_color(outcome), &format_outcome(outcome));
    }

    pub fn info(&self, text: &str) {
        self.print(BLUE, text);
    }

    pub fn plain(&self, text: &str) {
        println!("{text}");
    }

    fn print(&self, (r, g, b): (u8, u8, u8), text: &str) {
        if self.color {
            println!("\x1b[38;2;{r};{g};{b}m{text}\x1b[0m");
        } else {
            println!("{text}");
        }
    }
}

/// `[i/N] [ STATUS ] (ms) Site: URL`
pub fn format_outcome(outcome: &ProbeOutcome) -> String {
    let status = match (outcome.status, outcome.http_status) {
        (ProbeStatus::Timeout, _) => "TIMEOUT".to_string(),
        (ProbeStatus::Hit | ProbeStatus::Miss, Some(code)) => code.to_string(),
        (_, _) => match outcome.last_error {
            Some(kind) => format!("ERR: {kind}"),
            None => "ERR".to_string(),
        },
    };
    format!(
        "[{}/{}] [ {} ] ({}ms) {}: {}",
        outcome.ordinal,
        outcome.total,
        status,
        outcome.elapsed.as_millis(),
        outcome.site.name,
        outcome.url
    )
}

fn outcome_color(outcome: &ProbeOutcome) -> (u8, u8, u8) {
    match (outcome.status, outcome.http_status) {
        (ProbeStatus::Hit, _) => GREEN,
        (ProbeStatus::Miss, Some(404)) => RED,
        _ => YELLOW,
    }
}

pub fn format_user(user: &UserSummary) -> String {
    let mut line = format!(
        "{}: {} hit(s) across {}/{} site(s)",
        user.username, user.hits, user.checked, user.planned
    );
    if user.errors + user.timeouts > 0 {
        line.push_str(&format!(
            ", {} error(s), {} timeout(s)",
            user.errors, user.timeouts
        ));
    }
    if user.interrupted {
        line.push_str(" (interrupted)");
    }
    line
}

pub fn format_tally(summary: &ScanSummary, saved: usize, mode: &str) -> Vec<String> {
    let mut lines = vec![format!(
        "Completed {} requests in {:.2}s",
        summary.completed,
        summary.elapsed.as_secs_f64()
    )];
    if summary.cancelled {
        lines.push(format!(
            "Cancelled: {} of {} probes were dispatched",
            summary.dispatched, summary.planned
        ));
    }
    lines.push(format!("Saved positives: {saved} (mode: {mode})"));
    lines
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use scout_core::{ErrorKind, SiteSpec};

    use super::*;

    fn outcome(status: ProbeStatus, http_status: Option<u16>) -> ProbeOutcome {
        ProbeOutcome {
            site: Arc::new(SiteSpec::new("GitHub", "https://github.com/{user}").unwrap()),
            username: Arc::from("bob"),
            url: "https://github.com/bob".to_string(),
            status,
            http_status,
            attempts: 1,
            elapsed: Duration::from_millis(123),
            last_error: None,
            ordinal: 3,
            total: 10,
        }
    }

    #[test]
    fn hit_line() {
        let line = format_outcome(&outcome(ProbeStatus::Hit, Some(200)));
        assert_eq!(line, "[3/10] [ 200 ] (123ms) GitHub: https://github.com/bob");
        assert_eq!(outcome_color(&outcome(ProbeStatus::Hit, Some(200))), GREEN);
    }

    #[test]
    fn not_found_is_red() {
        assert_eq!(outcome_color(&outcome(ProbeStatus::Miss, Some(404))), RED);
        assert_eq!(outcome_color(&outcome(ProbeStatus::Miss, Some(200))), YELLOW);
    }

    #[test]
    fn error_line_names_the_cause() {
        let mut o = outcome(ProbeStatus::Error, Some(503));
        o.last_error = Some(ErrorKind::Status(503));
        assert!(format_outcome(&o).contains("[ ERR: http 503 ]"));

        let t = outcome(ProbeStatus::Timeout, None);
        assert!(format_outcome(&t).contains("[ TIMEOUT ]"));
    }

    #[test]
    fn user_line_mentions_interruption() {
        let user = UserSummary {
            username: Arc::from("bob"),
            planned: 5,
            checked: 2,
            hits: 1,
            misses: 1,
            errors: 0,
            timeouts: 0,
            interrupted: true,
        };
        assert_eq!(
            format_user(&user),
            "bob: 1 hit(s) across 2/5 site(s) (interrupted)"
        );
    }
}
