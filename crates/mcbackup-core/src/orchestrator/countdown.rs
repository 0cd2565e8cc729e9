use std::time::Duration;

use crate::config::Timings;
use crate::service::ServiceStatus;

/// A broadcast due `at` after the announcement phase begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub at: Duration,
    pub message: String,
}

/// Broadcasts leading up to the stop command, plus the offset at which `stop` is due.
/// Offsets are fixed up front so a slow or failing broadcast never shifts the rest.
pub fn schedule(status: &ServiceStatus, timings: &Timings) -> (Vec<Notice>, Duration) {
    let lead = timings.warning_lead();
    let final_warning = timings.final_warning();

    let mut notices = vec![
        Notice {
            at: Duration::ZERO,
            message: status_message(status),
        },
        Notice {
            at: Duration::ZERO,
            message: format!("Server restarting for a backup in {}.", describe(lead)),
        },
        Notice {
            at: lead.saturating_sub(final_warning),
            message: format!("Server restarting for a backup in {}.", describe(final_warning)),
        },
    ];

    for n in (1..=timings.countdown_from).rev() {
        notices.push(Notice {
            at: lead.saturating_sub(Duration::from_secs(u64::from(n))),
            message: n.to_string(),
        });
    }

    (notices, lead)
}

fn status_message(status: &ServiceStatus) -> String {
    if status.version.is_empty() {
        format!(
            "{}/{} players online. A scheduled backup is about to begin.",
            status.current_player_count, status.max_player_count
        )
    } else {
        format!(
            "Server {} with {}/{} players online. A scheduled backup is about to begin.",
            status.version, status.current_player_count, status.max_player_count
        )
    }
}

fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s > 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{s} seconds"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> ServiceStatus {
        ServiceStatus {
            online: true,
            version: "1.20.1".into(),
            current_player_count: 3,
            max_player_count: 20,
        }
    }

    #[test]
    fn default_schedule_warns_at_five_and_one_minute_then_counts_down() {
        let (notices, stop_at) = schedule(&status(), &Timings::default());

        assert_eq!(stop_at, Duration::from_secs(300));
        let offsets: Vec<u64> = notices.iter().map(|n| n.at.as_secs()).collect();
        assert_eq!(offsets, vec![0, 0, 240, 295, 296, 297, 298, 299]);

        assert!(notices[0].message.contains("1.20.1"));
        assert!(notices[0].message.contains("3/20"));
        assert!(notices[1].message.contains("5 minutes"));
        assert!(notices[2].message.contains("1 minute"));
        let tail: Vec<&str> = notices[3..].iter().map(|n| n.message.as_str()).collect();
        assert_eq!(tail, vec!["5", "4", "3", "2", "1"]);
    }

    #[test]
    fn offsets_never_decrease() {
        let timings = Timings {
            warning_lead_secs: 90,
            final_warning_secs: 30,
            countdown_from: 3,
            ..Timings::default()
        };
        let (notices, stop_at) = schedule(&status(), &timings);
        assert!(notices.windows(2).all(|w| w[0].at <= w[1].at));
        assert!(notices.iter().all(|n| n.at < stop_at));
        assert!(notices[1].message.contains("90 seconds"));
    }
}
