use chrono::{DateTime, Local, NaiveDateTime};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H-%M-%S";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// `<prefix>_<YYYYMMDD_HH-MM-SS>.tar.gz`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    prefix: String,
}

impl ArchiveNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn file_name(&self, at: DateTime<Local>) -> String {
        format!(
            "{}_{}{}",
            self.prefix,
            at.format(TIMESTAMP_FORMAT),
            ARCHIVE_SUFFIX
        )
    }

    pub fn matches(&self, name: &str) -> bool {
        self.timestamp_of(name).is_some()
    }

    pub fn timestamp_of(&self, name: &str) -> Option<NaiveDateTime> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix('_')?;
        let stamp = rest.strip_suffix(ARCHIVE_SUFFIX)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
    }
}

/// A file seen in a listing, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionEntry {
    pub name: String,
    pub modified: SystemTime,
}

impl RetentionEntry {
    pub fn new(name: impl Into<String>, modified: SystemTime) -> Self {
        Self {
            name: name.into(),
            modified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    window: Duration,
    naming: ArchiveNaming,
}

impl RetentionPolicy {
    pub fn new(window: Duration, naming: ArchiveNaming) -> Self {
        Self { window, naming }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn cutoff(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(self.window)
            .map_or(UNIX_EPOCH, |cutoff| cutoff.max(UNIX_EPOCH))
    }

    pub fn expired(&self, entries: &[RetentionEntry], cutoff: SystemTime) -> Vec<String> {
        expired(&self.naming, entries, cutoff)
    }
}

/// Names of archives modified strictly before `cutoff`, in input order.
/// Files that don't follow the archive naming scheme are never returned.
pub fn expired(naming: &ArchiveNaming, entries: &[RetentionEntry], cutoff: SystemTime) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| naming.matches(&entry.name))
        .filter(|entry| entry.modified < cutoff)
        .map(|entry| entry.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    const DAY: Duration = Duration::from_secs(86_400);

    fn naming() -> ArchiveNaming {
        ArchiveNaming::new("minecraft_backup")
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn file_name_uses_fixed_timestamp_layout() {
        let when = Local
            .with_ymd_and_hms(2023, 3, 29, 4, 5, 6)
            .single()
            .expect("unambiguous local time");
        let name = naming().file_name(when);
        assert_eq!(name, "minecraft_backup_20230329_04-05-06.tar.gz");
        assert!(naming().matches(&name));
    }

    #[test]
    fn pattern_rejects_lookalikes() {
        let n = naming();
        assert!(!n.matches("minecraft_backup_20230329_04-05-06.tar"));
        assert!(!n.matches("minecraft_backup_20230329_04-05-06.tar.gz.partial"));
        assert!(!n.matches("minecraft_backup_latest.tar.gz"));
        assert!(!n.matches("other_20230329_04-05-06.tar.gz"));
        assert!(!n.matches("minecraft_backup20230329_04-05-06.tar.gz"));
        assert!(!n.matches("notes.txt"));
    }

    #[test]
    fn only_strictly_older_matching_entries_expire() {
        let cutoff = at(10 * 86_400);
        let entries = vec![
            RetentionEntry::new("minecraft_backup_20230101_00-00-00.tar.gz", at(86_400)),
            RetentionEntry::new("minecraft_backup_20230102_00-00-00.tar.gz", cutoff),
            RetentionEntry::new("minecraft_backup_20230103_00-00-00.tar.gz", at(11 * 86_400)),
            RetentionEntry::new("server.properties", at(1)),
            RetentionEntry::new("minecraft_backup_manual.tar.gz", at(1)),
        ];

        let result = expired(&naming(), &entries, cutoff);
        assert_eq!(result, vec!["minecraft_backup_20230101_00-00-00.tar.gz".to_string()]);
    }

    #[test]
    fn empty_and_all_expired_inputs_behave_like_any_other() {
        assert!(expired(&naming(), &[], at(100)).is_empty());

        let entries: Vec<_> = (1..=4)
            .map(|day| {
                RetentionEntry::new(format!("minecraft_backup_2023010{day}_00-00-00.tar.gz"), at(day))
            })
            .collect();
        let result = expired(&naming(), &entries, at(1_000));
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn result_is_order_independent_and_repeatable() {
        let entries = vec![
            RetentionEntry::new("minecraft_backup_20230101_00-00-00.tar.gz", at(10)),
            RetentionEntry::new("minecraft_backup_20230102_00-00-00.tar.gz", at(500)),
            RetentionEntry::new("minecraft_backup_20230103_00-00-00.tar.gz", at(20)),
            RetentionEntry::new("world.zip", at(5)),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();

        let first: BTreeSet<_> = expired(&naming(), &entries, at(100)).into_iter().collect();
        let again: BTreeSet<_> = expired(&naming(), &entries, at(100)).into_iter().collect();
        let flipped: BTreeSet<_> = expired(&naming(), &reversed, at(100)).into_iter().collect();

        assert_eq!(first, again);
        assert_eq!(first, flipped);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn cutoff_subtracts_window_and_saturates() {
        let policy = RetentionPolicy::new(7 * DAY, naming());
        assert_eq!(policy.cutoff(at(8 * 86_400)), at(86_400));
        assert_eq!(policy.cutoff(at(60)), UNIX_EPOCH);
    }
}
