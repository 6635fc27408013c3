use super::engine::ArchiveMonth;
use crate::core::{MessageRecord, RecordKey};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;

/// Groups every record older than `cutoff` by calendar month, oldest first
/// within each month.
pub fn plan_sweep<'a, I>(records: I, cutoff: NaiveDateTime) -> BTreeMap<ArchiveMonth, Vec<MessageRecord>>
where
    I: IntoIterator<Item = &'a MessageRecord>,
{
    let mut plan: BTreeMap<ArchiveMonth, Vec<MessageRecord>> = BTreeMap::new();
    for record in records {
        if record.connect_time < cutoff {
            plan.entry(ArchiveMonth::of(&record.connect_time))
                .or_default()
                .push(record.clone());
        }
    }
    for records in plan.values_mut() {
        records.sort_by(|a, b| a.connect_time.cmp(&b.connect_time));
    }
    plan
}

/// Outcome of one archival sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub cutoff: Option<NaiveDateTime>,
    /// Months written to and how many records each received.
    pub archived: Vec<(String, usize)>,
    /// Months that could not be written; their records stay hot.
    pub failed: Vec<String>,
    #[serde(skip)]
    pub moved_keys: Vec<RecordKey>,
}

impl SweepReport {
    pub fn moved(&self) -> usize {
        self.moved_keys.len()
    }

    pub fn is_noop(&self) -> bool {
        self.moved_keys.is_empty() && self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse_timestamp;

    #[test]
    fn plan_groups_by_month_and_respects_cutoff() {
        let records = vec![
            MessageRecord::new(parse_timestamp("2024/01/31 23:00:00.000").unwrap(), "A", "OK", ""),
            MessageRecord::new(parse_timestamp("2024/01/02 08:00:00.000").unwrap(), "A", "OK", ""),
            MessageRecord::new(parse_timestamp("2024/02/01 00:00:00.000").unwrap(), "A", "OK", ""),
            MessageRecord::new(parse_timestamp("2024/03/10 00:00:00.000").unwrap(), "A", "OK", ""),
        ];
        let cutoff = parse_timestamp("2024/03/01 00:00:00.000").unwrap();
        let plan = plan_sweep(&records, cutoff);

        assert_eq!(plan.len(), 2);
        let january = &plan[&ArchiveMonth { year: 2024, month: 1 }];
        assert_eq!(january.len(), 2);
        assert!(january[0].connect_time < january[1].connect_time);
        assert_eq!(plan[&ArchiveMonth { year: 2024, month: 2 }].len(), 1);
    }
}
