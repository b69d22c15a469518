use common::types::Record;

pub fn is_oversize(record: &Record, max_length: usize) -> bool {
    record.residue_count() > max_length
}

/// Drops records longer than `max_length` residues, keeping the survivors in order.
pub fn filter_records(records: &[Record], max_length: usize) -> Vec<Record> {
    records
        .iter()
        .filter(|record| !is_oversize(record, max_length))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, len: usize) -> Record {
        Record::new(id, "A".repeat(len))
    }

    #[test]
    fn removes_only_records_above_the_limit() {
        let records = vec![record("a", 2000), record("b", 10), record("c", 1024), record("d", 1025)];
        let kept = filter_records(&records, 1024);

        let ids: Vec<&str> = kept.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn leaves_input_untouched_and_never_grows() {
        let records = vec![record("x", 3), record("y", 1), record("z", 2)];
        let snapshot = records.clone();

        for limit in 0..4 {
            let kept = filter_records(&records, limit);
            assert!(kept.len() <= records.len());
            let positions: Vec<usize> = kept
                .iter()
                .map(|k| records.iter().position(|r| r == k).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "order changed");
        }
        assert_eq!(records, snapshot);
    }

    #[test]
    fn all_filtered_batch_is_empty() {
        let records = vec![record("long", 5)];
        assert!(filter_records(&records, 4).is_empty());
    }
}
