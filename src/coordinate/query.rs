//! Sorting and filtering of store snapshots into query results

use crate::coordinate::model::{CoordinateEntry, SegmentFilter};
use crate::coordinate::store::CoordinateRecord;

/// Filter by segment and order by node name, then segment (byte-wise).
pub fn sorted_entries(records: Vec<CoordinateRecord>, filter: &SegmentFilter) -> Vec<CoordinateEntry> {
    let mut entries: Vec<CoordinateEntry> = records
        .into_iter()
        .filter(|r| filter.matches(&r.segment))
        .map(CoordinateEntry::from)
        .collect();
    entries.sort_by(|a, b| (&a.node, &a.segment).cmp(&(&b.node, &b.segment)));
    entries.dedup_by(|a, b| a.node == b.node && a.segment == b.segment);
    entries
}

/// Representative of a datacenter: the first entry in query order.
pub fn representative(entries: &[CoordinateEntry]) -> Vec<CoordinateEntry> {
    entries
        .iter()
        .min_by(|a, b| (&a.node, &a.segment).cmp(&(&b.node, &b.segment)))
        .cloned()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::model::Coordinate;

    fn record(node: &str, segment: &str) -> CoordinateRecord {
        CoordinateRecord {
            node: node.into(),
            segment: segment.into(),
            coord: Coordinate::new(2),
            modify_index: 1,
        }
    }

    fn names(entries: &[CoordinateEntry]) -> Vec<(&str, &str)> {
        entries
            .iter()
            .map(|e| (e.node.as_str(), e.segment.as_str()))
            .collect()
    }

    #[test]
    fn test_sorted_by_node_then_segment() {
        let records = vec![
            record("foo", "alpha"),
            record("bar", ""),
            record("foo", ""),
            record("Zed", ""),
        ];
        let entries = sorted_entries(records, &SegmentFilter::Any);
        // byte-wise: uppercase sorts before lowercase
        assert_eq!(
            names(&entries),
            vec![("Zed", ""), ("bar", ""), ("foo", ""), ("foo", "alpha")]
        );
    }

    #[test]
    fn test_segment_filters() {
        let records = || vec![record("foo", "alpha"), record("bar", "")];

        let entries = sorted_entries(records(), &SegmentFilter::Default);
        assert_eq!(names(&entries), vec![("bar", "")]);

        let entries = sorted_entries(records(), &SegmentFilter::Named("alpha".into()));
        assert_eq!(names(&entries), vec![("foo", "alpha")]);

        let entries = sorted_entries(records(), &SegmentFilter::Named("nope".into()));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_empty_input_gives_empty_vec() {
        let entries = sorted_entries(Vec::new(), &SegmentFilter::Any);
        assert!(entries.is_empty());
        assert!(representative(&entries).is_empty());
    }

    #[test]
    fn test_representative_is_first() {
        let entries = sorted_entries(
            vec![record("web-2", ""), record("db-1", "alpha"), record("web-1", "")],
            &SegmentFilter::Any,
        );
        let rep = representative(&entries);
        assert_eq!(rep.len(), 1);
        assert_eq!(rep[0].node, "db-1");
    }
}
