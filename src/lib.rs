// src/lib.rs
pub mod cache;
pub mod errors;
pub mod mappings;
pub mod organism;
pub mod taxdump;
pub mod taxonomy;
pub mod tree;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;

pub use crate::cache::{file_digest, FileCache};
pub use crate::errors::{Error, Result};
pub use crate::mappings::DatasetMapping;
pub use crate::organism::{resolve_organism, NullValues, OrganismRecord, RawRecord};
pub use crate::taxonomy::{DatasetLookup, Taxonomy};

/// Outcome of a batch run over sample records: every resolved record,
/// the grouping table, and the ids that could not be grouped.
#[derive(Debug, Default, Serialize)]
pub struct BatchResults {
    pub records: Vec<OrganismRecord>,
    /// grouping key -> record ids, in input order.
    pub grouped: IndexMap<String, Vec<String>>,
    /// Sorted, deduplicated ids of records rejected from grouping.
    pub rejected: Vec<String>,
    pub processed: usize,
}

fn collect_results(resolved: Vec<OrganismRecord>) -> BatchResults {
    let mut results = BatchResults {
        processed: resolved.len(),
        ..Default::default()
    };

    for record in &resolved {
        match &record.grouping_key {
            Some(key) => results
                .grouped
                .entry(key.clone())
                .or_default()
                .push(record.record_id.clone()),
            None => results.rejected.push(record.record_id.clone()),
        }
    }

    results.records = resolved;
    results.rejected.sort();
    results.rejected.dedup();
    results
}

/// Resolves records one at a time, logging progress counts. A record
/// that cannot be grouped lands in `rejected`; the run never aborts on
/// a single record.
pub fn resolve_records(
    records: &[RawRecord],
    taxonomy: &Taxonomy,
    null_values: &NullValues,
) -> BatchResults {
    let mut resolved = Vec::with_capacity(records.len());
    for (n, record) in records.iter().enumerate() {
        resolved.push(resolve_organism(record, taxonomy, null_values));
        if (n + 1) % 100 == 0 {
            log::info!("Processed {} records", n + 1);
        }
    }
    collect_results(resolved)
}

/// Parallel resolution over all records. The taxonomy is read-only
/// after `Taxonomy::load`, so records fan out freely; grouping is done
/// afterwards in input order to keep the output deterministic.
pub fn resolve_records_parallel(
    records: &[RawRecord],
    taxonomy: &Taxonomy,
    null_values: &NullValues,
) -> BatchResults {
    let resolved: Vec<OrganismRecord> = records
        .par_iter()
        .map(|record| resolve_organism(record, taxonomy, null_values))
        .collect();
    collect_results(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::fixture;
    use std::collections::HashMap;

    fn record(id: &str, fields: &[(&str, &str)]) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<String, String>>(),
        }
    }

    #[test]
    fn batch_groups_shared_taxa_and_rejects_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let taxonomy = fixture::load(dir.path());
        let nulls = NullValues::default();

        let records = vec![
            record("pkg-a", &[("taxon_id", "4")]),
            record("pkg-b", &[("scientific_name", "Homo sapiens")]),
            record("pkg-c", &[("taxon_id", "3")]),
            record("pkg-d", &[("scientific_name", "NA")]),
        ];

        let results = resolve_records(&records, &taxonomy, &nulls);
        assert_eq!(results.processed, 4);
        assert_eq!(results.records.len(), 4);
        assert_eq!(
            results.grouped.get("Homo_sapiens_4").unwrap(),
            &vec!["pkg-a".to_string(), "pkg-b".to_string()]
        );
        assert_eq!(
            results.rejected,
            vec!["pkg-c".to_string(), "pkg-d".to_string()]
        );
    }

    #[test]
    fn parallel_batch_matches_the_serial_run() {
        let dir = tempfile::tempdir().unwrap();
        let taxonomy = fixture::load(dir.path());
        let nulls = NullValues::default();

        let records = vec![
            record("pkg-a", &[("taxon_id", "4")]),
            record("pkg-b", &[("taxon_id", "7")]),
            record("pkg-c", &[("taxon_id", "999")]),
        ];

        let serial = resolve_records(&records, &taxonomy, &nulls);
        let parallel = resolve_records_parallel(&records, &taxonomy, &nulls);

        assert_eq!(serial.processed, parallel.processed);
        assert_eq!(serial.rejected, parallel.rejected);
        let serial_keys: Vec<&String> = serial.grouped.keys().collect();
        let parallel_keys: Vec<&String> = parallel.grouped.keys().collect();
        assert_eq!(serial_keys, parallel_keys);
    }
}
