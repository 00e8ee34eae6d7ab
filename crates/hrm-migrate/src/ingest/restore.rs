//! Restore a table from a columnar snapshot
//!
//! The snapshot is resolved and its partitions listed before anything is
//! truncated, so asking for a missing or empty snapshot leaves the table as it
//! was. Partitions are then loaded in key order; the first failing partition
//! aborts the restore.

use std::sync::Arc;

use chrono::NaiveDateTime;
use hrm_common::types::{Record, TableKind};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::backup::{batch_to_records, snapshot_prefix, table_prefix, SNAPSHOT_FORMAT};
use crate::ingest::loader::{BulkLoader, LoadReport};
use crate::storage::ObjectStore;

const PARTITION_SUFFIX: &str = ".parquet";

/// Result of one restore run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub table: TableKind,
    /// `backups/{table}/{snapshot}/`
    pub snapshot_prefix: String,
    pub partitions: usize,
    pub load: LoadReport,
}

impl RestoreReport {
    pub fn rows_restored(&self) -> u64 {
        self.load.rows_loaded
    }
}

/// Whether `name` is a snapshot directory name
pub fn is_snapshot_name(name: &str) -> bool {
    name.len() == 15 && NaiveDateTime::parse_from_str(name, SNAPSHOT_FORMAT).is_ok()
}

pub struct ColumnarBackupReader {
    loader: BulkLoader,
    objects: Arc<dyn ObjectStore>,
}

impl ColumnarBackupReader {
    pub fn new(loader: BulkLoader, objects: Arc<dyn ObjectStore>) -> Self {
        Self { loader, objects }
    }

    /// Name of the most recent snapshot of `table`
    pub async fn latest_snapshot(&self, table: TableKind) -> PipelineResult<String> {
        let root = table_prefix(table);
        let prefixes = self
            .objects
            .list_prefixes(&root, "/")
            .await
            .map_err(PipelineError::storage)?;

        let latest = prefixes
            .iter()
            .filter_map(|prefix| prefix.strip_prefix(&root))
            .map(|name| name.trim_end_matches('/'))
            .filter(|name| is_snapshot_name(name))
            .max()
            .map(str::to_string);

        match latest {
            Some(name) => {
                info!(table = %table, snapshot = %name, "Resolved latest snapshot");
                Ok(name)
            }
            None => Err(PipelineError::NoBackupFound(table)),
        }
    }

    /// Turn a snapshot reference into the key prefix of its partitions.
    ///
    /// Accepts `s3://{bucket}/backups/{table}/{ts}/`, `backups/{table}/{ts}/`
    /// or a bare `{ts}`. The snapshot must belong to `table`.
    pub fn snapshot_location(&self, table: TableKind, reference: &str) -> PipelineResult<String> {
        let reference = reference.trim();

        let prefix = if let Some(rest) = reference.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket != self.objects.bucket() {
                return Err(PipelineError::invalid_backup(format!(
                    "snapshot {} is in bucket '{}', expected '{}'",
                    reference,
                    bucket,
                    self.objects.bucket()
                )));
            }
            key.to_string()
        } else if reference.contains('/') {
            reference.to_string()
        } else if is_snapshot_name(reference) {
            snapshot_prefix(table, reference)
        } else {
            return Err(PipelineError::invalid_backup(format!(
                "'{}' is not a snapshot name ({})",
                reference, SNAPSHOT_FORMAT
            )));
        };

        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        if !prefix.starts_with(&table_prefix(table)) {
            return Err(PipelineError::invalid_backup(format!(
                "snapshot {} does not belong to table {}",
                reference, table
            )));
        }
        Ok(prefix)
    }

    /// Replace the contents of `table` with a snapshot, the latest one when
    /// `snapshot` is `None`. Rows are loaded `chunk_size` at a time.
    #[instrument(skip(self))]
    pub async fn restore(
        &self,
        table: TableKind,
        snapshot: Option<&str>,
        chunk_size: usize,
    ) -> PipelineResult<RestoreReport> {
        let prefix = match snapshot {
            Some(reference) => self.snapshot_location(table, reference)?,
            None => snapshot_prefix(table, &self.latest_snapshot(table).await?),
        };

        let mut partitions: Vec<String> = self
            .objects
            .list(&prefix)
            .await
            .map_err(PipelineError::storage)?
            .into_iter()
            .filter(|key| key.ends_with(PARTITION_SUFFIX))
            .collect();
        partitions.sort();
        if partitions.is_empty() {
            return Err(PipelineError::NoPartitions(prefix));
        }
        info!(table = %table, prefix = %prefix, partitions = partitions.len(), "Restoring snapshot");

        let loader = self.loader.with_chunk_size(chunk_size);
        let mut report = RestoreReport {
            table,
            snapshot_prefix: prefix,
            partitions: partitions.len(),
            load: LoadReport {
                truncated: loader.truncate_best_effort(table).await,
                ..LoadReport::default()
            },
        };

        for key in &partitions {
            let before = report.load.rows_loaded;
            self.restore_partition(&loader, table, key, &mut report.load).await?;
            info!(key = %key, rows = report.load.rows_loaded - before, "Restored partition");
        }

        info!(
            table = %table,
            rows = report.rows_restored(),
            partitions = report.partitions,
            "Restore complete"
        );
        Ok(report)
    }

    async fn restore_partition(
        &self,
        loader: &BulkLoader,
        table: TableKind,
        key: &str,
        load: &mut LoadReport,
    ) -> PipelineResult<()> {
        let file = tempfile::Builder::new()
            .prefix("hrm-restore-")
            .suffix(PARTITION_SUFFIX)
            .tempfile()?;

        let bytes = self
            .objects
            .get_to_file(key, file.path())
            .await
            .map_err(PipelineError::storage)?;
        debug!(key = %key, bytes, "Downloaded partition");

        let partition = file.reopen()?;
        let records = tokio::task::spawn_blocking(move || -> PipelineResult<Vec<Record>> {
            let reader = ParquetRecordBatchReaderBuilder::try_new(partition)?.build()?;
            let mut records = Vec::new();
            for batch in reader {
                records.extend(batch_to_records(table, &batch?)?);
            }
            Ok(records)
        })
        .await??;

        if records.is_empty() {
            warn!(key = %key, "Partition is empty");
            return Ok(());
        }
        loader.append_into(table, records, load).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::backup::ColumnarBackupWriter;
    use crate::ingest::testing::{MemoryObjectStore, MemoryStore};
    use chrono::{TimeZone, Utc};
    use hrm_common::types::{Department, HiredEmployee, Job, Record};

    struct Fixture {
        store: Arc<MemoryStore>,
        objects: Arc<MemoryObjectStore>,
        reader: ColumnarBackupReader,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::default());
            let objects = Arc::new(MemoryObjectStore::default());
            Self {
                reader: ColumnarBackupReader::new(BulkLoader::new(store.clone(), 1000), objects.clone()),
                store,
                objects,
            }
        }

        async fn backup(&self, table: TableKind, second: u32, chunk: usize) {
            ColumnarBackupWriter::new(self.store.clone(), self.objects.clone())
                .with_write_chunk_size(chunk)
                .backup_at(table, Utc.with_ymd_and_hms(2025, 10, 7, 12, 0, second).unwrap())
                .await
                .unwrap();
        }
    }

    fn employees(count: i32) -> Vec<Record> {
        (1..=count)
            .map(|id| {
                HiredEmployee {
                    id: Some(id),
                    name: format!("Employee {}", id),
                    hired_at: Utc.with_ymd_and_hms(2021, 1, 1, 8, 0, 0).unwrap()
                        + chrono::Duration::hours(id.into()),
                    department_id: 1,
                    job_id: 1,
                }
                .into()
            })
            .collect()
    }

    #[test]
    fn test_snapshot_names() {
        assert!(is_snapshot_name("20251007T123456"));
        assert!(!is_snapshot_name("20251007T1234"));
        assert!(!is_snapshot_name("latest-backup-xx"));
        assert!(!is_snapshot_name("20251307T123456"));
    }

    #[test]
    fn test_snapshot_location_forms() {
        let fixture = Fixture::new();
        let expected = "backups/jobs/20251007T123456/";

        for reference in [
            "s3://hrm-test/backups/jobs/20251007T123456/",
            "backups/jobs/20251007T123456",
            "20251007T123456",
        ] {
            assert_eq!(
                fixture.reader.snapshot_location(TableKind::Jobs, reference).unwrap(),
                expected
            );
        }

        assert!(fixture
            .reader
            .snapshot_location(TableKind::Jobs, "s3://other/backups/jobs/20251007T123456/")
            .is_err());
        assert!(fixture
            .reader
            .snapshot_location(TableKind::Departments, "backups/jobs/20251007T123456/")
            .is_err());
    }

    #[tokio::test]
    async fn test_backup_then_restore_round_trip() {
        let fixture = Fixture::new();
        fixture.store.seed(employees(2500));
        let original = fixture.store.rows(TableKind::HiredEmployees);
        fixture.backup(TableKind::HiredEmployees, 0, 1000).await;

        fixture.store.seed(vec![HiredEmployee {
            id: Some(9999),
            name: "Written After Backup".into(),
            hired_at: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            department_id: 1,
            job_id: 1,
        }
        .into()]);

        let report = fixture
            .reader
            .restore(TableKind::HiredEmployees, None, 400)
            .await
            .unwrap();

        assert_eq!(report.partitions, 3);
        assert_eq!(report.rows_restored(), 2500);
        assert!(report.load.truncated);
        assert_eq!(fixture.store.rows(TableKind::HiredEmployees), original);
    }

    #[tokio::test]
    async fn test_latest_snapshot_ignores_foreign_directories() {
        let fixture = Fixture::new();
        fixture.store.seed(vec![Job { id: 1, name: "Analyst".into() }.into()]);
        fixture.backup(TableKind::Jobs, 5, 10).await;
        fixture.store.seed(vec![Job { id: 2, name: "Recruiter".into() }.into()]);
        fixture.backup(TableKind::Jobs, 9, 10).await;
        fixture.objects.insert("backups/jobs/manual-copy/part-0000.parquet", Vec::new());

        assert_eq!(
            fixture.reader.latest_snapshot(TableKind::Jobs).await.unwrap(),
            "20251007T120009"
        );

        let report = fixture.reader.restore(TableKind::Jobs, Some("20251007T120005"), 10).await.unwrap();
        assert_eq!(report.rows_restored(), 1);
        assert_eq!(
            fixture.store.rows(TableKind::Jobs),
            vec![Record::from(Job { id: 1, name: "Analyst".into() })]
        );
    }

    #[tokio::test]
    async fn test_missing_backup_leaves_table_untouched() {
        let fixture = Fixture::new();
        fixture.store.seed(vec![Department { id: 1, name: "Sales".into() }.into()]);

        let err = fixture
            .reader
            .restore(TableKind::Departments, None, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoBackupFound(TableKind::Departments)));

        let err = fixture
            .reader
            .restore(TableKind::Departments, Some("20251007T120000"), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoPartitions(_)));
        assert_eq!(fixture.store.rows(TableKind::Departments).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_partition_aborts_restore() {
        let fixture = Fixture::new();
        fixture.store.seed(
            (1..=30)
                .map(|id| Department { id, name: format!("Department {}", id) }.into())
                .collect(),
        );
        fixture.backup(TableKind::Departments, 0, 10).await;
        fixture.objects.fail_get_for("part-0001.parquet");

        let err = fixture
            .reader
            .restore(TableKind::Departments, None, 100)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
        assert_eq!(fixture.store.rows(TableKind::Departments).len(), 10);
    }
}
