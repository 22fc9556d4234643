//! Batch execution routing.
//!
//! Batches run in one of two modes. Multi-row batched execution is the fast
//! path; row-by-row execution is used when the adapter cannot batch or when
//! the batch carries optimistic-lock qualifiers, because lock detection
//! needs a per-row affected count: an UPDATE/DELETE that matches zero rows
//! means the underlying row was concurrently changed or removed.

use crate::batch::{BatchRow, DeleteBatch, InsertBatch, UpdateBatch};
use rowsync_core::adapter::execute_error;
use rowsync_core::error::{IntegrityError, OptimisticLockError};
use rowsync_core::{
    Connection, DmlTemplate, Error, LockOperation, ObjectId, Result,
};
use tracing::trace;

const BIND_RENDER_LIMIT: usize = 64;

/// Execute an insert batch, returning rows written.
pub fn run_insert(
    conn: &mut dyn Connection,
    batch: &InsertBatch,
    supports_batching: bool,
) -> Result<u64> {
    run(
        conn,
        &batch.template(),
        &batch.rows,
        false,
        supports_batching,
        LockOperation::Update,
    )
}

/// Execute an update batch, failing on stale rows when locking is on.
pub fn run_update(
    conn: &mut dyn Connection,
    batch: &UpdateBatch,
    supports_batching: bool,
) -> Result<u64> {
    run(
        conn,
        &batch.template(),
        &batch.rows,
        batch.uses_lock,
        supports_batching,
        LockOperation::Update,
    )
}

/// Execute a delete batch, failing on stale rows when locking is on.
pub fn run_delete(
    conn: &mut dyn Connection,
    batch: &DeleteBatch,
    supports_batching: bool,
) -> Result<u64> {
    run(
        conn,
        &batch.template(),
        &batch.rows,
        batch.uses_lock,
        supports_batching,
        LockOperation::Delete,
    )
}

fn run(
    conn: &mut dyn Connection,
    template: &DmlTemplate,
    rows: &[BatchRow],
    uses_lock: bool,
    supports_batching: bool,
    operation: LockOperation,
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    trace!(
        table = %template.table,
        kind = ?template.kind,
        rows = rows.len(),
        uses_lock,
        "executing batch"
    );

    if !uses_lock && supports_batching {
        let dml: Vec<_> = rows.iter().map(|r| r.row.clone()).collect();
        return conn.execute_batched(template, &dml).map_err(|err| {
            execute_error(
                template,
                None,
                format!("batched {:?} failed: {}", template.kind, err),
                Some(Box::new(err)),
            )
        });
    }

    // Row-by-row: per-row counts and per-row bind context on failure.
    let mut total = 0u64;
    for batch_row in rows {
        let single = std::slice::from_ref(&batch_row.row);
        let counts = conn.execute_rows(template, single).map_err(|err| {
            execute_error(
                template,
                Some(&batch_row.row),
                format!("{:?} failed: {}", template.kind, err),
                Some(Box::new(err)),
            )
        })?;
        let affected = match counts.first() {
            Some(n) => *n,
            None => {
                return Err(Error::Integrity(IntegrityError {
                    message: format!(
                        "driver returned no affected count for table '{}'",
                        template.table
                    ),
                }));
            }
        };
        if uses_lock && affected == 0 {
            return Err(Error::OptimisticLock(OptimisticLockError {
                object: batch_row
                    .id
                    .clone()
                    .unwrap_or_else(|| ObjectId::new(template.table.clone(), Vec::new())),
                operation,
                qualifier: render_qualifier(template, batch_row),
            }));
        }
        total += affected;
    }
    Ok(total)
}

fn render_qualifier(template: &DmlTemplate, row: &BatchRow) -> String {
    template
        .qualifier
        .iter()
        .zip(row.row.qualifier_values.iter())
        .map(|(col, val)| format!("{}={}", col, val.render_truncated(BIND_RENDER_LIMIT)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{UpdateBatchSet, UpdateKey};
    use rowsync_core::error::{DriverError, DriverErrorKind};
    use rowsync_core::{DmlRow, Value};
    use std::collections::BTreeSet;

    /// Connection that records call shapes and scripts affected counts.
    #[derive(Default)]
    struct ScriptedConnection {
        batched_calls: usize,
        row_calls: usize,
        /// Qualifier first-values that report zero affected rows.
        stale: Vec<Value>,
        fail: bool,
    }

    impl Connection for ScriptedConnection {
        fn begin(&mut self) -> Result<()> {
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        fn execute_rows(&mut self, _t: &DmlTemplate, rows: &[DmlRow]) -> Result<Vec<u64>> {
            if self.fail {
                return Err(Error::Driver(DriverError {
                    kind: DriverErrorKind::Execute,
                    table: None,
                    binds: None,
                    message: "boom".to_string(),
                    source: None,
                }));
            }
            self.row_calls += rows.len();
            Ok(rows
                .iter()
                .map(|r| {
                    let stale = r
                        .qualifier_values
                        .first()
                        .is_some_and(|v| self.stale.contains(v));
                    u64::from(!stale)
                })
                .collect())
        }

        fn execute_batched(&mut self, _t: &DmlTemplate, rows: &[DmlRow]) -> Result<u64> {
            self.batched_calls += 1;
            Ok(rows.len() as u64)
        }
    }

    fn update_batch(uses_lock: bool, rows: Vec<BatchRow>) -> UpdateBatch {
        let mut set = UpdateBatchSet::new();
        let batch = set.get_or_insert(
            UpdateKey {
                table: "ARTIST".to_string(),
                changed: ["ARTIST_NAME".to_string()].into_iter().collect(),
                null_qualifiers: BTreeSet::new(),
            },
            vec!["ARTIST_ID".to_string()],
            uses_lock,
        );
        batch.rows = rows;
        set.into_vec().remove(0)
    }

    fn row(pk: i64) -> BatchRow {
        BatchRow {
            id: Some(ObjectId::single("artist", "ARTIST_ID", Value::BigInt(pk))),
            row: DmlRow {
                values: vec![Value::Text("x".into())],
                qualifier_values: vec![Value::BigInt(pk)],
            },
        }
    }

    #[test]
    fn unlocked_batches_route_to_batched_path() {
        let mut conn = ScriptedConnection::default();
        let batch = update_batch(false, vec![row(1), row(2)]);
        let n = run_update(&mut conn, &batch, true).unwrap();
        assert_eq!(n, 2);
        assert_eq!(conn.batched_calls, 1);
        assert_eq!(conn.row_calls, 0);
    }

    #[test]
    fn locked_batches_run_row_by_row() {
        let mut conn = ScriptedConnection::default();
        let batch = update_batch(true, vec![row(1), row(2)]);
        let n = run_update(&mut conn, &batch, true).unwrap();
        assert_eq!(n, 2);
        assert_eq!(conn.batched_calls, 0);
        assert_eq!(conn.row_calls, 2);
    }

    #[test]
    fn non_batching_adapter_runs_row_by_row() {
        let mut conn = ScriptedConnection::default();
        let batch = update_batch(false, vec![row(1)]);
        run_update(&mut conn, &batch, false).unwrap();
        assert_eq!(conn.row_calls, 1);
    }

    #[test]
    fn zero_rows_with_lock_is_lock_failure() {
        let mut conn = ScriptedConnection {
            stale: vec![Value::BigInt(2)],
            ..Default::default()
        };
        let batch = update_batch(true, vec![row(1), row(2)]);
        let err = run_update(&mut conn, &batch, true).unwrap_err();
        match err {
            Error::OptimisticLock(lock) => {
                assert_eq!(lock.operation, LockOperation::Update);
                assert!(lock.qualifier.contains("ARTIST_ID"));
                assert_eq!(
                    lock.object.key_value("ARTIST_ID"),
                    Some(&Value::BigInt(2))
                );
            }
            other => panic!("expected lock failure, got {other}"),
        }
    }

    #[test]
    fn zero_rows_without_lock_is_tolerated() {
        let mut conn = ScriptedConnection {
            stale: vec![Value::BigInt(1)],
            ..Default::default()
        };
        let batch = update_batch(false, vec![row(1)]);
        let n = run_update(&mut conn, &batch, false).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn failure_carries_table_and_binds() {
        let mut conn = ScriptedConnection {
            fail: true,
            ..Default::default()
        };
        let batch = update_batch(true, vec![row(1)]);
        let err = run_update(&mut conn, &batch, true).unwrap_err();
        match err {
            Error::Driver(driver) => {
                assert_eq!(driver.table.as_deref(), Some("ARTIST"));
                assert!(driver.binds.is_some());
            }
            other => panic!("expected driver error, got {other}"),
        }
    }
}
