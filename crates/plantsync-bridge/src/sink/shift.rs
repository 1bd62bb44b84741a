use plantsync_common::MessageKind;

use super::{decode_record, PgSinkWriter, SinkResult, WriteOutcome};
use crate::messages::{timestamp_from_unix_ms, QueuedRecord, ShiftAdd, ShiftDelete};

/// Create a shift; a redelivered create is a no-op.
pub(super) async fn add(writer: &PgSinkWriter, payload: &[u8]) -> SinkResult<WriteOutcome> {
    let record: QueuedRecord<ShiftAdd> = decode_record(MessageKind::ShiftAdd, payload)?;
    let start = timestamp_from_unix_ms("startTimeUnixMs", record.message.start_time_unix_ms)?;
    let end = timestamp_from_unix_ms("endTimeUnixMs", record.message.end_time_unix_ms)?;

    let asset_id = writer.catalog().get_or_insert_asset(&record.asset).await?;

    let rows = writer
        .execute(
            sqlx::query(
                r#"
                INSERT INTO shifts (asset_id, start_time, end_time)
                VALUES ($1, $2, $3)
                ON CONFLICT ON CONSTRAINT shift_start_asset_uniq DO NOTHING
                "#,
            )
            .bind(asset_id)
            .bind(start)
            .bind(end),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::debug!(asset = %record.asset, start_time = %start, "Shift already exists");
    }
    Ok(outcome)
}

/// Delete the shift starting at the given time; a missing shift is a no-op.
pub(super) async fn delete(writer: &PgSinkWriter, payload: &[u8]) -> SinkResult<WriteOutcome> {
    let record: QueuedRecord<ShiftDelete> = decode_record(MessageKind::ShiftDelete, payload)?;
    let start = timestamp_from_unix_ms("startTimeUnixMs", record.message.start_time_unix_ms)?;

    let asset_id = writer.catalog().get_or_insert_asset(&record.asset).await?;

    let rows = writer
        .execute(
            sqlx::query("DELETE FROM shifts WHERE asset_id = $1 AND start_time = $2")
                .bind(asset_id)
                .bind(start),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::debug!(asset = %record.asset, start_time = %start, "No shift to delete");
    }
    Ok(outcome)
}
