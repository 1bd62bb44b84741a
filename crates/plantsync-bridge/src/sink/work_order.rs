//! Work order writes
//!
//! Status only moves forward: Created -> Started -> Stopped. Each transition
//! is a single `UPDATE` whose predicate requires the previous status and an
//! unset target timestamp, so a replayed or out-of-order event matches nothing.

use plantsync_common::MessageKind;

use super::{decode_record, PgSinkWriter, SinkResult, WriteOutcome};
use crate::messages::{
    timestamp_from_unix_ms, QueuedRecord, WorkOrderCreate, WorkOrderStart, WorkOrderStatus,
    WorkOrderStop,
};

pub(super) async fn create(writer: &PgSinkWriter, payload: &[u8]) -> SinkResult<WriteOutcome> {
    let record: QueuedRecord<WorkOrderCreate> =
        decode_record(MessageKind::WorkOrderCreate, payload)?;
    let order = &record.message;

    let start = order
        .start_time_unix_ms
        .map(|ms| timestamp_from_unix_ms("startTimeUnixMs", ms))
        .transpose()?;
    let end = order
        .end_time_unix_ms
        .map(|ms| timestamp_from_unix_ms("endTimeUnixMs", ms))
        .transpose()?;

    let catalog = writer.catalog();
    let asset_id = catalog.get_or_insert_asset(&record.asset).await?;
    let product_type_id = catalog
        .get_or_insert_product_type(
            asset_id,
            &order.product.external_product_id,
            order.product.cycle_time_ms,
        )
        .await?;

    let rows = writer
        .execute(
            sqlx::query(
                r#"
                INSERT INTO work_orders (
                    external_work_order_id, asset_id, product_type_id,
                    quantity, status, start_time, end_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT ON CONSTRAINT work_order_asset_external_uniq DO NOTHING
                "#,
            )
            .bind(&order.external_work_order_id)
            .bind(asset_id)
            .bind(product_type_id)
            .bind(order.quantity)
            .bind(order.status.as_i16())
            .bind(start)
            .bind(end),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::debug!(
            asset = %record.asset,
            external_work_order_id = %order.external_work_order_id,
            "Work order already exists"
        );
    }
    Ok(outcome)
}

pub(super) async fn start(writer: &PgSinkWriter, payload: &[u8]) -> SinkResult<WriteOutcome> {
    let record: QueuedRecord<WorkOrderStart> = decode_record(MessageKind::WorkOrderStart, payload)?;
    let start = timestamp_from_unix_ms("startTimeUnixMs", record.message.start_time_unix_ms)?;

    let asset_id = writer.catalog().get_or_insert_asset(&record.asset).await?;

    let rows = writer
        .execute(
            sqlx::query(
                r#"
                UPDATE work_orders
                SET status = $1, start_time = $2
                WHERE external_work_order_id = $3
                  AND asset_id = $4
                  AND status = $5
                  AND start_time IS NULL
                "#,
            )
            .bind(WorkOrderStatus::Started.as_i16())
            .bind(start)
            .bind(&record.message.external_work_order_id)
            .bind(asset_id)
            .bind(WorkOrderStatus::Created.as_i16()),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::info!(
            asset = %record.asset,
            external_work_order_id = %record.message.external_work_order_id,
            start_time = %start,
            "Work order start did not match a created work order, ignoring"
        );
    }
    Ok(outcome)
}

pub(super) async fn stop(writer: &PgSinkWriter, payload: &[u8]) -> SinkResult<WriteOutcome> {
    let record: QueuedRecord<WorkOrderStop> = decode_record(MessageKind::WorkOrderStop, payload)?;
    let end = timestamp_from_unix_ms("endTimeUnixMs", record.message.end_time_unix_ms)?;

    let asset_id = writer.catalog().get_or_insert_asset(&record.asset).await?;

    let rows = writer
        .execute(
            sqlx::query(
                r#"
                UPDATE work_orders
                SET status = $1, end_time = $2
                WHERE external_work_order_id = $3
                  AND asset_id = $4
                  AND status = $5
                  AND end_time IS NULL
                "#,
            )
            .bind(WorkOrderStatus::Stopped.as_i16())
            .bind(end)
            .bind(&record.message.external_work_order_id)
            .bind(asset_id)
            .bind(WorkOrderStatus::Started.as_i16()),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::info!(
            asset = %record.asset,
            external_work_order_id = %record.message.external_work_order_id,
            end_time = %end,
            "Work order stop did not match a started work order, ignoring"
        );
    }
    Ok(outcome)
}
