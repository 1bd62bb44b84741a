use plantsync_common::MessageKind;

use super::{decode_record, PgSinkWriter, SinkResult, WriteOutcome};
use crate::messages::{ResolvedRecord, ScrapUniqueProduct};

/// Flag a unique product as scrap. The asset id was resolved at ingest.
pub(super) async fn mark_scrapped(
    writer: &PgSinkWriter,
    payload: &[u8],
) -> SinkResult<WriteOutcome> {
    let record: ResolvedRecord<ScrapUniqueProduct> =
        decode_record(MessageKind::ScrapUniqueProduct, payload)?;

    let rows = writer
        .execute(
            sqlx::query(
                r#"
                UPDATE unique_products
                SET is_scrap = TRUE
                WHERE unique_product_id = $1
                  AND asset_id = $2
                  AND is_scrap = FALSE
                "#,
            )
            .bind(&record.message.uid)
            .bind(record.asset_id),
        )
        .await?;

    let outcome = WriteOutcome::from_rows_affected(rows);
    if outcome == WriteOutcome::Unchanged {
        tracing::info!(
            asset = %record.asset,
            uid = %record.message.uid,
            "Unique product unknown or already scrapped, ignoring"
        );
    }
    Ok(outcome)
}
