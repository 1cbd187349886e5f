//! Unique product handler: one individually tracked product on an asset

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{HandlerContext, ParsedMessage, ProcessMessages, Verdict};
use crate::store::Row;

#[derive(Debug, Deserialize)]
struct UniqueProductPayload {
    begin_timestamp_ms: Option<u64>,
    /// Absent or null while the product is still in production
    end_timestamp_ms: Option<i64>,
    product_id: Option<String>,
    #[serde(default)]
    is_scrap: bool,
    #[serde(rename = "uniqueProductAlternativeID")]
    alternative_id: Option<String>,
}

/// Handles `uniqueProduct` messages
pub struct UniqueProduct {
    ctx: Arc<HandlerContext>,
}

impl UniqueProduct {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    async fn row(&self, msg: &ParsedMessage) -> Result<Row, Verdict> {
        let payload: UniqueProductPayload = self.ctx.decode(msg)?;
        let begin_timestamp_ms =
            self.ctx
                .timestamp(msg, "begin_timestamp_ms", payload.begin_timestamp_ms)?;
        let product = self.ctx.required(msg, "product_id", payload.product_id)?;
        let alternative_id = self.ctx.required(
            msg,
            "uniqueProductAlternativeID",
            payload.alternative_id,
        )?;

        if product.is_empty() || alternative_id.is_empty() {
            return Err(self.ctx.invalid(
                msg,
                "empty product_id or uniqueProductAlternativeID".to_string(),
            ));
        }
        if let Some(end) = payload.end_timestamp_ms {
            if end < begin_timestamp_ms {
                return Err(self.ctx.invalid(
                    msg,
                    format!(
                        "end_timestamp_ms {} before begin_timestamp_ms {}",
                        end, begin_timestamp_ms
                    ),
                ));
            }
        }

        let asset_id = self.ctx.resolve_asset(msg).await?;
        let product_id = self.ctx.resolve_product(&product, asset_id).await?;

        Ok(Row::UniqueProduct {
            asset_id,
            begin_timestamp_ms,
            end_timestamp_ms: payload.end_timestamp_ms,
            product_id,
            is_scrap: payload.is_scrap,
            alternative_id,
        })
    }
}

#[async_trait]
impl ProcessMessages for UniqueProduct {
    async fn process_messages(&self, msg: &ParsedMessage) -> Verdict {
        match self.row(msg).await {
            Ok(row) => self.ctx.write(row).await,
            Err(verdict) => verdict,
        }
    }
}
