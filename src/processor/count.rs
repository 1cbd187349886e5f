//! Count handler: produced and scrapped pieces at a point in time

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{HandlerContext, ParsedMessage, ProcessMessages, Verdict};
use crate::store::Row;

#[derive(Debug, Deserialize)]
struct CountPayload {
    count: Option<u32>,
    #[serde(default)]
    scrap: u32,
    timestamp_ms: Option<u64>,
}

/// Handles `count` messages
pub struct Count {
    ctx: Arc<HandlerContext>,
}

impl Count {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    async fn row(&self, msg: &ParsedMessage) -> Result<Row, Verdict> {
        let payload: CountPayload = self.ctx.decode(msg)?;
        let count = self.ctx.required(msg, "count", payload.count)?;
        let timestamp_ms = self.ctx.timestamp(msg, "timestamp_ms", payload.timestamp_ms)?;

        let asset_id = self.ctx.resolve_asset(msg).await?;

        Ok(Row::Count {
            asset_id,
            count,
            scrap: payload.scrap,
            timestamp_ms,
        })
    }
}

#[async_trait]
impl ProcessMessages for Count {
    async fn process_messages(&self, msg: &ParsedMessage) -> Verdict {
        match self.row(msg).await {
            Ok(row) => self.ctx.write(row).await,
            Err(verdict) => verdict,
        }
    }
}
