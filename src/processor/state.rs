//! State handler: machine state changes

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{HandlerContext, ParsedMessage, ProcessMessages, Verdict};
use crate::store::Row;

#[derive(Debug, Deserialize)]
struct StatePayload {
    timestamp_ms: Option<u64>,
    state: Option<u32>,
}

/// Handles `state` messages
pub struct State {
    ctx: Arc<HandlerContext>,
}

impl State {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    async fn row(&self, msg: &ParsedMessage) -> Result<Row, Verdict> {
        let payload: StatePayload = self.ctx.decode(msg)?;
        let timestamp_ms = self.ctx.timestamp(msg, "timestamp_ms", payload.timestamp_ms)?;
        let state = self.ctx.required(msg, "state", payload.state)?;

        let asset_id = self.ctx.resolve_asset(msg).await?;

        Ok(Row::State {
            asset_id,
            timestamp_ms,
            state,
        })
    }
}

#[async_trait]
impl ProcessMessages for State {
    async fn process_messages(&self, msg: &ParsedMessage) -> Verdict {
        match self.row(msg).await {
            Ok(row) => self.ctx.write(row).await,
            Err(verdict) => verdict,
        }
    }
}
