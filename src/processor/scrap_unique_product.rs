//! Scrap handler: marks a previously recorded unique product as scrap

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{HandlerContext, ParsedMessage, ProcessMessages, Verdict};
use crate::store::Row;

#[derive(Debug, Deserialize)]
struct ScrapPayload {
    #[serde(rename = "UID")]
    uid: Option<String>,
}

/// Handles `scrapUniqueProduct` messages
pub struct ScrapUniqueProduct {
    ctx: Arc<HandlerContext>,
}

impl ScrapUniqueProduct {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    async fn row(&self, msg: &ParsedMessage) -> Result<Row, Verdict> {
        let payload: ScrapPayload = self.ctx.decode(msg)?;
        let uid = self.ctx.required(msg, "UID", payload.uid)?;
        if uid.is_empty() {
            return Err(self.ctx.invalid(msg, "empty UID".to_string()));
        }

        let asset_id = self.ctx.resolve_asset(msg).await?;

        Ok(Row::ScrapUniqueProduct {
            asset_id,
            alternative_id: uid,
        })
    }
}

#[async_trait]
impl ProcessMessages for ScrapUniqueProduct {
    async fn process_messages(&self, msg: &ParsedMessage) -> Verdict {
        match self.row(msg).await {
            Ok(row) => self.ctx.write(row).await,
            Err(verdict) => verdict,
        }
    }
}
