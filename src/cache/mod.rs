//! Identifier Resolution Cache
//!
//! Cache-aside lookup of surrogate asset and product ids. Ids are never
//! reassigned, so entries stay valid until the cache is cleared. A store miss
//! is reported as unresolved and is not cached: the asset may be registered
//! later and the next lookup must see it.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::metrics::Metrics;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssetKey {
    customer_id: String,
    location: String,
    asset_id: String,
}

/// Concurrent id cache in front of a [`Store`]
pub struct IdResolver {
    store: Arc<dyn Store>,
    assets: DashMap<AssetKey, u32>,
    products: DashMap<(String, u32), u32>,
    metrics: Arc<Metrics>,
}

impl IdResolver {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            assets: DashMap::new(),
            products: DashMap::new(),
            metrics,
        }
    }

    /// Resolve an asset's surrogate id.
    ///
    /// `Ok(None)` when the asset is not registered.
    pub async fn resolve_asset_id(
        &self,
        customer_id: &str,
        location: &str,
        asset_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        let key = AssetKey {
            customer_id: customer_id.to_string(),
            location: location.to_string(),
            asset_id: asset_id.to_string(),
        };

        if let Some(id) = self.assets.get(&key) {
            self.metrics.cache_lookup("asset", true);
            return Ok(Some(*id));
        }
        self.metrics.cache_lookup("asset", false);

        let resolved = self
            .store
            .asset_id(customer_id, location, asset_id)
            .await?;
        if let Some(id) = resolved {
            trace!("Cached asset {}/{}/{} -> {}", customer_id, location, asset_id, id);
            self.assets.insert(key, id);
        }
        Ok(resolved)
    }

    /// Resolve a product's surrogate id on an asset.
    ///
    /// `Ok(None)` when the product is not registered.
    pub async fn resolve_product_id(
        &self,
        product: &str,
        asset_id: u32,
    ) -> Result<Option<u32>, StoreError> {
        let key = (product.to_string(), asset_id);

        if let Some(id) = self.products.get(&key) {
            self.metrics.cache_lookup("product", true);
            return Ok(Some(*id));
        }
        self.metrics.cache_lookup("product", false);

        let resolved = self.store.product_id(product, asset_id).await?;
        if let Some(id) = resolved {
            self.products.insert(key, id);
        }
        Ok(resolved)
    }

    /// Number of cached entries (assets, products)
    pub fn cached(&self) -> (usize, usize) {
        (self.assets.len(), self.products.len())
    }

    pub fn clear(&self) {
        self.assets.clear();
        self.products.clear();
    }
}
