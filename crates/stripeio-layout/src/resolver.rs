//! Layout and pool lookup used by the client engine

use crate::geometry::StripeLayout;
use crate::pool::PoolVersion;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use stripeio_common::{
    Config, Error, LayoutId, PoolVersionId, Result, ServiceId, ServiceKind, TargetAddr, TargetId,
};

/// A remote service the client keeps a context for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub kind: ServiceKind,
}

/// Source of layouts, pool versions and service endpoints
pub trait LayoutResolver: Send + Sync {
    /// Geometry of a layout id
    fn layout(&self, id: LayoutId) -> Result<StripeLayout>;

    /// Pool version new IO is placed in
    fn pool_version(&self) -> Result<Arc<PoolVersion>>;

    /// Layout new objects are created with
    fn default_layout_id(&self) -> LayoutId;

    /// Every service the client talks to
    fn services(&self) -> Vec<ServiceInfo>;

    /// Service that owns object and realm metadata
    fn metadata_service(&self) -> Option<ServiceId> {
        self.services()
            .into_iter()
            .find(|s| s.kind == ServiceKind::Metadata)
            .map(|s| s.id)
    }
}

/// Layouts and one pool version fixed at startup
pub struct StaticPools {
    layouts: RwLock<HashMap<LayoutId, StripeLayout>>,
    pool: Arc<PoolVersion>,
    services: Vec<ServiceInfo>,
    default_layout: LayoutId,
}

impl StaticPools {
    /// Service id of the metadata service in pools built from a [`Config`]
    pub const METADATA_SERVICE: ServiceId = ServiceId::new(0);

    #[must_use]
    pub fn new(pool: PoolVersion, services: Vec<ServiceInfo>, default_layout: LayoutId) -> Self {
        Self {
            layouts: RwLock::new(HashMap::new()),
            pool: Arc::new(pool),
            services,
            default_layout,
        }
    }

    /// Build the default layout and a pool of `pool_width` targets
    ///
    /// Target `i` is served by IO service `1 + i / targets_per_service`;
    /// service 0 is the metadata service.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let l = &config.layout;
        let targets: Vec<TargetAddr> = (0..l.pool_width)
            .map(|i| TargetAddr {
                target: TargetId::new(i),
                service: ServiceId::new(1 + i / l.targets_per_service),
            })
            .collect();
        let pool = PoolVersion::new(PoolVersionId::new(1), targets, l.tolerance);

        let mut services = vec![ServiceInfo {
            id: Self::METADATA_SERVICE,
            kind: ServiceKind::Metadata,
        }];
        services.extend(pool.services().into_iter().map(|id| ServiceInfo {
            id,
            kind: ServiceKind::Io,
        }));

        let default_layout = LayoutId::new(config.client.default_layout);
        let pools = Self::new(pool, services, default_layout);
        pools.add_layout(StripeLayout::new(
            default_layout,
            l.unit_size,
            l.data_units,
            l.parity_units,
        ));
        pools
    }

    pub fn add_layout(&self, layout: StripeLayout) {
        self.layouts.write().insert(layout.id, layout);
    }
}

impl LayoutResolver for StaticPools {
    fn layout(&self, id: LayoutId) -> Result<StripeLayout> {
        self.layouts
            .read()
            .get(&id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("{id}")))
    }

    fn default_layout_id(&self) -> LayoutId {
        self.default_layout
    }

    fn pool_version(&self) -> Result<Arc<PoolVersion>> {
        Ok(Arc::clone(&self.pool))
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.services.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.layout.pool_width = 8;
        config.layout.targets_per_service = 2;
        let pools = StaticPools::from_config(&config);

        assert_eq!(pools.default_layout_id(), LayoutId::new(1));
        let layout = pools.layout(pools.default_layout_id()).unwrap();
        assert_eq!(layout.data_units, 4);
        assert_eq!(layout.parity_units, 2);

        let pool = pools.pool_version().unwrap();
        assert_eq!(pool.width(), 8);
        assert_eq!(pool.services().len(), 4);
        assert_eq!(pools.services().len(), 5);
        assert_eq!(pools.metadata_service(), Some(StaticPools::METADATA_SERVICE));
    }

    #[test]
    fn test_unknown_layout() {
        let pools = StaticPools::from_config(&Config::default());
        assert!(pools.layout(LayoutId::new(99)).unwrap_err().is_not_found());
    }
}
