use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::payment::{LoggingGateway, PaymentGateway};
use crate::reaper;

/// File stem of a tenant's WAL: the name itself, which must be ASCII letters, digits,
/// `_` or `-`. Anything else is refused so two databases never share one log.
pub fn wal_stem(tenant: &str) -> std::io::Result<&str> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string());
    if tenant.is_empty() {
        return Err(invalid("empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(invalid("tenant name too long"));
    }
    if let Some(c) = tenant
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(&format!("tenant name may not contain {c:?}")));
    }
    Ok(tenant)
}

/// Per-tenant engines, keyed by the database name of the pgwire connection.
/// Each tenant owns its engine, WAL, reaper and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    payment_grace: Ms,
    payments: Arc<dyn PaymentGateway>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, payment_grace: Ms) -> Self {
        Self::with_gateway(data_dir, compact_threshold, payment_grace, Arc::new(LoggingGateway))
    }

    pub fn with_gateway(
        data_dir: PathBuf,
        compact_threshold: u64,
        payment_grace: Ms,
        payments: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            payment_grace,
            payments,
        }
    }

    /// Get or lazily create the engine for `tenant`.
    ///
    /// Creation happens under the map's entry lock, so concurrent first connections to
    /// one tenant all receive the same engine and only one replays its WAL.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_stem(tenant)?;
        // Counted outside the entry lock; `len` takes every shard.
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let engine = Arc::new(Engine::new(
                    self.data_dir.join(format!("{stem}.wal")),
                    Arc::new(NotifyHub::new()),
                    self.payments.clone(),
                    self.payment_grace,
                )?);
                tokio::spawn(reaper::run_reaper(engine.clone()));
                tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                engine
            }
        };
        tracing::info!(tenant = %stem, "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
