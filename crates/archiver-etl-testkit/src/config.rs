//! Static configuration service and endpoint directory

use archiver_etl::{ConfigError, ConfigService, EtlDest, EtlSource, PvTypeInfo, TierResolver};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Configuration service backed by a map
#[derive(Debug, Default)]
pub struct StaticConfigService {
    appliance: String,
    pvs: RwLock<BTreeMap<String, PvTypeInfo>>,
}

impl StaticConfigService {
    /// Service for `appliance`; `owned_pvs` lists PVs assigned to it
    pub fn new(appliance: impl Into<String>) -> Self {
        Self {
            appliance: appliance.into(),
            pvs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, info: PvTypeInfo) {
        self.pvs.write().insert(info.pv_name.clone(), info);
    }

    pub fn remove(&self, pv: &str) -> Option<PvTypeInfo> {
        self.pvs.write().remove(pv)
    }

    pub fn set_paused(&self, pv: &str, paused: bool) {
        if let Some(info) = self.pvs.write().get_mut(pv) {
            info.paused = paused;
        }
    }

    pub fn reassign(&self, pv: &str, appliance: impl Into<String>) {
        if let Some(info) = self.pvs.write().get_mut(pv) {
            info.appliance = appliance.into();
        }
    }
}

impl ConfigService for StaticConfigService {
    fn owned_pvs(&self) -> Vec<String> {
        self.pvs
            .read()
            .values()
            .filter(|info| info.appliance == self.appliance)
            .map(|info| info.pv_name.clone())
            .collect()
    }

    fn type_info(&self, pv: &str) -> Option<PvTypeInfo> {
        self.pvs.read().get(pv).cloned()
    }
}

/// Endpoint strings mapped to tier handles
#[derive(Default)]
pub struct TierDirectory {
    sources: RwLock<HashMap<String, Arc<dyn EtlSource>>>,
    dests: RwLock<HashMap<String, Arc<dyn EtlDest>>>,
}

impl std::fmt::Debug for TierDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sources: Vec<String> = self.sources.read().keys().cloned().collect();
        let mut dests: Vec<String> = self.dests.read().keys().cloned().collect();
        sources.sort();
        dests.sort();
        f.debug_struct("TierDirectory")
            .field("sources", &sources)
            .field("dests", &dests)
            .finish()
    }
}

impl TierDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tier usable on both sides of a transition
    pub fn register<T>(&self, endpoint: impl Into<String>, tier: Arc<T>)
    where
        T: EtlSource + EtlDest + 'static,
    {
        let endpoint = endpoint.into();
        self.sources
            .write()
            .insert(endpoint.clone(), Arc::clone(&tier) as Arc<dyn EtlSource>);
        self.dests.write().insert(endpoint, tier as Arc<dyn EtlDest>);
    }

    pub fn register_source(&self, endpoint: impl Into<String>, source: Arc<dyn EtlSource>) {
        self.sources.write().insert(endpoint.into(), source);
    }

    pub fn register_dest(&self, endpoint: impl Into<String>, dest: Arc<dyn EtlDest>) {
        self.dests.write().insert(endpoint.into(), dest);
    }
}

impl TierResolver for TierDirectory {
    fn resolve_source(&self, endpoint: &str) -> Result<Arc<dyn EtlSource>, ConfigError> {
        self.sources
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEndpoint(endpoint.to_string()))
    }

    fn resolve_dest(&self, endpoint: &str) -> Result<Arc<dyn EtlDest>, ConfigError> {
        self.dests
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownEndpoint(endpoint.to_string()))
    }
}
