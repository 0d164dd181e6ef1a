// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Process-wide catalog of named transport instances and configurations.
//!
//! The registry is an explicitly constructed object with a lifecycle owned
//! by the process's top-level orchestrator -- it is passed by reference
//! into `enable_transport`, never reached through a lazily initialized
//! global. It maps:
//!
//! - instance name -> [`TransportInst`] (the description)
//! - config name   -> [`TransportConfig`] (an ordered group of instances)
//! - entity name   -> config (per-entity bindings, resolved nearest-first)
//!
//! and creates/caches the live [`Transport`] objects on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;

use crate::config::{InstConfig, TransportInst};
use crate::error::{Result, TransportError};
use crate::transport::{
    MulticastTransport, RtpsUdpTransport, TcpTransport, Transport, UdpTransport,
};

// ============================================================================
// TransportConfig
// ============================================================================

/// A named, ordered group of transport instances.
///
/// Order matters: `associate` tries instances front to back, so the
/// preferred transport goes first.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Registry-unique config name.
    pub name: String,

    /// Instances in preference order.
    pub insts: Vec<Arc<TransportInst>>,
}

// ============================================================================
// TransportRegistry
// ============================================================================

/// Catalog of instances, configs, bindings, and live transports.
pub struct TransportRegistry {
    insts: DashMap<String, Arc<TransportInst>>,
    configs: DashMap<String, Arc<TransportConfig>>,
    bindings: DashMap<String, Arc<TransportConfig>>,
    global: ArcSwapOption<TransportConfig>,
    instances: DashMap<String, Arc<dyn Transport>>,
    shut_down: AtomicBool,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            insts: DashMap::new(),
            configs: DashMap::new(),
            bindings: DashMap::new(),
            global: ArcSwapOption::empty(),
            instances: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Instance and config catalog
    // ========================================================================

    /// Register a named instance description.
    pub fn register_inst(&self, inst: TransportInst) -> Result<Arc<TransportInst>> {
        let inst = Arc::new(inst);
        match self.insts.entry(inst.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::Duplicate(format!(
                "transport instance '{}'",
                inst.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&inst));
                log::debug!("[REGISTRY] instance '{}' ({})", inst.name, inst.kind());
                Ok(inst)
            }
        }
    }

    /// Look up an instance by name.
    pub fn get_inst(&self, name: &str) -> Result<Arc<TransportInst>> {
        self.insts
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NotFound(format!("transport instance '{}'", name)))
    }

    /// Create a named config from previously registered instance names.
    pub fn create_config(&self, name: &str, inst_names: &[&str]) -> Result<Arc<TransportConfig>> {
        let mut insts = Vec::with_capacity(inst_names.len());
        for inst_name in inst_names {
            insts.push(self.get_inst(inst_name)?);
        }

        let config = Arc::new(TransportConfig {
            name: name.to_string(),
            insts,
        });
        match self.configs.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransportError::Duplicate(format!(
                "transport config '{}'",
                name
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&config));
                log::debug!("[REGISTRY] config '{}' ({} instances)", name, config.insts.len());
                Ok(config)
            }
        }
    }

    /// Look up a config by name.
    pub fn get_config(&self, name: &str) -> Result<Arc<TransportConfig>> {
        self.configs
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NotFound(format!("transport config '{}'", name)))
    }

    // ========================================================================
    // Bindings and resolution
    // ========================================================================

    /// Bind an entity name (writer, publisher, participant) to a config.
    pub fn bind(&self, entity_name: &str, config_name: &str) -> Result<()> {
        let config = self.get_config(config_name)?;
        self.bindings.insert(entity_name.to_string(), config);
        Ok(())
    }

    /// Set the process-wide fallback config.
    pub fn set_global_config(&self, config_name: &str) -> Result<()> {
        let config = self.get_config(config_name)?;
        self.global.store(Some(config));
        Ok(())
    }

    /// Resolve the nearest configured ancestor.
    ///
    /// `chain` lists entity names nearest-first (writer, publisher,
    /// participant); the first bound name wins, then the global fallback.
    pub fn resolve(&self, chain: &[&str]) -> Option<Arc<TransportConfig>> {
        for name in chain {
            if let Some(entry) = self.bindings.get(*name) {
                return Some(Arc::clone(entry.value()));
            }
        }
        self.global.load_full()
    }

    // ========================================================================
    // Live transports
    // ========================================================================

    /// The live transport for an instance, created on first use.
    pub fn instance(&self, inst: &Arc<TransportInst>) -> Result<Arc<dyn Transport>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::MiscProblem("registry is shut down".into()));
        }
        if let Some(existing) = self.instances.get(&inst.name) {
            return Ok(Arc::clone(existing.value()));
        }

        let created = create_transport(inst)?;
        // A concurrent creator may have won; keep the first one bound and
        // tear ours down.
        match self.instances.entry(inst.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                created.shutdown();
                Ok(Arc::clone(entry.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&created));
                Ok(created)
            }
        }
    }

    /// Number of live transports.
    pub fn live_count(&self) -> usize {
        self.instances.len()
    }

    /// Shut down every live transport and refuse further creation.
    ///
    /// Idempotent; the catalog of descriptions survives for inspection.
    pub fn shutdown_all(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let live: Vec<Arc<dyn Transport>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.instances.clear();
        for transport in live {
            transport.shutdown();
        }
        log::debug!("[REGISTRY] shut down");
    }
}

/// Factory: build the concrete transport for an instance description.
fn create_transport(inst: &TransportInst) -> Result<Arc<dyn Transport>> {
    match &inst.config {
        InstConfig::Tcp(_) => Ok(TcpTransport::new(inst)?),
        InstConfig::Udp(_) => Ok(UdpTransport::new(inst)?),
        InstConfig::Multicast(_) => Ok(MulticastTransport::new(inst)?),
        InstConfig::RtpsUdp(_) => Ok(RtpsUdpTransport::new(inst)?),
        #[cfg(target_os = "linux")]
        InstConfig::Shmem(_) => Ok(crate::transport::ShmemTransport::new(inst)?),
        #[cfg(not(target_os = "linux"))]
        InstConfig::Shmem(_) => Err(TransportError::UnableToCreate(format!(
            "shared-memory transport '{}' is only available on Linux",
            inst.name
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpInst;
    use std::net::SocketAddr;

    fn udp_inst(name: &str) -> TransportInst {
        TransportInst::new(
            name,
            InstConfig::Udp(UdpInst {
                local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_duplicate_inst_rejected() {
        let registry = TransportRegistry::new();
        registry.register_inst(udp_inst("u1")).unwrap();

        let err = registry.register_inst(udp_inst("u1")).unwrap_err();
        assert!(matches!(err, TransportError::Duplicate(_)));
    }

    #[test]
    fn test_config_requires_known_insts() {
        let registry = TransportRegistry::new();
        registry.register_inst(udp_inst("u1")).unwrap();

        let err = registry.create_config("c1", &["u1", "ghost"]).unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));

        registry.create_config("c1", &["u1"]).unwrap();
        let err = registry.create_config("c1", &["u1"]).unwrap_err();
        assert!(matches!(err, TransportError::Duplicate(_)));
    }

    #[test]
    fn test_resolution_nearest_first_then_global() {
        let registry = TransportRegistry::new();
        registry.register_inst(udp_inst("u1")).unwrap();
        registry.register_inst(udp_inst("u2")).unwrap();
        registry.create_config("pub_cfg", &["u1"]).unwrap();
        registry.create_config("global_cfg", &["u2"]).unwrap();

        // Nothing bound, no global: unresolved.
        assert!(registry.resolve(&["writer1", "pub1", "part1"]).is_none());

        registry.set_global_config("global_cfg").unwrap();
        let resolved = registry.resolve(&["writer1", "pub1", "part1"]).unwrap();
        assert_eq!(resolved.name, "global_cfg");

        // A binding on the publisher beats the global fallback.
        registry.bind("pub1", "pub_cfg").unwrap();
        let resolved = registry.resolve(&["writer1", "pub1", "part1"]).unwrap();
        assert_eq!(resolved.name, "pub_cfg");

        // A nearer binding wins over a farther one.
        registry.create_config("writer_cfg", &["u2"]).unwrap();
        registry.bind("writer1", "writer_cfg").unwrap();
        let resolved = registry.resolve(&["writer1", "pub1", "part1"]).unwrap();
        assert_eq!(resolved.name, "writer_cfg");
    }

    #[test]
    fn test_instance_created_once() {
        let registry = TransportRegistry::new();
        let inst = registry.register_inst(udp_inst("u1")).unwrap();

        let a = registry.instance(&inst).unwrap();
        let b = registry.instance(&inst).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_count(), 1);

        registry.shutdown_all();
        assert_eq!(registry.live_count(), 0);
        assert!(registry.instance(&inst).is_err());
    }

    #[test]
    fn test_shutdown_idempotent() {
        let registry = TransportRegistry::new();
        registry.shutdown_all();
        registry.shutdown_all();
    }
}
