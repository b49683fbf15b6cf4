// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::fleet::{FleetError, FleetSelector};
use crate::domain::rotator_config::HostConfig;

/// Source of truth for which hosts a selector currently covers
#[async_trait]
pub trait FleetInventory: Send + Sync {
    async fn resolve(&self, selector: &FleetSelector) -> Result<Vec<String>, FleetError>;
}

/// Host list from configuration. `replace` swaps the list in place, so a
/// long-running process can pick up fleet changes between steps.
#[derive(Clone, Default)]
pub struct StaticInventory {
    hosts: Arc<RwLock<Vec<HostConfig>>>,
}

impl StaticInventory {
    pub fn new(hosts: Vec<HostConfig>) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(hosts)),
        }
    }

    pub fn replace(&self, hosts: Vec<HostConfig>) {
        *self.hosts.write() = hosts;
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}

#[async_trait]
impl FleetInventory for StaticInventory {
    async fn resolve(&self, selector: &FleetSelector) -> Result<Vec<String>, FleetError> {
        if selector.tag_key.is_empty() {
            return Err(FleetError::Inventory("selector has no tag key".to_string()));
        }

        let hosts = self.hosts.read();
        let mut seen = HashSet::new();
        Ok(hosts
            .iter()
            .filter(|host| selector.matches(&host.tags))
            .filter(|host| seen.insert(host.address.clone()))
            .map(|host| host.address.clone())
            .collect())
    }
}
