//! API resource discovery and priority ordering
//!
//! Enumerates every group/version/resource the API server exposes and
//! caches them for the pipelines. The server refreshes the cache every
//! five minutes. Two operations matter to callers: resolving a
//! possibly-partial resource name to one canonical group-resource, and
//! listing all known resources with the user-configured priorities first.

use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use parking_lot::RwLock;

use crate::{Error, Result};

/// One resource the API server serves, at its preferred version
#[derive(Clone, Debug)]
pub struct DiscoveredResource {
    /// Type information for building dynamic clients
    pub api_resource: ApiResource,
    /// Whether instances live inside namespaces
    pub namespaced: bool,
}

impl DiscoveredResource {
    /// Canonical `resource.group` key (bare resource for the core group)
    pub fn group_resource(&self) -> String {
        group_resource_key(&self.api_resource.plural, &self.api_resource.group)
    }
}

/// Format a `resource.group` key the way archives and filters expect
pub fn group_resource_key(plural: &str, group: &str) -> String {
    if group.is_empty() {
        plural.to_string()
    } else {
        format!("{plural}.{group}")
    }
}

/// Cached view of the API server's served resources
pub struct DiscoveryHelper {
    client: Option<Client>,
    resources: RwLock<Vec<DiscoveredResource>>,
}

impl DiscoveryHelper {
    /// Run an initial discovery pass against the server
    pub async fn new(client: Client) -> Result<Self> {
        let helper = Self {
            client: Some(client),
            resources: RwLock::new(Vec::new()),
        };
        helper.refresh().await?;
        Ok(helper)
    }

    /// Build a helper over a fixed resource list (no server round-trips)
    pub fn from_resources(resources: Vec<DiscoveredResource>) -> Self {
        Self {
            client: None,
            resources: RwLock::new(resources),
        }
    }

    /// Re-run discovery and swap the cache
    pub async fn refresh(&self) -> Result<()> {
        let Some(client) = self.client.clone() else {
            return Ok(());
        };

        let discovery = Discovery::new(client).run().await?;
        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                // Subresources arrive as `pods/status`; the pipelines only
                // ever walk top-level resources.
                if ar.plural.contains('/') {
                    continue;
                }
                resources.push(DiscoveredResource {
                    namespaced: caps.scope == Scope::Namespaced,
                    api_resource: ar,
                });
            }
        }
        *self.resources.write() = resources;
        Ok(())
    }

    /// Snapshot of every known resource, unordered
    pub fn resources(&self) -> Vec<DiscoveredResource> {
        self.resources.read().clone()
    }

    /// Resolve a possibly-partial name to a single resource.
    ///
    /// Accepts a bare plural (`deployments`), a kind in any casing
    /// (`Deployment`), or a fully-qualified `resource.group`
    /// (`deployments.apps`). A name served by more than one group is an
    /// error unless fully qualified.
    pub fn resource_for(&self, name: &str) -> Result<DiscoveredResource> {
        let resources = self.resources.read();

        let qualified: Vec<&DiscoveredResource> = resources
            .iter()
            .filter(|r| r.group_resource() == name)
            .collect();
        if let [only] = qualified.as_slice() {
            return Ok((*only).clone());
        }

        let lower = name.to_lowercase();
        let matches: Vec<&DiscoveredResource> = resources
            .iter()
            .filter(|r| r.api_resource.plural == lower || r.api_resource.kind.to_lowercase() == lower)
            .collect();

        match matches.as_slice() {
            [] => Err(Error::UnknownResource(name.to_string())),
            [only] => Ok((*only).clone()),
            many => Err(Error::AmbiguousResource(
                name.to_string(),
                many.iter()
                    .map(|r| r.group_resource())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// All known resources with the priority list leading.
    ///
    /// Priorities are resolved through [`Self::resource_for`]; entries that
    /// fail to resolve are skipped. The remainder follows in ascending
    /// group-resource order.
    pub fn sorted_resources(&self, priorities: &[String]) -> Vec<DiscoveredResource> {
        let mut remainder = self.resources();
        remainder.sort_by_key(|r| r.group_resource());

        let mut ordered = Vec::with_capacity(remainder.len());
        for priority in priorities {
            let Ok(resolved) = self.resource_for(priority) else {
                continue;
            };
            let key = resolved.group_resource();
            if let Some(pos) = remainder.iter().position(|r| r.group_resource() == key) {
                ordered.push(remainder.remove(pos));
            }
        }
        ordered.extend(remainder);
        ordered
    }
}
