//! Host, cluster, and component types shared by the orchestration core.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Software tracked for install status on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// DRBD storage replication module and utilities.
    Drbd,
    /// Heartbeat with Pacemaker.
    HbPm,
    /// Corosync or OpenAIS with Pacemaker.
    Pm,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Drbd, Component::HbPm, Component::Pm];

    pub fn label(self) -> &'static str {
        match self {
            Component::Drbd => "DRBD",
            Component::HbPm => "Pcmk/Heartbeat",
            Component::Pm => "Pcmk/Corosync",
        }
    }

    /// Prefix of the distribution resource keys describing install methods.
    pub fn resource_prefix(self) -> &'static str {
        match self {
            Component::Drbd => "DrbdInst",
            Component::HbPm => "HbPmInst",
            Component::Pm => "PmInst",
        }
    }

    pub fn is_cluster_stack(self) -> bool {
        !matches!(self, Component::Drbd)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Connectivity {
    #[default]
    Disconnected,
    Connected,
    Failed,
}

/// Distribution metadata used to pick command templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistInfo {
    /// Distribution family, e.g. `suse`, `fedora`, `debian`.
    pub dist: Option<String>,
    /// Distribution release, e.g. `sles10` or `OPENSUSE11_1`.
    pub version: Option<String>,
    pub arch: Option<String>,
    pub kernel: Option<String>,
}

impl DistInfo {
    pub fn new(dist: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            dist: Some(dist.into()),
            version: Some(version.into()),
            arch: None,
            kernel: None,
        }
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Fill fields that are still unknown from a detected snapshot.
    pub fn merge_missing(&mut self, detected: DistInfo) {
        if self.dist.is_none() {
            self.dist = detected.dist;
        }
        if self.version.is_none() {
            self.version = detected.version;
        }
        if self.arch.is_none() {
            self.arch = detected.arch;
        }
        if self.kernel.is_none() {
            self.kernel = detected.kernel;
        }
    }
}

/// Versions detected on a host by the probe steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstalledVersions {
    pub drbd: Option<String>,
    pub drbd_utils: Option<String>,
    pub heartbeat: Option<String>,
    pub pacemaker: Option<String>,
    pub corosync: Option<String>,
    pub openais: Option<String>,
}

impl InstalledVersions {
    pub fn clear_cluster_stack(&mut self) {
        self.heartbeat = None;
        self.pacemaker = None;
        self.corosync = None;
        self.openais = None;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One remote machine managed by the wizard.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub addresses: Vec<String>,
    pub user: String,
    pub port: u16,
    pub dist: DistInfo,
    pub versions: InstalledVersions,
    /// Install method index last used per component.
    pub install_methods: BTreeMap<Component, usize>,
    pub connectivity: Connectivity,
    /// Name of the cluster this host belongs to.
    pub cluster: Option<String>,
    pub last_probe: Option<DateTime<Utc>>,
}

impl Host {
    pub const DEFAULT_USER: &'static str = "root";
    pub const DEFAULT_PORT: u16 = 22;

    pub fn new(id: HostId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            addresses: vec![address.into()],
            user: Self::DEFAULT_USER.to_string(),
            port: Self::DEFAULT_PORT,
            dist: DistInfo::default(),
            versions: InstalledVersions::default(),
            install_methods: BTreeMap::new(),
            connectivity: Connectivity::Disconnected,
            cluster: None,
            last_probe: None,
        }
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    /// Keep the entered address first and append what it resolved to.
    pub fn record_resolved(&mut self, resolved: Vec<String>) {
        let mut addresses: Vec<String> = self.addresses.first().cloned().into_iter().collect();
        for address in resolved {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
        self.addresses = addresses;
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }

    pub fn remembered_method(&self, component: Component) -> Option<usize> {
        self.install_methods.get(&component).copied()
    }

    pub fn dist_version(&self) -> Option<&str> {
        self.dist.version.as_deref()
    }

    /// Owned connection details handed to executor tasks.
    pub fn target(&self) -> HostTarget {
        HostTarget {
            id: self.id,
            name: self.name.clone(),
            address: self
                .primary_address()
                .unwrap_or(self.name.as_str())
                .to_string(),
            user: self.user.clone(),
            port: self.port,
        }
    }
}

/// Connection details of a host, detached from the mutable host record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub user: String,
    pub port: u16,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("{host} already belongs to cluster {cluster}")]
    AlreadyMember { host: HostId, cluster: String },
}

/// Named set of hosts sharing the `hacluster` account password.
#[derive(Clone)]
pub struct Cluster {
    name: String,
    hb_passwd: String,
    hosts: IndexSet<HostId>,
}

impl Cluster {
    pub const DEFAULT_HB_PASSWD: &'static str = "hacluster";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hb_passwd: Self::DEFAULT_HB_PASSWD.to_string(),
            hosts: IndexSet::new(),
        }
    }

    pub fn with_hb_passwd(mut self, passwd: impl Into<String>) -> Self {
        self.hb_passwd = passwd.into();
        self
    }

    /// Password set for the `hacluster` account by cluster stack installs.
    pub fn hb_passwd(&self) -> &str {
        &self.hb_passwd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a host, returning whether it was newly added.
    ///
    /// A host that belongs to another cluster is rejected.
    pub fn add_host(&mut self, host: &mut Host) -> Result<bool, MembershipError> {
        if let Some(other) = host.cluster.as_deref() {
            if other != self.name {
                return Err(MembershipError::AlreadyMember {
                    host: host.id,
                    cluster: other.to_string(),
                });
            }
        }
        host.cluster = Some(self.name.clone());
        Ok(self.hosts.insert(host.id))
    }

    pub fn remove_host(&mut self, host: &mut Host) -> bool {
        if host.cluster.as_deref() == Some(self.name.as_str()) {
            host.cluster = None;
        }
        self.hosts.shift_remove(&host.id)
    }

    pub fn contains(&self, id: HostId) -> bool {
        self.hosts.contains(&id)
    }

    pub fn host_ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("hb_passwd", &"<redacted>")
            .field("hosts", &self.hosts)
            .finish()
    }
}
