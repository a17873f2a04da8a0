//! Distribution resource table: command templates per distribution.
//!
//! Keys are looked up in the `<dist>_<version>` table first, then `<dist>`,
//! then the shared defaults. A missing key means the feature is not
//! supported on that distribution.

use std::collections::HashMap;

use crate::model::{Component, DistInfo};

/// Command key probing the installed DRBD version.
pub const DRBD_CHECK_VERSION: &str = "DrbdCheck.version";
/// Command key probing the installed cluster stack packages.
pub const HB_CHECK_VERSION: &str = "HbCheck.version";
/// Command key printing `dist:`, `version:`, `arch:` and `kernel:` lines.
pub const DIST_DETECT_INFO: &str = "DistDetect.info";

/// Lookup of command templates by distribution.
pub trait DistResourceTable: Send + Sync {
    fn resolve(&self, dist: Option<&str>, version: Option<&str>, key: &str) -> Option<String>;

    fn resolve_for(&self, dist: &DistInfo, key: &str) -> Option<String> {
        self.resolve(dist.dist.as_deref(), dist.version.as_deref(), key)
    }
}

/// Key of the latest known version of a component.
pub fn latest_version_key(component: Component) -> String {
    format!("{}.latest", component.resource_prefix())
}

/// In-memory resource table, seeded with the built-in distribution data.
#[derive(Debug, Clone, Default)]
pub struct StaticResources {
    tables: HashMap<String, HashMap<String, String>>,
}

const DEFAULT_SCOPE: &str = "";

impl StaticResources {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut resources = Self::empty();
        for (scope, entries) in BUILTIN {
            for (key, value) in *entries {
                resources.insert(scope, *key, *value);
            }
        }
        resources
    }

    /// Set a key in a scope; an empty scope is the shared default table.
    pub fn insert(&mut self, scope: &str, key: impl Into<String>, value: impl Into<String>) {
        self.tables
            .entry(scope.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn with(mut self, scope: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(scope, key, value);
        self
    }

    fn lookup(&self, scope: &str, key: &str) -> Option<&String> {
        self.tables.get(scope).and_then(|table| table.get(key))
    }
}

impl DistResourceTable for StaticResources {
    fn resolve(&self, dist: Option<&str>, version: Option<&str>, key: &str) -> Option<String> {
        let mut scopes = Vec::with_capacity(3);
        if let (Some(dist), Some(version)) = (dist, version) {
            scopes.push(format!("{dist}_{version}"));
        }
        if let Some(dist) = dist {
            scopes.push(dist.to_string());
        }
        scopes.push(DEFAULT_SCOPE.to_string());
        scopes
            .iter()
            .find_map(|scope| self.lookup(scope, key))
            .cloned()
    }
}

type Entries = &'static [(&'static str, &'static str)];

const RPM_CLUSTER_VERSIONS: &str = "for p in hb:heartbeat pm:pacemaker cs:corosync ais:openais; do \
     v=$(rpm -q --qf '%{VERSION}' ${p#*:} 2>/dev/null) && echo ${p%%:*}:$v; done; true";

const DEB_CLUSTER_VERSIONS: &str = "for p in hb:heartbeat pm:pacemaker cs:corosync ais:openais; do \
     v=$(dpkg-query -W -f='${Version}' ${p#*:} 2>/dev/null) && v=${v#*:} && echo ${p%%:*}:${v%%-*}; done; true";

/// Prints os-release `ID`/`VERSION_ID`, falling back to `/etc/SuSE-release`
/// on releases that predate os-release.
const DIST_DETECT: &str = "echo arch:$(uname -m); echo kernel:$(uname -r); \
     if [ -r /etc/os-release ]; then . /etc/os-release; echo dist:$ID; echo version:$VERSION_ID; \
     elif [ -r /etc/SuSE-release ]; then \
     if grep -qi opensuse /etc/SuSE-release; then echo dist:opensuse; else echo dist:sles; fi; \
     sed -n 's/^VERSION *= */version:/p' /etc/SuSE-release; fi; true";

const BUILTIN: &[(&str, Entries)] = &[
    (
        DEFAULT_SCOPE,
        &[
            (
                DRBD_CHECK_VERSION,
                "/sbin/drbdadm help 2>/dev/null | grep 'Version: ' | sed 's/^Version: //' | sed 's/ .*//'",
            ),
            (HB_CHECK_VERSION, RPM_CLUSTER_VERSIONS),
            (DIST_DETECT_INFO, DIST_DETECT),
            ("DrbdInst.latest", "8.4.1"),
            ("HbPmInst.latest", "3.0.5"),
            ("PmInst.latest", "1.1.6"),
            ("DrbdInst.install.text.1", "LINBIT.com: packages"),
            ("DrbdInst.install.method.1", "vendor-repository"),
            (
                "DrbdInst.install.1",
                "/bin/mkdir -p /tmp/drbdinst && cd /tmp/drbdinst && \
                 /usr/bin/wget --http-user='@USER@' --http-passwd='@PASSWORD@' -N \
                 http://www.linbit.com/support/drbd-8.4/@DISTVERSION@/@ARCH@/drbd-km-@KERNELVERSION@.@ARCH@.rpm && \
                 /bin/rpm -Uvh /tmp/drbdinst/*.rpm",
            ),
            ("DrbdInst.install.text.2", "git/source: make && make install"),
            ("DrbdInst.install.method.2", "source"),
            (
                "DrbdInst.install.2",
                "/bin/mkdir -p /tmp/drbdinst && cd /tmp/drbdinst && \
                 /usr/bin/wget -N http://oss.linbit.com/drbd/drbd-latest.tar.gz && \
                 /bin/tar xfz drbd-latest.tar.gz && cd drbd-8* && \
                 ./configure --prefix=/usr --localstatedir=/var --sysconfdir=/etc --with-km && \
                 make && make install",
            ),
            ("HbPmInst.install.text.1", "clusterlabs repository: yum"),
            (
                "HbPmInst.install.1",
                "/usr/bin/yum -y install heartbeat pacemaker && /sbin/chkconfig --add heartbeat",
            ),
            ("PmInst.install.text.1", "clusterlabs repository: yum"),
            (
                "PmInst.install.1",
                "/usr/bin/yum -y install corosync pacemaker && /sbin/chkconfig --add corosync",
            ),
            ("PmInst.install.text.2", "clusterlabs staging: yum"),
            ("PmInst.install.staging.2", "true"),
            (
                "PmInst.install.2",
                "/usr/bin/yum -y --enablerepo=clusterlabs-next install corosync pacemaker \
                 && /sbin/chkconfig --add corosync",
            ),
        ],
    ),
    (
        "fedora",
        &[
            ("DrbdInst.install.text.3", "yum"),
            (
                "DrbdInst.install.3",
                "/usr/bin/yum -y install drbd-utils drbd-km-@KERNELVERSION@",
            ),
            ("HbPmInst.install.text.1", "http://download.opensuse.org: yum"),
            (
                "HbPmInst.install.1",
                "wget -N -nd -P /etc/yum.repos.d/ \
                 http://download.opensuse.org/repositories/server:/ha-clustering/Fedora_@DISTVERSION@/server:ha-clustering.repo \
                 && (/usr/sbin/groupadd haclient 2>/dev/null && /usr/sbin/useradd -g haclient hacluster 2>/dev/null; \
                 echo 'hacluster:@HBPASSWD@' | /usr/sbin/chpasswd; \
                 yum -y install heartbeat pacemaker && /sbin/chkconfig --add heartbeat)",
            ),
            ("HbPmInst.install.text.2", "yum"),
            ("HbPmInst.install.2", "/usr/bin/yum -y install heartbeat"),
        ],
    ),
    (
        "suse",
        &[
            ("DrbdInst.arch.i686", "i586"),
            ("DrbdInst.install.text.3", "zypper"),
            (
                "DrbdInst.install.3",
                "zypper -n --no-gpg-check install drbd drbd-kmp-default",
            ),
        ],
    ),
    (
        "suse_sles10",
        &[
            ("HbPmInst.latest", "2.1.4"),
            ("HbPmInst.install.text.1", "SLES 10: zypper"),
            (
                "HbPmInst.install.1",
                "zypper -n --no-gpg-check install heartbeat && chkconfig --add heartbeat",
            ),
        ],
    ),
    (
        "suse_OPENSUSE11_1",
        &[
            ("PmInst.install.text.1", "http://download.opensuse.org: zypper"),
            (
                "PmInst.install.1",
                "wget -N -nd -P /etc/zypp/repos.d/ \
                 http://download.opensuse.org/repositories/server:/ha-clustering/openSUSE_11.1/server:ha-clustering.repo \
                 && zypper -n --no-gpg-check install openais pacemaker && chkconfig --add openais",
            ),
            ("HbPmInst.install.text.1", "http://download.opensuse.org: zypper"),
            (
                "HbPmInst.install.1",
                "wget -N -nd -P /etc/zypp/repos.d/ \
                 http://download.opensuse.org/repositories/server:/ha-clustering/openSUSE_11.1/server:ha-clustering.repo \
                 && zypper -n --no-gpg-check install heartbeat pacemaker && chkconfig --add heartbeat",
            ),
        ],
    ),
    (
        "debian",
        &[
            (HB_CHECK_VERSION, DEB_CLUSTER_VERSIONS),
            ("DrbdInst.install.text.3", "apt-get"),
            (
                "DrbdInst.install.3",
                "apt-get -y -q install drbd8-utils drbd8-module-@KERNELVERSION@",
            ),
            ("HbPmInst.install.text.1", "apt-get"),
            (
                "HbPmInst.install.1",
                "apt-get -y -q -o 'DPkg::Options::=--force-confnew' install heartbeat pacemaker",
            ),
            ("PmInst.install.text.1", "apt-get"),
            (
                "PmInst.install.1",
                "apt-get -y -q -o 'DPkg::Options::=--force-confnew' install corosync pacemaker",
            ),
        ],
    ),
];
