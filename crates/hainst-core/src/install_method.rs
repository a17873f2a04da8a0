//! Install method enumeration and default selection.
//!
//! Methods come from the resource table keys `<Prefix>.install.text.<n>`,
//! numbered from 1 without gaps. `<Prefix>.install.method.<n>` tags the
//! method and `<Prefix>.install.staging.<n>` marks it staging-only.

use serde::Serialize;

use crate::dist::DistResourceTable;
use crate::model::{Component, DistInfo};

const MAX_METHODS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodKind {
    PackageManager,
    VendorRepository,
    Source,
}

impl MethodKind {
    fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(str::trim) {
            Some("source") => Self::Source,
            Some("linbit") | Some("vendor-repository") => Self::VendorRepository,
            _ => Self::PackageManager,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::PackageManager => "package-manager",
            Self::VendorRepository => "vendor-repository",
            Self::Source => "source",
        }
    }
}

/// One distribution-scoped way of installing a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallMethod {
    index: usize,
    label: String,
    kind: MethodKind,
    staging: bool,
}

impl InstallMethod {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_staging(&self) -> bool {
        self.staging
    }

    /// Vendor repositories need the vendor download credentials.
    pub fn uses_vendor_repository(&self) -> bool {
        self.kind == MethodKind::VendorRepository
    }

    pub fn builds_from_source(&self) -> bool {
        self.kind == MethodKind::Source
    }

    /// Resource key of the install command for this method.
    pub fn command_key(&self, component: Component) -> String {
        format!("{}.install.{}", component.resource_prefix(), self.index)
    }
}

/// Inputs to method selection.
#[derive(Debug, Clone, Copy)]
pub struct MethodQuery<'a> {
    pub component: Component,
    pub dist: &'a DistInfo,
    pub staging: bool,
    pub remembered: Option<usize>,
}

/// Applicable methods in resource order plus the default pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodChoice {
    pub methods: Vec<InstallMethod>,
    default: Option<usize>,
}

impl MethodChoice {
    pub fn default_method(&self) -> Option<&InstallMethod> {
        self.default.and_then(|position| self.methods.get(position))
    }

    pub fn find(&self, index: usize) -> Option<&InstallMethod> {
        self.methods.iter().find(|method| method.index == index)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

pub fn select_methods(resources: &dyn DistResourceTable, query: &MethodQuery<'_>) -> MethodChoice {
    let prefix = query.component.resource_prefix();
    let mut methods = Vec::new();
    for index in 1..=MAX_METHODS {
        let Some(label) = resources.resolve_for(query.dist, &format!("{prefix}.install.text.{index}"))
        else {
            break;
        };
        let staging = resources
            .resolve_for(query.dist, &format!("{prefix}.install.staging.{index}"))
            .is_some_and(|value| value.trim() == "true");
        if staging && !query.staging {
            continue;
        }
        let tag = resources.resolve_for(query.dist, &format!("{prefix}.install.method.{index}"));
        methods.push(InstallMethod {
            index,
            label,
            kind: MethodKind::from_tag(tag.as_deref()),
            staging,
        });
    }

    let default = query
        .remembered
        .and_then(|remembered| methods.iter().position(|method| method.index == remembered))
        .or(if methods.is_empty() { None } else { Some(0) });

    MethodChoice { methods, default }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::StaticResources;

    fn resources() -> StaticResources {
        StaticResources::empty()
            .with("", "PmInst.install.text.1", "zypper")
            .with("", "PmInst.install.text.2", "staging repo")
            .with("", "PmInst.install.staging.2", "true")
            .with("", "PmInst.install.text.3", "source build")
            .with("", "PmInst.install.method.3", "source")
            .with("", "PmInst.install.text.5", "after a gap")
            .with("debian", "PmInst.install.text.1", "apt-get")
    }

    #[test]
    fn staging_methods_are_hidden_unless_enabled() {
        let dist = DistInfo::new("suse", "sles11");
        let table = resources();
        let mut query = MethodQuery {
            component: Component::Pm,
            dist: &dist,
            staging: false,
            remembered: None,
        };

        let choice = select_methods(&table, &query);
        let indexes: Vec<usize> = choice.methods.iter().map(InstallMethod::index).collect();
        assert_eq!(indexes, vec![1, 3]);
        assert_eq!(choice.default_method().map(InstallMethod::index), Some(1));
        assert!(choice.find(3).is_some_and(InstallMethod::builds_from_source));

        query.staging = true;
        let choice = select_methods(&table, &query);
        let indexes: Vec<usize> = choice.methods.iter().map(InstallMethod::index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert!(choice.find(2).is_some_and(InstallMethod::is_staging));
    }

    #[test]
    fn remembered_method_wins_only_when_applicable() {
        let dist = DistInfo::new("debian", "6");
        let table = resources();
        let query = MethodQuery {
            component: Component::Pm,
            dist: &dist,
            staging: false,
            remembered: Some(3),
        };
        let choice = select_methods(&table, &query);
        assert_eq!(choice.methods[0].label(), "apt-get");
        assert_eq!(choice.default_method().map(InstallMethod::index), Some(3));

        let stale = MethodQuery {
            remembered: Some(2),
            ..query
        };
        let choice = select_methods(&table, &stale);
        assert_eq!(choice.default_method().map(InstallMethod::index), Some(1));
        assert_eq!(choice, select_methods(&table, &stale));
    }

    #[test]
    fn no_methods_for_unknown_component_table() {
        let dist = DistInfo::default();
        let query = MethodQuery {
            component: Component::Drbd,
            dist: &dist,
            staging: true,
            remembered: Some(1),
        };
        let choice = select_methods(&StaticResources::empty(), &query);
        assert!(choice.is_empty());
        assert!(choice.default_method().is_none());
    }

    #[test]
    fn command_key_follows_resource_naming() {
        let dist = DistInfo::new("fedora", "13");
        let choice = select_methods(
            &StaticResources::builtin(),
            &MethodQuery {
                component: Component::HbPm,
                dist: &dist,
                staging: false,
                remembered: None,
            },
        );
        let method = choice.find(2).expect("yum method");
        assert_eq!(method.command_key(Component::HbPm), "HbPmInst.install.2");
        assert!(!method.uses_vendor_repository());
    }
}
