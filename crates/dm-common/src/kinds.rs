//! Resource kinds managed by the deployment manager controllers
//!
//! Resource shapes live with their controllers. The coordinator only needs
//! to address objects of each kind generically, so each kind maps to an
//! `ApiResource` for `DynamicObject` access.

use std::fmt;

use kube::discovery::ApiResource;

use crate::{API_GROUP, API_VERSION};

/// Known resource kinds reconciled by deployment manager controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// System (one per namespace, owns the platform client)
    System,
    /// Host
    Host,
    /// HostProfile (consumed by Host, never reconciled on its own)
    HostProfile,
    /// PlatformNetwork
    PlatformNetwork,
    /// DataNetwork
    DataNetwork,
    /// PtpInstance
    PtpInstance,
    /// PtpInterface
    PtpInterface,
}

/// Kinds woken by the system controller whenever the system changes.
///
/// Only controllers that manage external resources are listed. HostProfiles
/// are consumed by Hosts and are never notified.
pub const SYSTEM_DEPENDENCIES: &[ResourceKind] = &[
    ResourceKind::Host,
    ResourceKind::PlatformNetwork,
    ResourceKind::DataNetwork,
    ResourceKind::PtpInstance,
    ResourceKind::PtpInterface,
];

impl ResourceKind {
    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::Host => "Host",
            Self::HostProfile => "HostProfile",
            Self::PlatformNetwork => "PlatformNetwork",
            Self::DataNetwork => "DataNetwork",
            Self::PtpInstance => "PtpInstance",
            Self::PtpInterface => "PtpInterface",
        }
    }

    /// Lowercase plural used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            Self::System => "systems",
            Self::Host => "hosts",
            Self::HostProfile => "hostprofiles",
            Self::PlatformNetwork => "platformnetworks",
            Self::DataNetwork => "datanetworks",
            Self::PtpInstance => "ptpinstances",
            Self::PtpInterface => "ptpinterfaces",
        }
    }

    /// Whether the system controller wakes this kind on system changes
    pub fn is_system_dependency(&self) -> bool {
        SYSTEM_DEPENDENCIES.contains(self)
    }

    /// ApiResource for dynamic access to objects of this kind
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: API_GROUP.to_string(),
            version: API_VERSION.to_string(),
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: self.kind_str().to_string(),
            plural: self.plural().to_string(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Deployment type of the system in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SystemType {
    /// Not reported yet
    #[default]
    Unknown,
    /// Controller and worker functions on the same hosts
    AllInOne,
    /// Dedicated controller hosts
    Standard,
}

impl SystemType {
    /// Wire value as reported by the platform ("" when unknown)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::AllInOne => "all-in-one",
            Self::Standard => "standard",
        }
    }

    /// Parse a platform-reported value; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "all-in-one" => Self::AllInOne,
            "standard" => Self::Standard,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Controller redundancy mode of the system in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SystemMode {
    /// Not reported yet
    #[default]
    Unknown,
    /// A single controller
    Simplex,
    /// Two controllers in active/standby
    Duplex,
}

impl SystemMode {
    /// Wire value as reported by the platform ("" when unknown)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Simplex => "simplex",
            Self::Duplex => "duplex",
        }
    }

    /// Parse a platform-reported value; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "simplex" => Self::Simplex,
            "duplex" => Self::Duplex,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_list_excludes_system_and_host_profile() {
        assert_eq!(SYSTEM_DEPENDENCIES.len(), 5);
        assert!(!ResourceKind::System.is_system_dependency());
        assert!(!ResourceKind::HostProfile.is_system_dependency());
        assert!(ResourceKind::Host.is_system_dependency());
        assert!(ResourceKind::PtpInterface.is_system_dependency());
    }

    #[test]
    fn api_resource_uses_starlingx_group() {
        let ar = ResourceKind::PlatformNetwork.api_resource();
        assert_eq!(ar.group, "starlingx.windriver.com");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.api_version, "starlingx.windriver.com/v1");
        assert_eq!(ar.kind, "PlatformNetwork");
        assert_eq!(ar.plural, "platformnetworks");
    }

    #[test]
    fn system_type_parse() {
        assert_eq!(SystemType::parse("all-in-one"), SystemType::AllInOne);
        assert_eq!(SystemType::parse("Standard"), SystemType::Standard);
        assert_eq!(SystemType::parse(""), SystemType::Unknown);
        assert_eq!(SystemType::parse("hybrid"), SystemType::Unknown);
    }

    #[test]
    fn system_type_display() {
        assert_eq!(SystemType::AllInOne.to_string(), "all-in-one");
        assert_eq!(SystemType::Unknown.to_string(), "unknown");
        assert_eq!(SystemType::default(), SystemType::Unknown);
    }

    #[test]
    fn system_mode_parse() {
        assert_eq!(SystemMode::parse("simplex"), SystemMode::Simplex);
        assert_eq!(SystemMode::parse(" Duplex "), SystemMode::Duplex);
        assert_eq!(SystemMode::parse("duplex-direct"), SystemMode::Unknown);
        assert_eq!(SystemMode::parse(""), SystemMode::Unknown);
    }

    #[test]
    fn system_mode_wire_values() {
        assert_eq!(SystemMode::Simplex.as_str(), "simplex");
        assert_eq!(SystemMode::Duplex.to_string(), "duplex");
        assert_eq!(SystemMode::Unknown.as_str(), "");
        assert_eq!(SystemMode::default().to_string(), "unknown");
    }
}
