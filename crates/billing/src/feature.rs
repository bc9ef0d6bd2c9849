//! Closed sets of feature and resource identifiers.
//!
//! Both are enums on purpose: a misspelled feature name is a parse error at
//! the boundary, never a silently-false lookup deep inside the evaluator.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use accessgate_core::{DomainError, DomainResult};

/// A gated product area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Leads,
    Quotes,
    Units,
    Sales,
    Vendors,
    Reports,
    Export,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::Leads,
        Feature::Quotes,
        Feature::Units,
        Feature::Sales,
        Feature::Vendors,
        Feature::Reports,
        Feature::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Leads => "leads",
            Feature::Quotes => "quotes",
            Feature::Units => "units",
            Feature::Sales => "sales",
            Feature::Vendors => "vendors",
            Feature::Reports => "reports",
            Feature::Export => "export",
        }
    }
}

impl core::fmt::Display for Feature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown feature '{s}'")))
    }
}

/// A metered resource with a per-plan quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Leads,
    Quotes,
    Units,
    Sales,
    Users,
    Vendors,
}

impl ResourceType {
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Leads,
        ResourceType::Quotes,
        ResourceType::Units,
        ResourceType::Sales,
        ResourceType::Users,
        ResourceType::Vendors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Leads => "leads",
            ResourceType::Quotes => "quotes",
            ResourceType::Units => "units",
            ResourceType::Sales => "sales",
            ResourceType::Users => "users",
            ResourceType::Vendors => "vendors",
        }
    }
}

impl core::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        ResourceType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown resource type '{s}'")))
    }
}
