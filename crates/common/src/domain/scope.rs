use crate::domain::series::DeviceFilter;
use std::collections::BTreeSet;

/// Resolved visibility of a read-API caller.
///
/// Built once per request from the caller's credentials and passed explicitly
/// through the query services; nothing downstream re-derives roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerScope {
    /// Unrestricted, may see raw device identifiers
    Admin,
    /// Restricted to devices owned by these profiles; sees sealed identifiers only
    Tenant { profile_ids: BTreeSet<String> },
}

impl CallerScope {
    pub fn tenant<I, S>(profile_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CallerScope::Tenant {
            profile_ids: profile_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, CallerScope::Admin)
    }

    /// Whether a device owned by `profile_id` is visible to this caller
    pub fn can_see(&self, profile_id: &str) -> bool {
        match self {
            CallerScope::Admin => true,
            CallerScope::Tenant { profile_ids } => profile_ids.contains(profile_id),
        }
    }

    /// Device filter for fleet-wide queries
    pub fn fleet_filter(&self) -> DeviceFilter {
        match self {
            CallerScope::Admin => DeviceFilter::All,
            CallerScope::Tenant { profile_ids } => {
                DeviceFilter::Profiles(profile_ids.iter().cloned().collect())
            }
        }
    }
}
