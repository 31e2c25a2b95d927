use crate::domain::{DomainError, DomainResult};

/// Allowlist applied to the `Origin` header of browser-originated requests.
///
/// Requests without an `Origin` header (devices, server-to-server) always
/// pass. An empty list or a single `*` allows every origin.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed_origins: Vec<String>,
}

impl OriginPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn with_origins(origins: Vec<String>) -> Self {
        Self {
            allowed_origins: origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    /// Parse comma-separated origins string
    pub fn from_comma_separated(origins: &str) -> Self {
        Self::with_origins(origins.split(',').map(str::to_string).collect())
    }

    fn allows_any(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }

    pub fn check(&self, origin: Option<&str>) -> DomainResult<()> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self.allows_any() {
            return Ok(());
        }
        let origin = origin.trim_end_matches('/');
        if self.allowed_origins.iter().any(|allowed| allowed.eq_ignore_ascii_case(origin)) {
            Ok(())
        } else {
            Err(DomainError::OriginNotAllowed(origin.to_string()))
        }
    }
}
