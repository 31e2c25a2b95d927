use crate::domain::{CallerScope, DomainError, DomainResult};
use http::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Admin,
    Tenant,
}

/// JWT claims issued to read-API callers by the session service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerClaims {
    pub sub: String,
    pub role: CallerRole,
    /// Profiles a tenant may see; ignored for admins
    #[serde(default)]
    pub profiles: Vec<String>,
    pub exp: usize,
}

impl CallerClaims {
    pub fn into_scope(self) -> CallerScope {
        match self.role {
            CallerRole::Admin => CallerScope::Admin,
            CallerRole::Tenant => CallerScope::tenant(self.profiles),
        }
    }
}

/// Resolves a bearer token into the caller's scope
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait CallerAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> DomainResult<CallerScope>;
}

/// HS256 JWT implementation of [`CallerAuthenticator`]
pub struct JwtCallerAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCallerAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Sign claims with the shared secret
    pub fn issue_token(&self, claims: &CallerClaims) -> DomainResult<String> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!("JWT encoding error: {}", e)))
    }
}

impl CallerAuthenticator for JwtCallerAuthenticator {
    fn authenticate(&self, token: &str) -> DomainResult<CallerScope> {
        let token_data = decode::<CallerClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| DomainError::InvalidToken(e.to_string()))?;

        Ok(token_data.claims.into_scope())
    }
}

/// Extract the caller scope from an `Authorization: Bearer <token>` header
pub fn extract_caller_scope(
    headers: &HeaderMap,
    authenticator: &dyn CallerAuthenticator,
) -> DomainResult<CallerScope> {
    let auth_header = headers
        .get(http::header::AUTHORIZATION)
        .ok_or_else(|| DomainError::Unauthorized("missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| DomainError::Unauthorized("invalid authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .ok_or_else(|| {
            DomainError::Unauthorized("invalid authorization format, expected 'Bearer <token>'".to_string())
        })?;

    authenticator.authenticate(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn claims(role: CallerRole, profiles: &[&str]) -> CallerClaims {
        CallerClaims {
            sub: "user-123".to_string(),
            role,
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        }
    }

    #[test]
    fn test_admin_token_yields_admin_scope() {
        let auth = JwtCallerAuthenticator::new("test-secret-key");
        let token = auth.issue_token(&claims(CallerRole::Admin, &[])).unwrap();

        assert_eq!(auth.authenticate(&token).unwrap(), CallerScope::Admin);
    }

    #[test]
    fn test_tenant_token_yields_profiles() {
        let auth = JwtCallerAuthenticator::new("test-secret-key");
        let token = auth
            .issue_token(&claims(CallerRole::Tenant, &["p-1", "p-2"]))
            .unwrap();

        assert_eq!(
            auth.authenticate(&token).unwrap(),
            CallerScope::tenant(["p-1", "p-2"])
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtCallerAuthenticator::new("test-secret-key");
        let verifier = JwtCallerAuthenticator::new("different-secret");
        let token = issuer.issue_token(&claims(CallerRole::Admin, &[])).unwrap();

        assert!(matches!(
            verifier.authenticate(&token),
            Err(DomainError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = JwtCallerAuthenticator::new("test-secret-key");
        let mut expired = claims(CallerRole::Admin, &[]);
        expired.exp = (chrono::Utc::now().timestamp() - 3600) as usize;
        let token = auth.issue_token(&expired).unwrap();

        assert!(matches!(
            auth.authenticate(&token),
            Err(DomainError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_extract_caller_scope_success() {
        let mut mock = MockCallerAuthenticator::new();
        mock.expect_authenticate()
            .with(mockall::predicate::eq("valid_token"))
            .returning(|_| Ok(CallerScope::Admin));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer valid_token"),
        );

        assert_eq!(extract_caller_scope(&headers, &mock).unwrap(), CallerScope::Admin);
    }

    #[test]
    fn test_extract_caller_scope_missing_header() {
        let mock = MockCallerAuthenticator::new();
        let result = extract_caller_scope(&HeaderMap::new(), &mock);
        assert!(matches!(result, Err(DomainError::Unauthorized(_))));
    }

    #[test]
    fn test_extract_caller_scope_invalid_format() {
        let mock = MockCallerAuthenticator::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );

        let result = extract_caller_scope(&headers, &mock);
        assert!(matches!(result, Err(DomainError::Unauthorized(_))));
    }

    #[test]
    fn test_extract_caller_scope_lowercase_bearer() {
        let mut mock = MockCallerAuthenticator::new();
        mock.expect_authenticate()
            .returning(|_| Ok(CallerScope::tenant(["p-1"])));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer valid_token"),
        );

        assert!(extract_caller_scope(&headers, &mock).is_ok());
    }
}
