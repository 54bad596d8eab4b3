//! Authentication & authorization (spec.md §4.2): `X-Device-Key` and
//! `X-API-Key` schemes.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{IngestError, IngestResult};

pub fn hash_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First 8 hex chars only — never log the full digest or the plaintext key.
pub fn log_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyRole {
    Admin,
    SourceWriter,
    ReadOnly,
}

impl ApiKeyRole {
    fn parse(s: &str) -> Self {
        match s {
            "ADMIN" => ApiKeyRole::Admin,
            "SOURCE_WRITER" => ApiKeyRole::SourceWriter,
            _ => ApiKeyRole::ReadOnly,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyInfo {
    pub role: ApiKeyRole,
    pub allowed_source_id: Option<String>,
    pub allowed_domains: Vec<String>,
}

impl ApiKeyInfo {
    /// ADMIN passes unconditionally; SOURCE_WRITER passes iff the source
    /// and domain are both in its allow-list; READ_ONLY never passes for
    /// a write (spec.md §4.2).
    pub fn authorize_write(&self, source_id: &str, domain: &str) -> bool {
        match self.role {
            ApiKeyRole::Admin => true,
            ApiKeyRole::ReadOnly => false,
            ApiKeyRole::SourceWriter => {
                self.allowed_source_id.as_deref() == Some(source_id)
                    && self.allowed_domains.iter().any(|d| d == domain)
            }
        }
    }
}

pub async fn authenticate_device_key(db: &Db, raw_key: &str, device_uuid: Uuid) -> IngestResult<()> {
    let hash = hash_key(raw_key);
    let row = db.lookup_device_key(&hash).await.map_err(IngestError::Internal)?;

    let Some((bound_device, active, revoked, expires_at)) = row else {
        tracing::warn!(prefix = log_prefix(&hash), "unknown device key");
        return Err(IngestError::Unauthenticated);
    };

    if !active || revoked {
        tracing::warn!(prefix = log_prefix(&hash), "inactive or revoked device key");
        return Err(IngestError::Unauthenticated);
    }
    if let Some(expiry) = expires_at {
        if expiry < OffsetDateTime::now_utc() {
            tracing::warn!(prefix = log_prefix(&hash), "expired device key");
            return Err(IngestError::Unauthenticated);
        }
    }
    if bound_device != device_uuid {
        tracing::warn!(prefix = log_prefix(&hash), "device key not bound to this device_uuid");
        return Err(IngestError::Forbidden);
    }

    let _ = db.touch_device_key(&hash).await;
    Ok(())
}

pub fn parse_api_key_row(role: &str, allowed_source_id: Option<String>, allowed_domains: Vec<String>) -> ApiKeyInfo {
    ApiKeyInfo {
        role: ApiKeyRole::parse(role),
        allowed_source_id,
        allowed_domains,
    }
}

pub async fn authenticate_api_key(db: &Db, raw_key: &str) -> IngestResult<ApiKeyInfo> {
    let hash = hash_key(raw_key);
    let row = db.lookup_api_key(&hash).await.map_err(IngestError::Internal)?;

    let Some((role, allowed_source_id, allowed_domains, active, revoked, expires_at)) = row else {
        tracing::warn!(prefix = log_prefix(&hash), "unknown api key");
        return Err(IngestError::Unauthenticated);
    };

    if !active || revoked {
        tracing::warn!(prefix = log_prefix(&hash), "inactive or revoked api key");
        return Err(IngestError::Unauthenticated);
    }
    if let Some(expiry) = expires_at {
        if expiry < OffsetDateTime::now_utc() {
            tracing::warn!(prefix = log_prefix(&hash), "expired api key");
            return Err(IngestError::Unauthenticated);
        }
    }

    let _ = db.touch_api_key(&hash).await;
    Ok(parse_api_key_row(&role, allowed_source_id, allowed_domains))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_prefix_is_short() {
        let h1 = hash_key("secret");
        let h2 = hash_key("secret");
        assert_eq!(h1, h2);
        assert_eq!(log_prefix(&h1).len(), 8);
    }

    #[test]
    fn admin_passes_any_scope() {
        let info = ApiKeyInfo { role: ApiKeyRole::Admin, allowed_source_id: None, allowed_domains: vec![] };
        assert!(info.authorize_write("anything", "anything"));
    }

    #[test]
    fn read_only_never_writes() {
        let info = ApiKeyInfo {
            role: ApiKeyRole::ReadOnly,
            allowed_source_id: Some("s1".into()),
            allowed_domains: vec!["weather".into()],
        };
        assert!(!info.authorize_write("s1", "weather"));
    }

    #[test]
    fn source_writer_requires_exact_scope_match() {
        let info = ApiKeyInfo {
            role: ApiKeyRole::SourceWriter,
            allowed_source_id: Some("s1".into()),
            allowed_domains: vec!["weather".into()],
        };
        assert!(info.authorize_write("s1", "weather"));
        assert!(!info.authorize_write("s2", "weather"));
        assert!(!info.authorize_write("s1", "traffic"));
    }
}
