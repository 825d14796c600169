use async_trait::async_trait;

use crate::error::{PiiError, Result};

/// Opaque key→string lookup (§1 "secret acquisition... assumed: opaque
/// key→string lookup"). Sensitive values — KV host/port, peer service URLs,
/// bearer tokens — are resolved through this trait rather than read
/// directly from the environment, so the actual secret backend stays fully
/// external and swappable.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, secret_id: &str) -> Result<String>;
}

/// Default resolver: looks the secret id up as an environment variable
/// name. Good enough for local development and for the test suite; a real
/// deployment supplies its own [`SecretResolver`] backed by whatever secret
/// store it runs.
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, secret_id: &str) -> Result<String> {
        std::env::var(secret_id)
            .map_err(|_| PiiError::NotFound(format!("secret '{secret_id}' not set")))
    }
}
