// Per-stream credential stamping.
use anyhow::Result;
use async_trait::async_trait;

/// Supplies the credential attached to each stream open. Fetched fresh per
/// open so rotated tokens take effect on the next reconnect.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Result<String>;
}

/// Fixed-token provider for environments where the credential is issued out
/// of band.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
