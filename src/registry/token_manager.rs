//! Credential cache shared by every request of a run
//!
//! Credentials are cached per scope and only replaced when the registry challenges
//! again. Refreshes are single-flight: concurrent workers that hit a 401 for the same
//! stale credential wait on one exchange and reuse its result.

use crate::error::{PusherError, Result};
use crate::logging::Logger;
use crate::registry::auth::{Auth, Challenge, Credential};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Scope string for push access to `repository`
pub fn push_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}

pub struct TokenManager {
    auth: Auth,
    credentials: RwLock<HashMap<String, Credential>>,
    refresh_guard: Mutex<()>,
    exchanges: AtomicUsize,
    output: Logger,
}

impl TokenManager {
    pub fn new(auth: Auth, output: Logger) -> Self {
        Self {
            auth,
            credentials: RwLock::new(HashMap::new()),
            refresh_guard: Mutex::new(()),
            exchanges: AtomicUsize::new(0),
            output,
        }
    }

    /// Cached credential for `scope`, if one was obtained earlier in the run
    pub fn cached(&self, scope: &str) -> Result<Option<Credential>> {
        let guard = self.credentials.read().map_err(|_| {
            PusherError::Authentication("Failed to acquire credential read lock".to_string())
        })?;
        Ok(guard.get(scope).cloned())
    }

    /// Replace `stale` for `scope` in answer to `challenge`.
    ///
    /// If another worker already replaced it while this one waited, that credential
    /// is returned without a second exchange.
    pub async fn refresh(
        &self,
        scope: &str,
        challenge: &Challenge,
        stale: Option<&Credential>,
    ) -> Result<Credential> {
        let _guard = self.refresh_guard.lock().await;

        if let Some(current) = self.cached(scope)? {
            if stale != Some(&current) {
                self.output
                    .debug(&format!("Reusing credential refreshed concurrently for {}", scope));
                return Ok(current);
            }
        }

        if stale.is_some() {
            self.output
                .warning(&format!("Registry challenged again for {}, re-authenticating", scope));
        } else {
            self.output.detail(&format!("Authenticating for {}", scope));
        }

        let credential = self.auth.authenticate(challenge, scope).await?;
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let mut guard = self.credentials.write().map_err(|_| {
            PusherError::Authentication("Failed to acquire credential write lock".to_string())
        })?;
        guard.insert(scope.to_string(), credential.clone());
        Ok(credential)
    }

    /// Number of credential exchanges performed so far
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }
}
