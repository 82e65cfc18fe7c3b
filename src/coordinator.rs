// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wand coordinator: at-most-once-successful registration of wand keys.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::RegistrationError;
use crate::identity::{LocalIdentity, Signer};
use crate::storage::KnownWandsIndex;
use crate::trust::{RegisterWandRequest, TrustService};

/// Successful registration outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Already registered by this installation; no request was made.
    AlreadyKnown,
    Registered { message: String },
}

impl Registration {
    pub fn message(&self) -> &str {
        match self {
            Registration::AlreadyKnown => "Wand already registered",
            Registration::Registered { message } => message,
        }
    }
}

pub struct WandCoordinator {
    identity: LocalIdentity,
    signer: Arc<dyn Signer>,
    trust: Arc<dyn TrustService>,
    index: Mutex<KnownWandsIndex>,
    in_flight: Mutex<HashSet<String>>,
}

/// Clears an in-flight marker when the registration finishes or is dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl WandCoordinator {
    pub fn new(
        identity: LocalIdentity,
        signer: Arc<dyn Signer>,
        trust: Arc<dyn TrustService>,
        index: KnownWandsIndex,
    ) -> Self {
        Self {
            identity,
            signer,
            trust,
            index: Mutex::new(index),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_known(&self, public_key: &str) -> bool {
        self.index.lock().is_known(public_key)
    }

    pub fn known_wands(&self) -> Vec<(String, DateTime<Utc>)> {
        self.index.lock().entries()
    }

    /// Register a wand with the trust service unless this installation already has.
    ///
    /// The key is marked known only after an explicit success *and* a durable
    /// save; any other outcome leaves it unknown so the next trigger retries.
    pub async fn register_wand(
        &self,
        public_key: &str,
        display_name: &str,
    ) -> Result<Registration, RegistrationError> {
        if self.is_known(public_key) {
            debug!("Wand {} already registered", public_key);
            return Ok(Registration::AlreadyKnown);
        }

        let _guard = self.begin(public_key)?;

        let mut request = RegisterWandRequest {
            primary_uuid: self.identity.primary_uuid.to_string(),
            pub_key: public_key.to_string(),
            wand_name: display_name.to_string(),
            timestamp: Utc::now().timestamp_millis().to_string(),
            signature: None,
        };
        request.signature = self.signer.sign(&request.signed_message());

        info!("Registering wand {} ({})", display_name, public_key);
        let message = match self.trust.register_wand(&request).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Registration of wand {} failed: {}", public_key, e);
                return Err(e);
            }
        };

        self.index.lock().mark_known(public_key).map_err(|e| {
            warn!("Registered wand {} but could not save it: {:#}", public_key, e);
            RegistrationError::Storage(e.to_string())
        })?;

        info!("Wand {} registered: {}", public_key, message);
        Ok(Registration::Registered { message })
    }

    /// Forget a wand so it will be registered again. Does not contact the trust
    /// service.
    pub fn forget_wand(&self, public_key: &str) -> Result<bool> {
        self.index.lock().forget(public_key)
    }

    /// Drop any record of a previous registration and register again.
    pub async fn retry_registration(
        &self,
        public_key: &str,
        display_name: &str,
    ) -> Result<Registration, RegistrationError> {
        self.forget_wand(public_key)
            .map_err(|e| RegistrationError::Storage(e.to_string()))?;
        self.register_wand(public_key, display_name).await
    }

    fn begin(&self, public_key: &str) -> Result<InFlight<'_>, RegistrationError> {
        let key = public_key.trim().to_ascii_lowercase();
        if !self.in_flight.lock().insert(key.clone()) {
            debug!("Registration of {} already in flight", public_key);
            return Err(RegistrationError::AlreadyInFlight);
        }
        Ok(InFlight {
            set: &self.in_flight,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NoSigner;
    use crate::storage::{KeyValueStore, MemoryStore};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Trust service double that answers from a script and counts requests.
    #[derive(Default)]
    struct ScriptedTrust {
        calls: AtomicUsize,
        fail_first: usize,
        requests: Mutex<Vec<RegisterWandRequest>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl TrustService for ScriptedTrust {
        async fn register_wand(
            &self,
            request: &RegisterWandRequest,
        ) -> Result<String, RegistrationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if n < self.fail_first {
                Err(RegistrationError::Rejected {
                    message: "Try later".into(),
                })
            } else {
                Ok("Welcome".into())
            }
        }
    }

    struct FixedSigner;

    impl Signer for FixedSigner {
        fn sign(&self, message: &str) -> Option<String> {
            Some(format!("sig({})", message.len()))
        }
    }

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn set(&self, _: &str, _: &str, _: &[u8]) -> Result<()> {
            bail!("read-only filesystem")
        }
    }

    fn coordinator(trust: Arc<ScriptedTrust>, store: Arc<dyn KeyValueStore>) -> WandCoordinator {
        let identity = LocalIdentity {
            primary_uuid: Uuid::nil(),
        };
        let index = KnownWandsIndex::load(store).unwrap();
        WandCoordinator::new(identity, Arc::new(NoSigner), trust, index)
    }

    #[tokio::test]
    async fn test_second_registration_short_circuits() {
        let trust = Arc::new(ScriptedTrust::default());
        let coordinator = coordinator(trust.clone(), Arc::new(MemoryStore::new()));

        let first = coordinator.register_wand("02ab", "P9-Wand 01").await;
        let second = coordinator.register_wand("02ab", "P9-Wand 01").await;

        assert_eq!(
            first,
            Ok(Registration::Registered {
                message: "Welcome".into()
            })
        );
        assert_eq!(second, Ok(Registration::AlreadyKnown));
        assert_eq!(trust.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_retried_next_time() {
        let trust = Arc::new(ScriptedTrust {
            fail_first: 1,
            ..Default::default()
        });
        let coordinator = coordinator(trust.clone(), Arc::new(MemoryStore::new()));

        let first = coordinator.register_wand("02ab", "P9-Wand 01").await;
        assert_eq!(
            first,
            Err(RegistrationError::Rejected {
                message: "Try later".into()
            })
        );
        assert!(!coordinator.is_known("02ab"));

        let second = coordinator.register_wand("02ab", "P9-Wand 01").await;
        assert!(matches!(second, Ok(Registration::Registered { .. })));
        assert_eq!(trust.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_contents() {
        let trust = Arc::new(ScriptedTrust::default());
        let identity = LocalIdentity {
            primary_uuid: Uuid::nil(),
        };
        let index = KnownWandsIndex::load(Arc::new(MemoryStore::new())).unwrap();
        let coordinator =
            WandCoordinator::new(identity, Arc::new(FixedSigner), trust.clone(), index);

        coordinator.register_wand("02ab", "P9-Wand 07").await.unwrap();

        let requests = trust.requests.lock();
        let request = &requests[0];
        assert_eq!(request.primary_uuid, Uuid::nil().to_string());
        assert_eq!(request.pub_key, "02ab");
        assert_eq!(request.wand_name, "P9-Wand 07");
        assert!(request.timestamp.parse::<i64>().is_ok());
        assert_eq!(
            request.signature,
            Some(format!("sig({})", request.signed_message().len()))
        );
    }

    #[tokio::test]
    async fn test_unsaved_success_is_not_success() {
        let trust = Arc::new(ScriptedTrust::default());
        let coordinator = coordinator(trust.clone(), Arc::new(BrokenStore));

        let result = coordinator.register_wand("02ab", "P9-Wand 01").await;
        assert!(matches!(result, Err(RegistrationError::Storage(_))));
        assert!(!coordinator.is_known("02ab"));

        let _ = coordinator.register_wand("02ab", "P9-Wand 01").await;
        assert_eq!(trust.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forget_allows_reregistration() {
        let trust = Arc::new(ScriptedTrust::default());
        let coordinator = coordinator(trust.clone(), Arc::new(MemoryStore::new()));

        coordinator.register_wand("02ab", "P9-Wand 01").await.unwrap();
        assert!(coordinator.forget_wand("02ab").unwrap());
        assert!(!coordinator.forget_wand("02ab").unwrap());

        coordinator.register_wand("02ab", "P9-Wand 01").await.unwrap();
        assert_eq!(trust.calls.load(Ordering::SeqCst), 2);

        coordinator
            .retry_registration("02ab", "P9-Wand 01")
            .await
            .unwrap();
        assert_eq!(trust.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_registration_is_deduplicated() {
        let gate = Arc::new(Notify::new());
        let trust = Arc::new(ScriptedTrust {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let coordinator = Arc::new(coordinator(trust.clone(), Arc::new(MemoryStore::new())));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_wand("02ab", "P9-Wand 01").await })
        };
        while trust.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = coordinator.register_wand("02AB", "P9-Wand 01").await;
        assert_eq!(second, Err(RegistrationError::AlreadyInFlight));

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(trust.calls.load(Ordering::SeqCst), 1);
    }
}
