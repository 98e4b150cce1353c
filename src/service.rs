//! Composition root: one TEE runtime and every component built on it.
//!
//! `KmsService` is what an HTTP layer or the CLI talks to. All operations
//! return public material only; private keys stay in sealed storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::B256;
use tokio::sync::OwnedMutexGuard;

use crate::attestation::{AttestationVerifier, ExpectedMeasurements, QuoteGenerator, VerifyOutcome};
use crate::config::KmsConfig;
use crate::error::{KmsError, Result};
use crate::kms::lifecycle::ensure_active;
use crate::kms::{
    CreateKeyRequest, CreatedKey, KeyId, KeyLifecycleManager, KeyMetadata, KeyMetadataStore,
    RootKeyManager, RotatedKey, SignedMessage, SignedTransaction, TeeSigner, TransactionRequest,
};
use crate::lock::lock;
use crate::policy::{PolicyEngine, PolicyEvaluation, PolicyRuleConfig, SigningContext};
use crate::tee::attestation::{AttestationQuote, TeeProviderKind};
use crate::tee::runtime::{self, TeeRuntime};

type CachedEngine = Arc<Mutex<PolicyEngine>>;

pub struct KmsService {
    runtime: Arc<dyn TeeRuntime>,
    root_keys: Arc<RootKeyManager>,
    key_store: Arc<KeyMetadataStore>,
    lifecycle: KeyLifecycleManager,
    quotes: QuoteGenerator,
    verifier: AttestationVerifier,
    policy_cache: Mutex<HashMap<KeyId, CachedEngine>>,
}

impl KmsService {
    /// Initialize `runtime`, then load or generate the root key.
    ///
    /// A runtime that fails to initialize is fatal.
    pub async fn start(runtime: Arc<dyn TeeRuntime>) -> Result<Self> {
        Self::start_with_verifier(runtime, AttestationVerifier::new()).await
    }

    pub async fn start_with_verifier(
        runtime: Arc<dyn TeeRuntime>,
        verifier: AttestationVerifier,
    ) -> Result<Self> {
        runtime.initialize().await?;

        let storage = runtime.sealed_storage();
        let root_keys = Arc::new(RootKeyManager::new(storage.clone()));
        root_keys.initialize(None).await?;

        let key_store = Arc::new(KeyMetadataStore::new());
        let lifecycle = KeyLifecycleManager::new(root_keys.clone(), key_store.clone(), storage);

        tracing::info!(provider = %runtime.provider(), "Key management service started");

        Ok(Self {
            quotes: QuoteGenerator::new(runtime.clone()),
            runtime,
            root_keys,
            key_store,
            lifecycle,
            verifier,
            policy_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Build the runtime selected by `config` and start on it.
    pub async fn from_config(config: &KmsConfig) -> Result<Self> {
        let runtime = runtime::from_config(config)?;
        let verifier = AttestationVerifier::new().with_max_report_age(config.max_report_age());
        Self::start_with_verifier(runtime, verifier).await
    }

    // ========================================================================
    // Keys
    // ========================================================================

    pub async fn create_key(&self, request: &CreateKeyRequest) -> Result<CreatedKey> {
        self.lifecycle.create_key(request).await
    }

    pub async fn rotate_key(&self, key_id: &str) -> Result<RotatedKey> {
        self.lifecycle.rotate_key(key_id).await
    }

    pub async fn revoke_key(&self, key_id: &str) -> Result<()> {
        self.lifecycle.revoke_key(key_id).await?;
        lock(&self.policy_cache).remove(key_id);
        Ok(())
    }

    pub fn key_metadata(&self, key_id: &str) -> Option<KeyMetadata> {
        self.key_store.get(key_id)
    }

    /// Keys of one agent, or every key.
    pub fn list_keys(&self, agent_id: Option<&str>) -> Vec<KeyMetadata> {
        match agent_id {
            Some(agent_id) => self.key_store.get_by_agent(agent_id),
            None => self.key_store.list_all(),
        }
    }

    // ========================================================================
    // Policy
    // ========================================================================

    /// Replace the rules of a key. Counters of the previous engine are dropped.
    pub fn set_policy(&self, key_id: &str, rules: Vec<PolicyRuleConfig>) -> Result<()> {
        self.require_key(key_id)?;
        let rule_count = rules.len();
        self.key_store.set_policy(key_id, rules);
        lock(&self.policy_cache).remove(key_id);
        tracing::info!(key_id, rules = rule_count, "Policy updated");
        Ok(())
    }

    pub fn get_policy(&self, key_id: &str) -> Result<Vec<PolicyRuleConfig>> {
        self.require_key(key_id)?;
        Ok(self.key_store.get_policy(key_id))
    }

    /// Run the key's engine against `ctx`, advancing its counters.
    pub fn evaluate_policy(&self, key_id: &str, ctx: &SigningContext) -> Result<PolicyEvaluation> {
        let meta = self.require_key(key_id)?;
        Ok(match self.policy_engine(&meta.id) {
            Some(engine) => lock(&engine).evaluate(ctx),
            None => PolicyEvaluation::allow("engine", "All policy rules passed"),
        })
    }

    fn policy_engine(&self, key_id: &KeyId) -> Option<CachedEngine> {
        let mut cache = lock(&self.policy_cache);
        if let Some(engine) = cache.get(key_id) {
            return Some(engine.clone());
        }
        let rules = self.key_store.get_policy(key_id.as_str());
        if rules.is_empty() {
            return None;
        }
        let engine = Arc::new(Mutex::new(PolicyEngine::from_config(&rules)));
        cache.insert(key_id.clone(), engine.clone());
        Some(engine)
    }

    // ========================================================================
    // Signing
    // ========================================================================

    pub async fn sign_message(
        &self,
        key_id: &str,
        caller_id: &str,
        message: &[u8],
    ) -> Result<SignedMessage> {
        let (_guard, signer) = self.signer_for(key_id, caller_id).await?;
        let signature = signer.sign_message(message).await?;
        tracing::info!(key_id, caller_id, "Message signed");
        Ok(SignedMessage {
            signature,
            address: signer.address().to_string(),
        })
    }

    pub async fn sign_transaction(
        &self,
        key_id: &str,
        caller_id: &str,
        tx: &TransactionRequest,
    ) -> Result<SignedTransaction> {
        let (_guard, signer) = self.signer_for(key_id, caller_id).await?;
        signer.sign_transaction(tx).await
    }

    pub async fn sign_typed_data(
        &self,
        key_id: &str,
        caller_id: &str,
        domain_separator: B256,
        struct_hash: B256,
    ) -> Result<String> {
        let (_guard, signer) = self.signer_for(key_id, caller_id).await?;
        let signature = signer.sign_typed_data(domain_separator, struct_hash).await?;
        tracing::info!(key_id, caller_id, "Typed data signed");
        Ok(signature)
    }

    /// Signer for an active key, with the agent's lifecycle lock held.
    async fn signer_for(
        &self,
        key_id: &str,
        caller_id: &str,
    ) -> Result<(OwnedMutexGuard<()>, TeeSigner)> {
        let agent_id = self.require_key(key_id)?.agent_id;
        let guard = self.lifecycle.lock_agent(&agent_id).await;

        let meta = self.require_key(key_id)?;
        ensure_active(&meta)?;

        let mut signer = TeeSigner::new(
            meta.id.clone(),
            meta.ethereum_address,
            self.runtime.sealed_storage(),
        )
        .with_caller(caller_id);
        if let Some(engine) = self.policy_engine(&meta.id) {
            signer = signer.with_policy(engine);
        }
        Ok((guard, signer))
    }

    fn require_key(&self, key_id: &str) -> Result<KeyMetadata> {
        self.key_store
            .get(key_id)
            .ok_or_else(|| KmsError::KeyNotFound(key_id.to_string()))
    }

    // ========================================================================
    // Attestation
    // ========================================================================

    /// Quote binding `nonce` (random if absent) to the root public key.
    pub async fn generate_quote(&self, nonce: Option<&str>) -> Result<AttestationQuote> {
        let root_public_key = self.root_keys.public_key().await?;
        self.quotes.generate(&root_public_key, nonce).await
    }

    pub fn verify_quote(
        &self,
        quote: &AttestationQuote,
        expected: Option<&ExpectedMeasurements>,
    ) -> VerifyOutcome {
        self.verifier.verify(quote, expected)
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    pub async fn root_public_key(&self) -> Result<String> {
        self.root_keys.public_key().await
    }

    pub async fn measurement(&self) -> Result<String> {
        self.runtime.measurement().await
    }

    pub fn provider(&self) -> TeeProviderKind {
        self.runtime.provider()
    }

    /// Destroy the runtime. Sealed entries are discarded.
    pub async fn shutdown(&self) -> Result<()> {
        lock(&self.policy_cache).clear();
        self.runtime.destroy().await?;
        tracing::info!("Key management service stopped");
        Ok(())
    }
}
