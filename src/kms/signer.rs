//! Policy-gated signing with keys that never leave sealed storage.
//!
//! Every operation evaluates the policy engine first, then unseals the key
//! for the duration of one ECDSA signature. Signatures are Ethereum style
//! `r ∥ s ∥ v` with `v = recovery id + 27`.

use std::sync::{Arc, Mutex};

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::eips::eip2930::AccessList;
use alloy::primitives::{
    eip191_hash_message, keccak256, Address, Bytes, PrimitiveSignature, TxKind, B256, U256,
};
use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use serde::{Deserialize, Serialize};

use crate::error::{KmsError, Result};
use crate::kms::types::KeyId;
use crate::lock::lock;
use crate::policy::{amount, PolicyEngine, SigningContext};
use crate::tee::sealed::SealedStorage;

/// EIP-1559 transaction to be signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Recipient; `None` deploys a contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(
        default,
        with = "amount::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<u128>,
    /// Calldata as `0x` hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub chain_id: u64,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub gas_limit: u64,
    #[serde(default, with = "amount")]
    pub max_fee_per_gas: u128,
    #[serde(default, with = "amount")]
    pub max_priority_fee_per_gas: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    /// Signed EIP-2718 envelope (type `0x02`), `0x` hex.
    pub signed_tx: String,
    /// Keccak-256 of the signed envelope.
    pub hash: String,
    /// Sender address.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub signature: String,
    pub address: String,
}

/// Signing capability bound to one key.
pub struct TeeSigner {
    key_id: KeyId,
    address: String,
    storage: Arc<dyn SealedStorage>,
    policy: Option<Arc<Mutex<PolicyEngine>>>,
    caller_id: String,
}

impl TeeSigner {
    pub fn new(key_id: KeyId, address: impl Into<String>, storage: Arc<dyn SealedStorage>) -> Self {
        Self {
            key_id,
            address: address.into(),
            storage,
            policy: None,
            caller_id: "unknown".to_string(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<Mutex<PolicyEngine>>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// EIP-191 `personal_sign` over `message`.
    pub async fn sign_message(&self, message: &[u8]) -> Result<String> {
        self.check_policy(self.context())?;
        let hash = eip191_hash_message(message);
        let (signature, recovery_id) = self.sign_hash(&hash).await?;
        Ok(encode_signature(&signature, recovery_id))
    }

    /// Sign an EIP-1559 transaction and return the broadcastable envelope.
    pub async fn sign_transaction(&self, tx: &TransactionRequest) -> Result<SignedTransaction> {
        let unsigned = eip1559_transaction(tx)?;

        let mut ctx = self
            .context()
            .with_value(tx.value.unwrap_or(0))
            .with_chain_id(tx.chain_id);
        if let Some(to) = &tx.to {
            ctx = ctx.with_to(to.clone());
        }
        if let Some(data) = &tx.data {
            ctx = ctx.with_data(data.clone());
        }
        self.check_policy(ctx)?;

        let (signature, recovery_id) = self.sign_hash(&unsigned.signature_hash()).await?;
        let signature = PrimitiveSignature::new(
            U256::from_be_slice(&signature.r().to_bytes()),
            U256::from_be_slice(&signature.s().to_bytes()),
            recovery_id.is_y_odd(),
        );

        let envelope = TxEnvelope::from(unsigned.into_signed(signature)).encoded_2718();
        let hash = keccak256(&envelope);

        tracing::info!(key_id = %self.key_id, tx_hash = %hash, chain_id = tx.chain_id, "Transaction signed");

        Ok(SignedTransaction {
            signed_tx: format!("0x{}", hex::encode(&envelope)),
            hash: format!("{hash:#x}"),
            address: self.address.clone(),
        })
    }

    /// EIP-712 signature over an already hashed domain and struct.
    pub async fn sign_typed_data(&self, domain_separator: B256, struct_hash: B256) -> Result<String> {
        self.check_policy(self.context())?;
        let hash = typed_data_hash(&domain_separator, &struct_hash);
        let (signature, recovery_id) = self.sign_hash(&hash).await?;
        Ok(encode_signature(&signature, recovery_id))
    }

    fn context(&self) -> SigningContext {
        SigningContext::new(self.caller_id.clone(), self.key_id.to_string())
    }

    fn check_policy(&self, ctx: SigningContext) -> Result<()> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        let evaluation = lock(policy).evaluate(&ctx);
        if evaluation.is_allowed() {
            Ok(())
        } else {
            Err(KmsError::PolicyDenied {
                rule_name: evaluation.rule_name,
                reason: evaluation.reason,
            })
        }
    }

    async fn sign_hash(&self, hash: &B256) -> Result<(Signature, RecoveryId)> {
        let secret = self.storage.unseal(&self.key_id.sealed_name()).await?;
        let key = SigningKey::from_slice(secret.expose())
            .map_err(|_| KmsError::Crypto(format!("Sealed key {} is malformed", self.key_id)))?;
        key.sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| KmsError::Crypto(format!("ECDSA signing failed: {e}")))
    }
}

/// `0x` + hex of `r ∥ s ∥ (recid + 27)`.
pub fn encode_signature(signature: &Signature, recovery_id: RecoveryId) -> String {
    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(recovery_id.to_byte() + 27);
    format!("0x{}", hex::encode(bytes))
}

/// Split a 65-byte `r ∥ s ∥ v` signature. Accepts `v` as 0/1 or 27/28.
pub fn decode_signature(signature: &str) -> Result<(Signature, RecoveryId)> {
    let bytes = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| KmsError::InvalidInput(format!("Signature is not hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(KmsError::InvalidInput(format!(
            "Signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let sig = Signature::from_slice(&bytes[..64])
        .map_err(|e| KmsError::InvalidInput(format!("Invalid signature: {e}")))?;
    let v = bytes[64];
    let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
        .ok_or_else(|| KmsError::InvalidInput(format!("Invalid recovery byte {v}")))?;
    Ok((sig, recovery_id))
}

/// `keccak256(0x19 0x01 ∥ domainSeparator ∥ structHash)`.
pub fn typed_data_hash(domain_separator: &B256, struct_hash: &B256) -> B256 {
    let mut buf = Vec::with_capacity(66);
    buf.extend_from_slice(&[0x19, 0x01]);
    buf.extend_from_slice(domain_separator.as_slice());
    buf.extend_from_slice(struct_hash.as_slice());
    keccak256(buf)
}

/// Build the unsigned EIP-1559 body of a request. Access lists are always empty.
fn eip1559_transaction(tx: &TransactionRequest) -> Result<TxEip1559> {
    let to = match tx.to.as_deref() {
        Some(to) => TxKind::Call(
            to.parse::<Address>()
                .map_err(|e| KmsError::InvalidInput(format!("Invalid 'to' address {to}: {e}")))?,
        ),
        None => TxKind::Create,
    };
    let input = match tx.data.as_deref() {
        Some(data) => Bytes::from(
            hex::decode(data.trim_start_matches("0x"))
                .map_err(|e| KmsError::InvalidInput(format!("Invalid calldata: {e}")))?,
        ),
        None => Bytes::new(),
    };
    Ok(TxEip1559 {
        chain_id: tx.chain_id,
        nonce: tx.nonce,
        gas_limit: tx.gas_limit,
        max_fee_per_gas: tx.max_fee_per_gas,
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
        to,
        value: U256::from(tx.value.unwrap_or(0)),
        access_list: AccessList::default(),
        input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KmsError;
    use crate::kms::derivation::{address_of, derive_address};
    use crate::policy::{CallerRule, SpendingLimitRule};
    use crate::tee::sealed::AesGcmSealedStore;
    use alloy::eips::eip2718::Decodable2718;
    use k256::ecdsa::VerifyingKey;

    const KEY: [u8; 32] = [0x42; 32];

    async fn signer() -> TeeSigner {
        let store = Arc::new(AesGcmSealedStore::from_measurement("signer-test"));
        let key_id = KeyId::from("agent-1/signing/epoch-0");
        store.seal(&key_id.sealed_name(), &KEY).await.unwrap();
        TeeSigner::new(key_id, derive_address(&KEY).unwrap(), store)
    }

    fn recover(hash: &B256, signature: &str) -> String {
        let (sig, recid) = decode_signature(signature).unwrap();
        let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recid).unwrap();
        address_of(&key)
    }

    #[tokio::test]
    async fn test_sign_message_recovers_to_address() {
        let signer = signer().await;
        let signature = signer.sign_message(b"hello").await.unwrap();
        assert_eq!(signature.len(), 2 + 130);
        let v = u8::from_str_radix(&signature[130..], 16).unwrap();
        assert!(v == 27 || v == 28);
        assert_eq!(recover(&eip191_hash_message(b"hello"), &signature), signer.address());
    }

    #[tokio::test]
    async fn test_sign_typed_data() {
        let signer = signer().await;
        let domain = B256::repeat_byte(0x11);
        let struct_hash = B256::repeat_byte(0x22);
        let signature = signer.sign_typed_data(domain, struct_hash).await.unwrap();
        assert_eq!(
            recover(&typed_data_hash(&domain, &struct_hash), &signature),
            signer.address()
        );
    }

    #[test]
    fn test_typed_data_hash_prefix() {
        let d = B256::ZERO;
        let mut expected = vec![0x19, 0x01];
        expected.extend_from_slice(&[0u8; 64]);
        assert_eq!(typed_data_hash(&d, &d), keccak256(expected));
    }

    #[tokio::test]
    async fn test_sign_transaction_envelope() {
        let signer = signer().await;
        let tx = TransactionRequest {
            to: Some("0x000000000000000000000000000000000000dEaD".to_string()),
            value: Some(1_000),
            chain_id: 1,
            nonce: 7,
            gas_limit: 21_000,
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            ..Default::default()
        };
        let signed = signer.sign_transaction(&tx).await.unwrap();
        assert!(signed.signed_tx.starts_with("0x02"));
        assert_eq!(signed.address, signer.address());

        let envelope = hex::decode(&signed.signed_tx[2..]).unwrap();
        assert_eq!(format!("{:#x}", keccak256(&envelope)), signed.hash);

        let decoded = TxEnvelope::decode_2718(&mut envelope.as_slice()).unwrap();
        let TxEnvelope::Eip1559(decoded) = decoded else {
            panic!("expected an EIP-1559 envelope");
        };
        assert_eq!(decoded.tx(), &eip1559_transaction(&tx).unwrap());
        assert_eq!(decoded.tx().nonce, 7);

        let sig = decoded.signature();
        let ecdsa = Signature::from_scalars(sig.r().to_be_bytes::<32>(), sig.s().to_be_bytes::<32>())
            .unwrap();
        let recid = RecoveryId::new(sig.v(), false);
        let key =
            VerifyingKey::recover_from_prehash(decoded.signature_hash().as_slice(), &ecdsa, recid)
                .unwrap();
        assert_eq!(address_of(&key), signer.address());
    }

    #[tokio::test]
    async fn test_signed_transaction_json_shape() {
        let signer = signer().await;
        let tx = TransactionRequest {
            chain_id: 1,
            gas_limit: 21_000,
            ..Default::default()
        };
        let json = serde_json::to_value(signer.sign_transaction(&tx).await.unwrap()).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["address", "hash", "signedTx"]);
        assert_eq!(json["address"], signer.address());
    }

    #[test]
    fn test_deployment_has_no_recipient() {
        let tx = TransactionRequest {
            chain_id: 1,
            data: Some("0x6000".to_string()),
            ..Default::default()
        };
        let unsigned = eip1559_transaction(&tx).unwrap();
        assert_eq!(unsigned.to, TxKind::Create);
        assert_eq!(unsigned.input.as_ref(), &[0x60, 0x00]);
        assert!(unsigned.access_list.is_empty());
        assert_eq!(unsigned.value, U256::ZERO);
    }

    #[tokio::test]
    async fn test_invalid_transaction_fields() {
        let signer = signer().await;
        let bad_to = TransactionRequest {
            to: Some("0x1234".to_string()),
            chain_id: 1,
            ..Default::default()
        };
        assert!(matches!(
            signer.sign_transaction(&bad_to).await.unwrap_err(),
            KmsError::InvalidInput(_)
        ));

        let bad_data = TransactionRequest {
            data: Some("0xzz".to_string()),
            chain_id: 1,
            ..Default::default()
        };
        assert!(matches!(
            signer.sign_transaction(&bad_data).await.unwrap_err(),
            KmsError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_policy_denial_blocks_signing() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(CallerRule::new(["trusted"]));
        let engine = Arc::new(Mutex::new(engine));

        let denied = signer().await.with_policy(engine.clone());
        let err = denied.sign_message(b"hi").await.unwrap_err();
        assert!(err.is_policy_denial());
        match err {
            KmsError::PolicyDenied { rule_name, reason } => {
                assert_eq!(rule_name, "caller-check");
                assert_eq!(reason, "Caller 'unknown' is not in the allowed list");
            }
            other => panic!("unexpected error: {other}"),
        }

        let allowed = signer().await.with_policy(engine).with_caller("trusted");
        assert!(allowed.sign_message(b"hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_spending_limit_applies_to_transactions() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(SpendingLimitRule::new(100, 150));
        let signer = signer().await.with_policy(Arc::new(Mutex::new(engine)));

        let tx = TransactionRequest {
            value: Some(100),
            chain_id: 1,
            ..Default::default()
        };
        assert!(signer.sign_transaction(&tx).await.is_ok());
        let err = signer.sign_transaction(&tx).await.unwrap_err();
        assert!(err.to_string().contains("Daily spending"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_after_policy() {
        let store = Arc::new(AesGcmSealedStore::from_measurement("signer-test"));
        let signer = TeeSigner::new(KeyId::from("ghost/signing/epoch-0"), "0x0", store);
        assert!(matches!(
            signer.sign_message(b"x").await.unwrap_err(),
            KmsError::SealedEntryNotFound(_)
        ));
    }

    #[test]
    fn test_transaction_request_json() {
        let tx: TransactionRequest = serde_json::from_str(
            r#"{"to":"0x000000000000000000000000000000000000dead","value":"1000000000000000000",
                "chainId":1,"gasLimit":21000,"maxFeePerGas":"2","maxPriorityFeePerGas":1}"#,
        )
        .unwrap();
        assert_eq!(tx.value, Some(1_000_000_000_000_000_000));
        assert_eq!(tx.max_fee_per_gas, 2);
        assert_eq!(tx.nonce, 0);
        assert!(tx.data.is_none());
    }

    #[test]
    fn test_decode_signature_rejects_bad_input() {
        assert!(decode_signature("0x1234").is_err());
        assert!(decode_signature(&format!("0x{}", "zz".repeat(65))).is_err());
    }
}
