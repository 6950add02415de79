//! Verification of operator-signed experiments.
//!
//! Experiments are compact RS256 JWS tokens. Public keys are identified by
//! the lowercase hex SHA-256 of their PEM text, which is what experiment rows
//! store as `signing_key_id`.

use std::collections::HashMap;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// Test name whose `args.urls` list fans out into per-URL work.
const WEB_CONNECTIVITY: &str = "web_connectivity";

/// Claims carried by a signed experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentClaims {
    #[serde(default)]
    pub probe_cc: Vec<String>,
    pub test_name: String,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub args: Value,
}

impl ExperimentClaims {
    /// Indexes of the experiment arguments a single probe should run.
    pub fn args_idx(&self) -> Vec<u32> {
        if self.test_name != WEB_CONNECTIVITY {
            return Vec::new();
        }
        let urls = self
            .args
            .get("urls")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        (0..urls as u32).collect()
    }
}

/// Public keys trusted to sign experiments, by fingerprint.
pub struct Keystore {
    keys: HashMap<String, DecodingKey>,
}

impl Keystore {
    /// Build from `fingerprint -> PEM` pairs. Keys that fail to parse are
    /// logged and left out.
    pub fn from_pems(pems: HashMap<String, String>) -> Self {
        let mut keys = HashMap::with_capacity(pems.len());
        for (key_id, pem) in pems {
            match DecodingKey::from_rsa_pem(pem.as_bytes()) {
                Ok(key) => {
                    keys.insert(key_id, key);
                }
                Err(e) => warn!(%key_id, error = %e, "ignoring unparsable signing key"),
            }
        }
        Self { keys }
    }

    /// Fingerprint of a PEM-encoded public key.
    pub fn fingerprint(pem: &str) -> String {
        hex::encode(Sha256::digest(pem.as_bytes()))
    }

    /// Check `token` against the key `key_id` and return its claims.
    ///
    /// Expiry is not enforced: a scheduled experiment keeps running for as
    /// long as its schedule says.
    pub fn verify(&self, key_id: &str, token: &str) -> Result<ExperimentClaims> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| SchedulerError::Signature(format!("unknown signing key {key_id}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<ExperimentClaims>(token, key, &validation)
            .map_err(|e| SchedulerError::Signature(e.to_string()))?;
        Ok(data.claims)
    }
}
