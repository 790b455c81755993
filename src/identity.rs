use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::store::AgentStore;

/// Outcome of a credential check. Checks never raise; callers branch on the
/// verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No key was presented.
    Missing,
    /// The process-wide bootstrap key. Only ever authorizes a first-time
    /// registration.
    BootstrapOk,
    /// The per-agent key issued at registration.
    AgentKeyOk,
    Mismatch,
}

/// Issues and verifies agent credentials. The per-agent key is returned to
/// the agent exactly once; only its SHA-256 hash is stored.
pub struct TokenService {
    bootstrap_key: String,
    agents: Arc<dyn AgentStore>,
}

impl TokenService {
    pub fn new(bootstrap_key: String, agents: Arc<dyn AgentStore>) -> Self {
        Self {
            bootstrap_key,
            agents,
        }
    }

    /// Check a presented key against the agent's stored hash and the
    /// bootstrap key. The agent key wins when both match.
    pub async fn verify(&self, agent_id: &str, presented: Option<&str>) -> Verdict {
        let Some(presented) = presented else {
            return Verdict::Missing;
        };
        if presented.is_empty() {
            return Verdict::Missing;
        }

        let stored_hash = match self.agents.get(agent_id).await {
            Ok(agent) => agent.and_then(|a| a.api_key_hash),
            Err(e) => {
                tracing::error!(error = %e, agent_id, "credential lookup failed");
                return Verdict::Mismatch;
            }
        };

        let presented_hash = hash_key(presented);
        if let Some(stored) = stored_hash
            && ct_eq(presented_hash.as_bytes(), stored.as_bytes())
        {
            return Verdict::AgentKeyOk;
        }

        // Compare through hashes so the bootstrap check is also constant-time.
        if !self.bootstrap_key.is_empty()
            && ct_eq(
                presented_hash.as_bytes(),
                hash_key(&self.bootstrap_key).as_bytes(),
            )
        {
            return Verdict::BootstrapOk;
        }

        Verdict::Mismatch
    }
}

/// Generate a per-agent API key. Returns `(raw_key, sha256_hash)`.
/// Format: 32 random bytes as lowercase hex (64 chars on the wire).
pub fn issue_agent_key() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    let raw = hex::encode(bytes);
    let hash = hash_key(&raw);
    (raw, hash)
}

/// SHA-256 hash of a key string, returned as lowercase hex.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time byte comparison: the loop touches every byte regardless of
/// where the first difference is.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
