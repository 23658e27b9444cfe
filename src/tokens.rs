use rand::Rng;
use sha2::{Digest, Sha256};

/// Signs the opaque tokens the server hands out (`$skiptoken`,
/// `$deltatoken`). A token is `hex(payload).hex(sha256(secret || payload))`;
/// clients cannot mint or alter one without the per-service secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: [u8; 32],
}

impl TokenSigner {
    /// Fresh signer with a random per-service secret.
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill(&mut secret);
        TokenSigner { secret }
    }

    pub fn sign(&self, payload: &str) -> String {
        format!("{}.{}", hex(payload.as_bytes()), self.digest(payload))
    }

    /// Verify a token and recover its payload.
    pub fn verify(&self, token: &str) -> Option<String> {
        let (payload_hex, sig) = token.split_once('.')?;
        let payload_bytes = unhex(payload_hex)?;
        let payload = String::from_utf8(payload_bytes).ok()?;
        if self.digest(&payload) == sig {
            Some(payload)
        } else {
            None
        }
    }

    fn digest(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(payload.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Default for TokenSigner {
    fn default() -> Self {
        Self::new()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
