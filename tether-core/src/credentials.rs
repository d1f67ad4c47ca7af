//! Short-lived signed authentication tokens.
//!
//! The [`CredentialProvider`] is a local, offline signer: a BLAKE3 keyed
//! hash over the token claims, keyed by a value derived from the
//! pre-shared secret. Tokens are never written to disk.
//!
//! Wire form: `subject.issued_ms.expires_ms.signature_hex`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::clock::{Clock, SystemClock, from_unix_millis, unix_millis};
use crate::config::MIN_SECRET_LEN;
use crate::error::TetherError;

const KEY_CONTEXT: &str = "tether 2024-06 auth token signing key";

// ── AuthToken ────────────────────────────────────────────────────

/// An issued token. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    subject: String,
    issued_at: SystemTime,
    expires_at: SystemTime,
    signature: blake3::Hash,
}

impl AuthToken {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Total lifetime granted at issuance.
    pub fn lifetime(&self) -> Duration {
        self.expires_at
            .duration_since(self.issued_at)
            .unwrap_or(Duration::ZERO)
    }

    /// Lifetime left at `now`; zero once expired.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// `true` while `now < expires_at`.
    pub fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// `true` once `fraction` of the lifetime or less remains.
    pub fn needs_refresh(&self, now: SystemTime, fraction: f64) -> bool {
        self.remaining(now) <= self.lifetime().mul_f64(fraction)
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.subject,
            unix_millis(self.issued_at),
            unix_millis(self.expires_at),
            self.signature.to_hex()
        )
    }

    /// Parse the wire form. Does not check the signature.
    pub fn decode(encoded: &str) -> Result<Self, TetherError> {
        let mut parts = encoded.split('.');
        let (Some(subject), Some(issued), Some(expires), Some(sig), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(TetherError::Protocol("token must have four segments".into()));
        };
        let issued: u64 = issued
            .parse()
            .map_err(|_| TetherError::Protocol("invalid issued-at".into()))?;
        let expires: u64 = expires
            .parse()
            .map_err(|_| TetherError::Protocol("invalid expires-at".into()))?;
        let signature = blake3::Hash::from_hex(sig)
            .map_err(|_| TetherError::Protocol("invalid signature encoding".into()))?;
        Ok(Self {
            subject: subject.to_string(),
            issued_at: from_unix_millis(issued),
            expires_at: from_unix_millis(expires),
            signature,
        })
    }
}

// ── CredentialProvider ───────────────────────────────────────────

/// Issues and verifies tokens. Holds only the derived key and a clock.
#[derive(Clone)]
pub struct CredentialProvider {
    key: Option<[u8; 32]>,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("key", &self.key.map(|_| "<redacted>"))
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl CredentialProvider {
    /// Build a provider on the system clock.
    ///
    /// An absent or too-short secret is accepted here and reported as
    /// `ConfigurationError` by [`issue`](Self::issue).
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self::with_clock(secret, lifetime, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, lifetime: Duration, clock: Arc<dyn Clock>) -> Self {
        let key = (secret.len() >= MIN_SECRET_LEN)
            .then(|| blake3::derive_key(KEY_CONTEXT, secret.as_bytes()));
        Self {
            key,
            lifetime,
            clock,
        }
    }

    /// Current wall time according to this provider's clock.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Issue a fresh token for `subject`.
    pub fn issue(&self, subject: &str) -> Result<AuthToken, TetherError> {
        self.issue_at(subject, self.clock.now())
    }

    /// Issue a token as of `now`.
    pub fn issue_at(&self, subject: &str, now: SystemTime) -> Result<AuthToken, TetherError> {
        let key = self.key()?;
        if subject.is_empty() || subject.contains('.') {
            return Err(TetherError::Configuration(format!(
                "invalid token subject {subject:?}"
            )));
        }
        // Round to the wire's millisecond precision so decode(encode(t)) == t.
        let issued_at = from_unix_millis(unix_millis(now));
        let expires_at = issued_at + self.lifetime;
        let signature = sign(key, subject, issued_at, expires_at);
        Ok(AuthToken {
            subject: subject.to_string(),
            issued_at,
            expires_at,
            signature,
        })
    }

    /// Pure validity check: signature matches and `now < expires_at`.
    pub fn is_valid(&self, token: &AuthToken, now: SystemTime) -> bool {
        let Ok(key) = self.key() else {
            return false;
        };
        // blake3::Hash equality is constant-time.
        token.is_live(now)
            && now >= token.issued_at
            && sign(key, &token.subject, token.issued_at, token.expires_at) == token.signature
    }

    /// Decode and validate a wire token (host side).
    pub fn verify(&self, encoded: &str, now: SystemTime) -> Result<AuthToken, TetherError> {
        let token = AuthToken::decode(encoded)?;
        if self.is_valid(&token, now) {
            Ok(token)
        } else {
            Err(TetherError::AuthRejected("token invalid or expired".into()))
        }
    }

    fn key(&self) -> Result<&[u8; 32], TetherError> {
        self.key.as_ref().ok_or_else(|| {
            TetherError::Configuration(format!(
                "signing secret absent or shorter than {MIN_SECRET_LEN} bytes"
            ))
        })
    }
}

fn sign(key: &[u8; 32], subject: &str, issued: SystemTime, expires: SystemTime) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(subject.as_bytes());
    hasher.update(&[0]);
    hasher.update(&unix_millis(issued).to_le_bytes());
    hasher.update(&unix_millis(expires).to_le_bytes());
    hasher.finalize()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "correct horse battery staple";

    fn provider() -> CredentialProvider {
        CredentialProvider::new(SECRET, Duration::from_secs(3600))
    }

    fn t0() -> SystemTime {
        from_unix_millis(1_700_000_000_000)
    }

    #[test]
    fn issue_and_validate() {
        let p = provider();
        let token = p.issue_at("agent", t0()).unwrap();
        assert_eq!(token.subject(), "agent");
        assert_eq!(token.lifetime(), Duration::from_secs(3600));
        assert!(p.is_valid(&token, t0()));
        assert!(p.is_valid(&token, t0() + Duration::from_secs(3599)));
    }

    #[test]
    fn expired_at_exact_deadline() {
        let p = provider();
        let token = p.issue_at("agent", t0()).unwrap();
        assert!(!p.is_valid(&token, token.expires_at()));
        assert!(!token.is_live(token.expires_at()));
    }

    #[test]
    fn missing_secret_is_configuration_error() {
        let p = CredentialProvider::new("", Duration::from_secs(60));
        assert!(matches!(p.issue("agent"), Err(TetherError::Configuration(_))));

        let p = CredentialProvider::new("short", Duration::from_secs(60));
        assert!(matches!(p.issue("agent"), Err(TetherError::Configuration(_))));
    }

    #[test]
    fn other_secret_rejects() {
        let token = provider().issue_at("agent", t0()).unwrap();
        let other = CredentialProvider::new("a completely different secret", Duration::from_secs(3600));
        assert!(!other.is_valid(&token, t0()));
    }

    #[test]
    fn encode_decode_verify() {
        let p = provider();
        let token = p.issue_at("agent", t0()).unwrap();
        let wire = token.encode();
        assert_eq!(AuthToken::decode(&wire).unwrap(), token);
        assert!(p.verify(&wire, t0() + Duration::from_secs(10)).is_ok());
        assert!(p.verify(&wire, t0() + Duration::from_secs(7200)).is_err());
    }

    #[test]
    fn tampered_expiry_fails_signature() {
        let p = provider();
        let token = p.issue_at("agent", t0()).unwrap();
        let wire = token.encode();
        let mut parts: Vec<&str> = wire.split('.').collect();
        let extended = (unix_millis(token.expires_at()) + 3_600_000).to_string();
        parts[2] = &extended;
        let forged = parts.join(".");
        assert!(p.verify(&forged, t0() + Duration::from_secs(4000)).is_err());
    }

    #[test]
    fn malformed_wire_token() {
        assert!(AuthToken::decode("only.three.parts").is_err());
        assert!(AuthToken::decode("a.b.c.d").is_err());
        assert!(AuthToken::decode("a.1.2.3.4").is_err());
    }

    #[test]
    fn refresh_due_at_ten_percent() {
        let token = provider().issue_at("agent", t0()).unwrap();
        assert!(!token.needs_refresh(t0() + Duration::from_secs(3000), 0.1));
        assert!(token.needs_refresh(t0() + Duration::from_secs(3240), 0.1));
        assert!(token.needs_refresh(t0() + Duration::from_secs(4000), 0.1));
        assert_eq!(token.remaining(t0() + Duration::from_secs(4000)), Duration::ZERO);
    }

    #[test]
    fn subject_with_separator_rejected() {
        assert!(provider().issue_at("a.b", t0()).is_err());
    }
}
