#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use errand_domain::{IdentityId, Role};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::SecretString;
use crate::util::time::unix_secs_now;

/// Identity attached to a session once its credential checks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
	pub identity: IdentityId,
	pub role: Role,
}

/// Checks a handshake credential against the external identity system.
pub trait IdentityVerifier: Send + Sync {
	fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
}

/// Accepts HMAC-signed access tokens and, optionally, a static service token.
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
	hmac_secret: Option<SecretString>,
	service_token: Option<SecretString>,
}

/// Identity assigned to callers presenting the service token.
pub const SYSTEM_IDENTITY: &str = "system";

impl TokenVerifier {
	pub fn new(hmac_secret: Option<SecretString>, service_token: Option<SecretString>) -> Self {
		Self {
			hmac_secret,
			service_token,
		}
	}

	pub fn is_configured(&self) -> bool {
		self.hmac_secret.is_some() || self.service_token.is_some()
	}
}

impl IdentityVerifier for TokenVerifier {
	fn verify(&self, token: &str) -> anyhow::Result<VerifiedIdentity> {
		let token = token.trim();
		if token.is_empty() {
			return Err(anyhow!("missing token"));
		}

		if let Some(expected) = &self.service_token
			&& constant_time_eq(expected.expose().as_bytes(), token.as_bytes())
		{
			return Ok(VerifiedIdentity {
				identity: IdentityId::new(SYSTEM_IDENTITY)?,
				role: Role::System,
			});
		}

		let Some(secret) = &self.hmac_secret else {
			return Err(anyhow!("no token verifier configured"));
		};

		let claims = verify_hmac_token(token, secret.expose())?;
		let role = match claims.role.as_deref() {
			Some(role) => role.parse::<Role>().context("token role")?,
			None => Role::Customer,
		};
		let identity = IdentityId::new(claims.sub).context("token subject")?;

		Ok(VerifiedIdentity { identity, role })
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Issue a `v1` token for `claims`.
#[allow(dead_code)]
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
