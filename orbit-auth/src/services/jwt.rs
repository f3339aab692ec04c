use std::collections::HashMap;
use std::fs;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ServiceError;
use crate::config::JwtConfig;
use crate::models::{AccessTokenRecord, SigningKey};

/// Access tokens always live this long; callers cannot choose an expiry.
pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

/// Claims carried by every access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenClaims {
    /// Subject: the user id, or the client id for `client_credentials`.
    pub sub: String,
    /// Audience: the client the token was issued to.
    pub aud: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub client_id: String,
    pub orbit_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> Option<Uuid> {
        if self.sub == self.client_id {
            return None;
        }
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.sid.as_deref().and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

/// What the caller decides about a token. Issuer, `jti` and lifetime are the signer's.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub orbit_id: Uuid,
    pub subject: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub roles: Vec<String>,
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub claims: AccessTokenClaims,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedToken {
    pub fn jti(&self) -> &str {
        &self.claims.jti
    }

    pub fn expires_in(&self) -> i64 {
        ACCESS_TOKEN_TTL_SECONDS
    }

    /// Store record for this token, optionally linked to the refresh token that produced it.
    pub fn record(&self, refresh_token_id: Option<Uuid>) -> AccessTokenRecord {
        AccessTokenRecord {
            jti: self.claims.jti.clone(),
            orbit_id: self.claims.orbit_id,
            client_id: self.claims.client_id.clone(),
            user_id: self.claims.user_id(),
            session_id: self.claims.session_id(),
            refresh_token_id,
            scopes: self.claims.scope.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            revoked: false,
        }
    }
}

/// Public JWK as published on the JWKS endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Clone)]
struct VerificationKey {
    decoding: DecodingKey,
    jwk: Jwk,
}

/// RS256 signer plus every key still accepted for verification, indexed by `kid`.
#[derive(Clone)]
pub struct TokenSigner {
    issuer: String,
    active_kid: String,
    encoding_key: EncodingKey,
    keys: HashMap<String, VerificationKey>,
}

impl TokenSigner {
    /// Load the active key pair and any retired public keys from disk.
    pub fn from_config(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_pem = read_pem(&config.private_key_path, "private")?;
        let public_pem = read_pem(&config.public_key_path, "public")?;

        let mut previous = Vec::with_capacity(config.previous_keys.len());
        for (kid, path) in &config.previous_keys {
            previous.push((kid.clone(), read_pem(path, "previous public")?));
        }

        let signer = Self::from_pems(&config.issuer, &config.key_id, &private_pem, &public_pem)?
            .with_previous_keys(&previous)?;

        tracing::info!(
            kid = %config.key_id,
            verification_keys = signer.keys.len(),
            "Token signer initialized with RS256 keys"
        );
        Ok(signer)
    }

    pub fn from_pems(
        issuer: &str,
        kid: &str,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let mut keys = HashMap::new();
        keys.insert(kid.to_string(), verification_key(kid, public_pem)?);

        Ok(Self {
            issuer: issuer.to_string(),
            active_kid: kid.to_string(),
            encoding_key,
            keys,
        })
    }

    /// Accept tokens signed by retired keys. The active key cannot be replaced this way.
    pub fn with_previous_keys(mut self, previous: &[(String, String)]) -> Result<Self, anyhow::Error> {
        for (kid, public_pem) in previous {
            if *kid == self.active_kid {
                anyhow::bail!("Previous key id '{}' collides with the active key", kid);
            }
            self.keys.insert(kid.clone(), verification_key(kid, public_pem)?);
        }
        Ok(self)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// Sign a fresh access token with a new `jti` and the fixed lifetime.
    pub fn sign(&self, grant: TokenGrant) -> Result<SignedToken, ServiceError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::seconds(ACCESS_TOKEN_TTL_SECONDS);

        let claims = AccessTokenClaims {
            sub: grant.subject,
            aud: grant.client_id.clone(),
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: grant.scopes,
            roles: grant.roles,
            client_id: grant.client_id,
            orbit_id: grant.orbit_id,
            sid: grant.session_id.map(|id| id.to_string()),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.active_kid.clone());

        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to sign access token: {}", e)))?;

        Ok(SignedToken {
            token,
            claims,
            issued_at,
            expires_at,
        })
    }

    /// Verify signature, algorithm, issuer, expiry and, when given, audience.
    ///
    /// Revocation is not consulted here.
    pub fn verify(&self, token: &str, audience: Option<&str>) -> Result<AccessTokenClaims, ServiceError> {
        let header = decode_header(token).map_err(|_| ServiceError::InvalidToken)?;
        if header.alg != Algorithm::RS256 {
            return Err(ServiceError::InvalidToken);
        }
        let key = header
            .kid
            .as_deref()
            .and_then(|kid| self.keys.get(kid))
            .ok_or(ServiceError::InvalidToken)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        decode::<AccessTokenClaims>(token, &key.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ServiceError::Expired,
                _ => ServiceError::InvalidToken,
            })
    }

    /// Active key first, then retired keys ordered by `kid`.
    pub fn jwks(&self) -> JwkSet {
        let mut keys: Vec<Jwk> = self.keys.values().map(|k| k.jwk.clone()).collect();
        keys.sort_by(|a, b| {
            (a.kid != self.active_kid, &a.kid).cmp(&(b.kid != self.active_kid, &b.kid))
        });
        JwkSet { keys }
    }

    pub fn signing_key_record(&self) -> Result<SigningKey, anyhow::Error> {
        let jwk = self
            .keys
            .get(&self.active_kid)
            .map(|k| k.jwk.clone())
            .ok_or_else(|| anyhow::anyhow!("Active key missing from key ring"))?;
        let now = Utc::now();

        Ok(SigningKey {
            kid: self.active_kid.clone(),
            orbit_id: None,
            algorithm: "RS256".to_string(),
            public_jwk: serde_json::to_value(jwk)?,
            not_before: now,
            expires_at: None,
            is_active: true,
            created_at: now,
        })
    }
}

fn read_pem(path: &str, label: &str) -> Result<String, anyhow::Error> {
    fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {} key from {}: {}", label, path, e))
}

fn verification_key(kid: &str, public_pem: &str) -> Result<VerificationKey, anyhow::Error> {
    let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse public key '{}': {}", kid, e))?;
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| anyhow::anyhow!("Failed to parse public key '{}': {}", kid, e))?;

    Ok(VerificationKey {
        decoding,
        jwk: Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: "RS256".to_string(),
            kid: kid.to_string(),
            n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        },
    })
}
