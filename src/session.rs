//! Authentication against Kohler Konnect.
//!
//! Two sequential calls turn a username and password into a [`Session`]:
//! 1. an anonymous service-token call over mutual TLS (pinned client
//!    certificate) that hands out the per-session subscription ("APIM") key;
//! 2. a resource-owner-password-credentials exchange against the Azure B2C
//!    token endpoint that hands out the bearer user token.
//!
//! The tenant id is read from the unverified payload of the user token. Tokens
//! are never refreshed; a new session means running both steps again.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use crate::client::{KohlerClientError, build_agent, read_json};
use crate::models::kohler::TenantId;

const SERVICE_TOKEN_URL: &str = "https://az-amer-prod-kohlerkonnect-apim.azure-api.net/token/api/v1/token/";
const SERVICE_TOKEN_APIM_KEY: &str = "ca2f50cbc01845e9af356f866b16c9f1";
const B2C_TOKEN_URL: &str =
    "https://konnectkohler.b2clogin.com/konnectkohler.onmicrosoft.com/B2C_1_ROPC_Auth/oauth2/v2.0/token";
const B2C_CLIENT_ID: &str = "8caf9530-1d13-48e6-867c-0f082878debc";
const B2C_SCOPE: &str = "openid https://konnectkohler.onmicrosoft.com/f5d87f3d-bdeb-4933-ab70-ef56cc343744/apiaccess offline_access";

/// PEM-encoded client certificate and private key for the pinned channel.
#[derive(Clone)]
pub struct ClientIdentity {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Source of the client identity presented on the service-token call.
pub trait CertificateProvider: Send + Sync {
    fn client_identity(&self) -> Result<ClientIdentity, KohlerClientError>;
}

/// Reads the identity from two PEM files on disk.
#[derive(Debug, Clone)]
pub struct PemFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl CertificateProvider for PemFiles {
    fn client_identity(&self) -> Result<ClientIdentity, KohlerClientError> {
        let read = |path: &PathBuf| {
            std::fs::read(path)
                .map_err(|e| KohlerClientError::Certificate(format!("failed to read {}: {}", path.display(), e)))
        };
        Ok(ClientIdentity {
            certificate_pem: read(&self.certificate)?,
            private_key_pem: read(&self.private_key)?,
        })
    }
}

/// Bearer token, subscription key and tenant for one account.
#[derive(Clone)]
pub struct Session {
    tenant_id: TenantId,
    user_token: String,
    apim_key: String,
}

// secrets stay out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("user_token", &"<redacted>")
            .field("apim_key", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn new(tenant_id: TenantId, user_token: String, apim_key: String) -> Self {
        Session {
            tenant_id,
            user_token,
            apim_key,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Headers for every authorized call; fails when the session is incomplete.
    pub fn authorization(&self) -> Result<[(&'static str, String); 4], KohlerClientError> {
        if self.user_token.is_empty() || self.apim_key.is_empty() {
            return Err(KohlerClientError::MissingAuth);
        }
        Ok([
            ("Authorization", format!("Bearer {}", self.user_token)),
            ("Ocp-Apim-Subscription-Key", self.apim_key.clone()),
            ("Accept", "application/json".to_string()),
            ("Content-Type", "application/json".to_string()),
        ])
    }
}

/// Where the two token calls go.
#[derive(Debug, Clone)]
pub struct TokenEndpoints {
    pub service_token: String,
    pub user_token: String,
}

impl Default for TokenEndpoints {
    fn default() -> Self {
        TokenEndpoints {
            service_token: SERVICE_TOKEN_URL.to_string(),
            user_token: B2C_TOKEN_URL.to_string(),
        }
    }
}

/// Owns the transports and runs the two-step authentication.
pub struct SessionManager {
    certificates: Box<dyn CertificateProvider>,
    endpoints: TokenEndpoints,
    mtls: Mutex<Option<ureq::Agent>>,
    plain: ureq::Agent,
}

impl SessionManager {
    pub fn new(certificates: impl CertificateProvider + 'static) -> Self {
        SessionManager::with_endpoints(certificates, TokenEndpoints::default())
    }

    pub fn with_endpoints(certificates: impl CertificateProvider + 'static, endpoints: TokenEndpoints) -> Self {
        SessionManager {
            certificates: Box::new(certificates),
            endpoints,
            mtls: Mutex::new(None),
            plain: build_agent(None),
        }
    }

    /// Agent without a client certificate, used for everything but the service token.
    pub fn plain_agent(&self) -> ureq::Agent {
        self.plain.clone()
    }

    /// The pinned-certificate agent, built on first use and reused afterwards.
    fn mtls_agent(&self) -> Result<ureq::Agent, KohlerClientError> {
        let mut slot = self.mtls.lock();
        if let Some(agent) = slot.as_ref() {
            return Ok(agent.clone());
        }
        let identity = self.certificates.client_identity()?;
        let agent = build_agent(Some(tls_config(&identity)?));
        debug!("Built mutual-TLS agent");
        *slot = Some(agent.clone());
        Ok(agent)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<Session, KohlerClientError> {
        let apim_key = self.fetch_service_token()?;
        let user_token = self.fetch_user_token(username, password)?;
        let tenant_id = tenant_id_from_token(&user_token)?;
        info!("Authenticated to Kohler Konnect (tenant {})", tenant_id);
        Ok(Session::new(tenant_id, user_token, apim_key))
    }

    fn fetch_service_token(&self) -> Result<String, KohlerClientError> {
        #[derive(Deserialize)]
        struct ServiceToken {
            apim_key: String,
        }

        let resp = self
            .mtls_agent()?
            .get(&self.endpoints.service_token)
            .header("Ocp-Apim-Subscription-Key", SERVICE_TOKEN_APIM_KEY)
            .header("Accept", "application/json")
            .call();
        let ServiceToken { apim_key } =
            read_json(resp).map_err(|e| KohlerClientError::Auth(format!("service token: {}", e)))?;
        debug!("Service token fetched, subscription key acquired");
        Ok(apim_key)
    }

    fn fetch_user_token(&self, username: &str, password: &str) -> Result<String, KohlerClientError> {
        #[derive(Deserialize)]
        struct UserToken {
            access_token: String,
        }

        let resp = self.plain.post(&self.endpoints.user_token).header("Accept", "application/json").send_form([
            ("grant_type", "password"),
            ("client_id", B2C_CLIENT_ID),
            ("username", username),
            ("password", password),
            ("scope", B2C_SCOPE),
        ]);
        let UserToken { access_token } =
            read_json(resp).map_err(|e| KohlerClientError::Auth(format!("user token: {}", e)))?;
        debug!("User token fetched");
        Ok(access_token)
    }
}

fn tls_config(identity: &ClientIdentity) -> Result<ureq::tls::TlsConfig, KohlerClientError> {
    use ureq::tls::{Certificate, ClientCert, PrivateKey, TlsConfig};

    let certificate = Certificate::from_pem(&identity.certificate_pem)
        .map_err(|e| KohlerClientError::Certificate(format!("certificate: {}", e)))?;
    let key = PrivateKey::from_pem(&identity.private_key_pem)
        .map_err(|e| KohlerClientError::Certificate(format!("private key: {}", e)))?;
    Ok(TlsConfig::builder()
        .client_cert(Some(ClientCert::new_with_certs(&[certificate], key)))
        .build())
}

/// Extract the tenant id from a JWT without verifying it: `oid`, else `sub`.
pub fn tenant_id_from_token(token: &str) -> Result<TenantId, KohlerClientError> {
    #[derive(Deserialize)]
    struct Claims {
        oid: Option<String>,
        sub: Option<String>,
    }

    let segments: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(KohlerClientError::Auth(format!(
            "user token has {} segment(s), expected 3",
            segments.len()
        )));
    };

    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let decoded = URL_SAFE
        .decode(padded.as_bytes())
        .map_err(|e| KohlerClientError::Auth(format!("user token payload is not base64: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&decoded)
        .map_err(|e| KohlerClientError::Auth(format!("user token payload is not a JSON object: {}", e)))?;

    claims
        .oid
        .filter(|s| !s.is_empty())
        .or(claims.sub.filter(|s| !s.is_empty()))
        .map(TenantId)
        .ok_or_else(|| KohlerClientError::Auth("user token carries neither oid nor sub".to_string()))
}
