//! Blocking HTTP client for the Kohler Konnect device API.
//!
//! - Blocking client using `ureq` (no async); callers on the tokio runtime go
//!   through `spawn_blocking`.
//! - Needs an authenticated [`Session`] from [`crate::session::SessionManager`].
//! - Covers the device directory, the two per-device state documents, the
//!   preset catalogue and the four GCS commands.
//!
//! Every call carries the bearer token and the per-session subscription key;
//! none of them present the client certificate.

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::models::kohler::*;
use crate::services::overlay::ShowerCommands;
use crate::services::state::DeviceApi;
use crate::session::{Session, SessionManager};

pub const API_BASE: &str = "https://api-kohler-us.kohler.io";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum KohlerClientError {
    MissingAuth,
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    Auth(String),
    Certificate(String),
}

impl core::fmt::Display for KohlerClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KohlerClientError::MissingAuth => write!(f, "session is missing its user token or subscription key"),
            KohlerClientError::Transport(s) => write!(f, "transport error: {}", s),
            KohlerClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            KohlerClientError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            KohlerClientError::Auth(e) => write!(f, "auth error: {}", e),
            KohlerClientError::Certificate(e) => write!(f, "client certificate error: {}", e),
        }
    }
}

impl std::error::Error for KohlerClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KohlerClientError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for KohlerClientError {
    fn from(value: serde_path_to_error::Error<serde_json::Error>) -> Self {
        KohlerClientError::Json(value)
    }
}

impl From<ureq::Error> for KohlerClientError {
    fn from(value: ureq::Error) -> Self {
        KohlerClientError::Transport(value.to_string())
    }
}

type HttpResult = Result<http::Response<ureq::Body>, ureq::Error>;

/// Build an agent with the fixed timeout. Status codes are checked by us so the
/// error body can be surfaced.
pub(crate) fn build_agent(tls: Option<ureq::tls::TlsConfig>) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .http_status_as_error(false);
    if let Some(tls) = tls {
        config = config.tls_config(tls);
    }
    config.build().into()
}

fn read_body(resp: HttpResult) -> Result<String, KohlerClientError> {
    let mut res = resp?;
    let status = res.status();
    if !status.is_success() {
        let body = res
            .body_mut()
            .read_to_string()
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(KohlerClientError::Http {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(res.body_mut().read_to_string()?)
}

/// Check the status and decode a JSON body, reporting the path of a bad field.
pub(crate) fn read_json<T: DeserializeOwned>(resp: HttpResult) -> Result<T, KohlerClientError> {
    let body = read_body(resp)?;
    let de = &mut serde_json::Deserializer::from_str(&body);
    Ok(serde_path_to_error::deserialize(de)?)
}

/// Like [`read_json`] but an empty success body becomes `Value::Null`.
fn read_document(resp: HttpResult) -> Result<Value, KohlerClientError> {
    let body = read_body(resp)?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let de = &mut serde_json::Deserializer::from_str(&body);
    Ok(serde_path_to_error::deserialize(de)?)
}

pub struct KohlerClient {
    agent: ureq::Agent,
    session: Session,
    base_url: String,
    devices: Mutex<Vec<Device>>,
}

impl KohlerClient {
    pub fn new(agent: ureq::Agent, session: Session) -> Self {
        KohlerClient::with_base_url(agent, session, API_BASE)
    }

    pub fn with_base_url(agent: ureq::Agent, session: Session, base_url: &str) -> Self {
        KohlerClient {
            agent,
            session,
            base_url: base_url.trim_end_matches('/').to_string(),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Run the full two-step authentication and wrap the result in a client.
    pub fn connect(manager: &SessionManager, username: &str, password: &str) -> Result<Self, KohlerClientError> {
        let session = manager.authenticate(username, password)?;
        Ok(KohlerClient::new(manager.plain_agent(), session))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, KohlerClientError> {
        let mut req = self.agent.get(self.url(path));
        for (name, value) in self.session.authorization()? {
            req = req.header(name, value);
        }
        debug!("GET {}", path);
        read_json(req.call())
    }

    fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Value, KohlerClientError> {
        let mut req = self.agent.post(self.url(path));
        for (name, value) in self.session.authorization()? {
            req = req.header(name, value);
        }
        debug!("POST {}", path);
        read_document(req.send_json(body))
    }

    /// Fetch the tenant's homes and flatten them into one device list.
    ///
    /// Replaces the cached list wholesale.
    pub fn list_devices(&self) -> Result<Vec<Device>, KohlerClientError> {
        let path = format!(
            "/devices/api/v1/device-management/customer-device/{}",
            self.session.tenant_id()
        );
        let directory: CustomerDevices = self.get_json(&path)?;
        let devices = directory.into_devices();
        debug!("Directory returned {} device(s)", devices.len());
        *self.devices.lock() = devices.clone();
        Ok(devices)
    }

    pub fn cached_devices(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }

    pub fn get_advanced_state(&self, device_id: &DeviceId) -> Result<AdvancedState, KohlerClientError> {
        self.get_json(&format!(
            "/devices/api/v1/device-management/gcs-state/gcsadvancestate/{}",
            device_id
        ))
    }

    pub fn get_connectivity_state(&self, device_id: &DeviceId) -> Result<ConnectivityState, KohlerClientError> {
        self.get_json(&format!("/devices/api/v1/device-management/evo-state/{}", device_id))
    }

    /// Saved presets and experiences for the tenant, as the raw document.
    pub fn list_presets(&self) -> Result<Value, KohlerClientError> {
        self.get_json(&format!(
            "/devices/api/v1/device-management/customer-experience/{}",
            self.session.tenant_id()
        ))
    }

    fn send_command(&self, device_id: &DeviceId, action: CommandAction) -> Result<Value, KohlerClientError> {
        debug!("Sending {} command to {}", action.name(), device_id);
        let path = action.path();
        let body = CommandBody::new(device_id, self.session.tenant_id(), action);
        self.post_json(path, &body)
    }

    pub fn start_warmup(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError> {
        self.send_command(device_id, CommandAction::Warmup {})
    }

    pub fn start_preset(&self, device_id: &DeviceId, preset_id: &str) -> Result<Value, KohlerClientError> {
        self.send_command(
            device_id,
            CommandAction::StartPreset {
                preset_or_experience_id: preset_id.to_string(),
            },
        )
    }

    pub fn stop(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError> {
        self.send_command(device_id, CommandAction::stop())
    }

    pub fn configure_outlet(&self, device_id: &DeviceId, config: &OutletConfig) -> Result<Value, KohlerClientError> {
        self.send_command(device_id, CommandAction::outlet(config))
    }
}

impl DeviceApi for KohlerClient {
    fn cached_devices(&self) -> Vec<Device> {
        KohlerClient::cached_devices(self)
    }

    fn list_devices(&self) -> Result<Vec<Device>, KohlerClientError> {
        KohlerClient::list_devices(self)
    }

    fn advanced_state(&self, device_id: &DeviceId) -> Result<AdvancedState, KohlerClientError> {
        self.get_advanced_state(device_id)
    }

    fn connectivity_state(&self, device_id: &DeviceId) -> Result<ConnectivityState, KohlerClientError> {
        self.get_connectivity_state(device_id)
    }
}

impl ShowerCommands for KohlerClient {
    fn start_warmup(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError> {
        KohlerClient::start_warmup(self, device_id)
    }

    fn start_preset(&self, device_id: &DeviceId, preset_id: &str) -> Result<Value, KohlerClientError> {
        KohlerClient::start_preset(self, device_id, preset_id)
    }

    fn stop(&self, device_id: &DeviceId) -> Result<Value, KohlerClientError> {
        KohlerClient::stop(self, device_id)
    }

    fn configure_outlet(&self, device_id: &DeviceId, config: &OutletConfig) -> Result<Value, KohlerClientError> {
        KohlerClient::configure_outlet(self, device_id, config)
    }
}
