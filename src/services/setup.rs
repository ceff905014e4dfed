use crate::client::{KohlerClient, KohlerClientError};
use crate::models::kohler::Device;
use crate::session::SessionManager;
use crate::services::state::DeviceApi;
use log::info;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Why an account could not be set up.
#[derive(Debug)]
pub enum SetupError {
    /// Authentication or the directory call failed.
    CannotConnect(KohlerClientError),
    /// Credentials work but the account has no registered devices.
    NoDevices,
}

impl SetupError {
    /// Stable reason key shown to the user.
    pub fn reason(&self) -> &'static str {
        match self {
            SetupError::CannotConnect(_) => "cannot_connect",
            SetupError::NoDevices => "no_devices",
        }
    }
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::CannotConnect(e) => write!(f, "cannot connect to Kohler Konnect: {}", e),
            SetupError::NoDevices => write!(f, "no devices registered to this account"),
        }
    }
}

impl Error for SetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SetupError::CannotConnect(e) => Some(e),
            SetupError::NoDevices => None,
        }
    }
}

impl From<KohlerClientError> for SetupError {
    fn from(value: KohlerClientError) -> Self {
        SetupError::CannotConnect(value)
    }
}

/// Authenticate and load the device directory once.
pub fn connect(manager: &SessionManager, username: &str, password: &str) -> Result<KohlerClient, SetupError> {
    let client = KohlerClient::connect(manager, username, password)?;
    let devices = validate_directory(&client)?;
    info!(
        "Discovered {} device(s) ({} managed)",
        devices.len(),
        devices.iter().filter(|d| d.is_gcs()).count()
    );
    Ok(client)
}

/// Fail with `NoDevices` when the directory is empty.
pub fn validate_directory<A: DeviceApi + ?Sized>(api: &A) -> Result<Vec<Device>, SetupError> {
    let devices = api.list_devices()?;
    if devices.is_empty() {
        return Err(SetupError::NoDevices);
    }
    Ok(devices)
}
