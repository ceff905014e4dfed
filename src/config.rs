//! Runtime configuration from the environment, optionally seeded from a `.env` file.
//! The polling cadence, timeouts and reconciliation delay are fixed, not configurable.

use crate::session::PemFiles;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_CLIENT_CERT: &str = "kohler_client.crt";
pub const DEFAULT_CLIENT_KEY: &str = "kohler_client.key";

#[derive(Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// PEM client certificate for the service-token call.
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_cert", &self.client_cert)
            .field("client_key", &self.client_key)
            .finish()
    }
}

fn required(name: &str) -> Result<String, String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("Missing {}: set it in the environment or the .env file", name)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let username = required("KOHLER_USERNAME")?.trim().to_string();
        let password = required("KOHLER_PASSWORD")?;
        let client_cert = std::env::var("KOHLER_CLIENT_CERT").unwrap_or_else(|_| DEFAULT_CLIENT_CERT.to_string());
        let client_key = std::env::var("KOHLER_CLIENT_KEY").unwrap_or_else(|_| DEFAULT_CLIENT_KEY.to_string());

        Ok(Config {
            username,
            password,
            client_cert: PathBuf::from(client_cert),
            client_key: PathBuf::from(client_key),
        })
    }

    pub fn certificates(&self) -> PemFiles {
        PemFiles {
            certificate: self.client_cert.clone(),
            private_key: self.client_key.clone(),
        }
    }
}

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Load `explicit` if given, else `./.env` when it exists.
pub fn load_env(explicit: Option<&Path>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.to_path_buf(),
            explicit: true,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    load_env_file(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
    }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // the process environment wins over the file
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse `KEY=value`, `export KEY=value`, quoted values and trailing comments.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name: {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => unquote(&raw[1..], quote)?,
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Read a quoted value up to its closing `quote`. Double quotes understand
/// `\\`, `\"`, `\n`, `\r` and `\t`; single quotes are literal.
fn unquote(body: &str, quote: char) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('r') => value.push('\r'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => return Err("unterminated escape sequence".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                if !(rest.is_empty() || rest.starts_with('#')) {
                    return Err("unexpected characters after closing quote".to_string());
                }
                return Ok(value);
            }
            c => value.push(c),
        }
    }
    Err(format!("unterminated {} quote", quote))
}
