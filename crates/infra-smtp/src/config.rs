// SMTP settings read from the environment
//
// | Variable        | Required | Default              |
// |-----------------|----------|----------------------|
// | `SMTP_HOST`     | yes      |                      |
// | `SMTP_PORT`     | no       | 587                  |
// | `SMTP_USER`     | no       |                      |
// | `SMTP_PASSWORD` | no       |                      |
// | `SMTP_FROM`     | no       | `SMTP_USER`          |
// | `SMTP_TLS`      | no       | `starttls`           |

use courier_core::error::{AppError, Result};
use std::str::FromStr;

pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS
    #[default]
    StartTls,
    /// TLS from the first byte (usually port 465)
    Tls,
    /// No encryption, for local relays only
    None,
}

impl FromStr for TlsMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starttls" => Ok(TlsMode::StartTls),
            "tls" => Ok(TlsMode::Tls),
            "none" => Ok(TlsMode::None),
            other => Err(AppError::Config(format!(
                "SMTP_TLS must be starttls, tls or none, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls: TlsMode,
}

// Keeps the password out of logs
impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from", &self.from)
            .field("tls", &self.tls)
            .finish()
    }
}

impl SmtpConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset
    ///
    /// # Errors
    /// - AppError::Config if `SMTP_HOST` is missing, the port or TLS mode is
    ///   malformed, or there is neither `SMTP_FROM` nor `SMTP_USER`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("SMTP_HOST")
            .ok_or_else(|| AppError::Config("SMTP_HOST is required".to_string()))?;

        let port = match get("SMTP_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                AppError::Config(format!("SMTP_PORT must be a port number, got '{}'", raw))
            })?,
            None => DEFAULT_SMTP_PORT,
        };

        let tls = match get("SMTP_TLS") {
            Some(raw) => raw.parse()?,
            None => TlsMode::default(),
        };

        let user = get("SMTP_USER");
        let password = get("SMTP_PASSWORD");
        let from = get("SMTP_FROM")
            .or_else(|| user.clone())
            .ok_or_else(|| AppError::Config("SMTP_FROM or SMTP_USER is required".to_string()))?;

        Ok(Self {
            host,
            port,
            user,
            password,
            from,
            tls,
        })
    }
}
