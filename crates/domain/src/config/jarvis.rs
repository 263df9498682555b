use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Jarvis device auth (`/api/jarvis/auth`)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Env vars holding the device-secret/JWT-signing material for the
/// `/api/jarvis/*` surface. Read once at startup, same pattern as
/// `AdminConfig::token_env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JarvisConfig {
    /// Env var holding the shared device secret exchanged for a session.
    /// Unset disables `/api/jarvis/auth` (returns 503).
    #[serde(default = "d_device_secret_env")]
    pub device_secret_env: String,
    /// Env var holding the HMAC signing key for issued JWTs, >= 32 bytes.
    #[serde(default = "d_jwt_secret_env")]
    pub jwt_secret_env: String,
    /// Issued JWT/session-cookie lifetime, in seconds. Default: 7 days.
    #[serde(default = "d_session_ttl_sec")]
    pub session_ttl_sec: i64,
}

impl Default for JarvisConfig {
    fn default() -> Self {
        Self {
            device_secret_env: d_device_secret_env(),
            jwt_secret_env: d_jwt_secret_env(),
            session_ttl_sec: d_session_ttl_sec(),
        }
    }
}

fn d_device_secret_env() -> String {
    "AOC_DEVICE_SECRET".into()
}

fn d_jwt_secret_env() -> String {
    "AOC_JWT_SECRET".into()
}

fn d_session_ttl_sec() -> i64 {
    7 * 24 * 3600
}
