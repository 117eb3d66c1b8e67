// Cloudflared Tunnel Manager - Output Classifier
// Turns single lines of cloudflared output into typed classifications

use once_cell::sync::Lazy;
use regex::Regex;

use cf_tunnel_common::TunnelError;

static QUICK_TUNNEL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("static regex is valid")
});

static REGISTERED_CONNECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)registered tunnel connection").expect("static regex is valid")
});

static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(cannot determine default origin certificate|origin cert(ificate)?.*not found|please run .cloudflared (tunnel )?login)")
        .expect("static regex is valid")
});

/// Generic credential words only count on error-level lines
static AUTH_ERROR_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\S+\s+)?(?:ERR|FTL|(?i:error))\b.*(?i:cert\.pem|unauthorized|not logged in)")
        .expect("static regex is valid")
});

static DNS_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(no such host|lookup .* on .*: |dial tcp: lookup|server misbehaving|temporary failure in name resolution)")
        .expect("static regex is valid")
});

static MISSING_EXECUTABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(executable file not found|command not found|no such file or directory: .*cloudflared)")
        .expect("static regex is valid")
});

/// Classification of one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// Public URL of a quick tunnel
    PublicUrl(String),
    /// An edge connection was registered (managed tunnel readiness)
    ConnectionRegistered,
    /// Output signature of a failure the process will not recover from
    Failure(TunnelError),
    Other,
}

/// Narrow seam between process output and the supervisor
pub trait LineClassifier: Send + Sync {
    fn classify(&self, line: &str) -> LineClass;
}

/// Patterns matching what cloudflared prints
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudflaredLineClassifier;

impl LineClassifier for CloudflaredLineClassifier {
    fn classify(&self, line: &str) -> LineClass {
        if let Some(m) = QUICK_TUNNEL_URL.find(line) {
            return LineClass::PublicUrl(m.as_str().to_string());
        }

        if REGISTERED_CONNECTION.is_match(line) {
            return LineClass::ConnectionRegistered;
        }

        let reason = line.trim().to_string();
        if AUTH_FAILURE.is_match(line) || AUTH_ERROR_LINE.is_match(line) {
            return LineClass::Failure(TunnelError::AuthenticationRequired { reason });
        }
        if DNS_FAILURE.is_match(line) {
            return LineClass::Failure(TunnelError::NetworkError { reason });
        }
        if MISSING_EXECUTABLE.is_match(line) {
            return LineClass::Failure(TunnelError::BinaryNotFound { path: reason });
        }

        LineClass::Other
    }
}
