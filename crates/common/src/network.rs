// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Network utility functions

use url::Url;

use crate::error::TunnelError;

/// Validate the local service URL a tunnel exposes.
///
/// The target must be an absolute URL with a scheme and a non-empty host;
/// surrounding whitespace is ignored.
pub fn validate_local_target(raw: &str) -> Result<Url, TunnelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TunnelError::InvalidConfiguration {
            reason: "local target URL is empty".to_string(),
        });
    }

    let url = Url::parse(trimmed).map_err(|e| TunnelError::InvalidConfiguration {
        reason: format!("'{}' is not a valid absolute URL: {}", trimmed, e),
    })?;

    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => {
            return Err(TunnelError::InvalidConfiguration {
                reason: format!("'{}' has no host", trimmed),
            })
        }
    }

    if url.port_or_known_default().is_none() {
        return Err(TunnelError::InvalidConfiguration {
            reason: format!("'{}' has no port and scheme '{}' has no default", trimmed, url.scheme()),
        });
    }

    Ok(url)
}

/// Port of a validated local target, falling back to the scheme default
pub fn target_port(url: &Url) -> Option<u16> {
    url.port_or_known_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_local_target_accepts_dev_servers() {
        let url = validate_local_target("  http://localhost:3000 ").unwrap();
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(target_port(&url), Some(3000));

        let url = validate_local_target("http://127.0.0.1").unwrap();
        assert_eq!(target_port(&url), Some(80));

        let url = validate_local_target("https://localhost").unwrap();
        assert_eq!(target_port(&url), Some(443));
    }

    #[test]
    fn test_validate_local_target_rejects_missing_scheme_or_host() {
        for raw in ["", "   ", "localhost:3000", "3000", "http://", "file:///tmp/x", "not a url"] {
            let err = validate_local_target(raw).unwrap_err();
            assert!(
                matches!(err, TunnelError::InvalidConfiguration { .. }),
                "expected InvalidConfiguration for {:?}, got {:?}",
                raw,
                err
            );
        }
    }
}
