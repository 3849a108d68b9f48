//! Deterministic naming: session keys to container names, configuration
//! fingerprints.

use sha2::{Digest, Sha256};

use crate::config::BerthConfig;

/// Longest slug kept from the session key before the fingerprint suffix.
const MAX_SLUG_LEN: usize = 32;

/// Hex characters of the session-key fingerprint suffix.
const KEY_FINGERPRINT_LEN: usize = 8;

/// Hex characters of the configuration fingerprint.
const CONFIG_FINGERPRINT_LEN: usize = 16;

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive a container-name-safe identifier from an opaque session key.
///
/// Lowercases, collapses runs of non-alphanumerics to a single dash, strips
/// leading/trailing dashes, truncates to 32 characters and appends an
/// 8-hex-character fingerprint of the original key so near-equal keys stay
/// distinct. The caller prepends the configured container prefix.
pub fn derive_container_name(session_key: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in session_key.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }

    let digest = sha256_hex(session_key);
    let fingerprint = &digest[..KEY_FINGERPRINT_LEN];
    if slug.is_empty() {
        fingerprint.to_string()
    } else {
        format!("{slug}-{fingerprint}")
    }
}

/// Stable hash of the configuration fields a running container bakes in.
///
/// A container whose recorded fingerprint differs from the current one is
/// never reused; reconciliation destroys it.
pub fn config_fingerprint(config: &BerthConfig) -> String {
    let mut material = String::new();
    material.push_str(&config.image);
    material.push('\n');
    material.push_str(&config.resources.memory);
    material.push('\n');
    material.push_str(&config.resources.cpus);
    material.push('\n');
    material.push_str(&config.resources.pids_limit.to_string());
    material.push('\n');
    material.push_str(&config.docker.network);
    material.push('\n');
    material.push_str(&config.docker.cap_drop.join(","));
    material.push('\n');
    material.push_str(&config.docker.security_opts.join(","));
    material.push('\n');
    material.push_str(&config.docker.binds.join(","));

    sha256_hex(&material)[..CONFIG_FINGERPRINT_LEN].to_string()
}
