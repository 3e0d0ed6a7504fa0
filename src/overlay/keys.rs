//! WireGuard key handling.
//!
//! Private keys are generated on the node itself with `wg genkey`; the
//! controller only derives the public half.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ProvisionError;
use crate::remote::quote;

/// Remote path of the node's private key for `interface`.
pub fn key_path(interface: &str) -> String {
    format!("/etc/wireguard/{interface}.key")
}

/// Print the node's private key, generating it first if none exists yet.
pub fn keygen_command(interface: &str) -> String {
    let path = quote(&key_path(interface));
    format!(
        "umask 077 && mkdir -p /etc/wireguard && \
         {{ [ -s {path} ] || wg genkey > {path}; }} && cat {path}"
    )
}

/// Derive the base64 public key from a base64 private key.
pub fn public_key_from_private(private_key: &str) -> Result<String, ProvisionError> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| ProvisionError::Key(format!("private key is not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| ProvisionError::Key(format!("expected 32 bytes, got {}", b.len())))?;

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_44_char_public_key() {
        let secret = StaticSecret::from([7u8; 32]);
        let expected = STANDARD.encode(PublicKey::from(&secret).as_bytes());

        let private_key = STANDARD.encode(secret.to_bytes());
        let public_key = public_key_from_private(&format!("{private_key}\n")).unwrap();
        assert_eq!(public_key.len(), 44);
        assert_eq!(public_key, expected);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(public_key_from_private("not base64!").is_err());
        assert!(public_key_from_private(&STANDARD.encode([1u8; 16])).is_err());
    }

    #[test]
    fn keygen_reuses_existing_key() {
        let cmd = keygen_command("wg0");
        assert!(cmd.contains("[ -s '/etc/wireguard/wg0.key' ] || wg genkey"));
        assert!(cmd.ends_with("cat '/etc/wireguard/wg0.key'"));
    }
}
