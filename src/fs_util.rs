//! Filesystem conventions: secure key/directory permissions, the `<certDirName>`
//! naming rule (spec.md §6), and atomic certificate-file replacement.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use blake2::Blake2s256;
use blake2::digest::Digest;
use tokio::fs;

const KEY_FILE_MODE: u32 = 0o600;
const SECRETS_DIR_MODE: u32 = 0o700;

/// Ensures `path` exists with `0700` permissions, suitable for private key material.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub async fn ensure_secrets_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create secrets dir {}: {e}", path.display()))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(SECRETS_DIR_MODE))
        .await
        .map_err(|e| anyhow::anyhow!("failed to set secrets dir permissions: {e}"))?;
    Ok(())
}

/// Applies `0600` permissions to a private key file.
///
/// # Errors
/// Returns an error if permissions cannot be set.
pub async fn set_key_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_FILE_MODE))
        .await
        .map_err(|e| anyhow::anyhow!("failed to set key file permissions: {e}"))?;
    Ok(())
}

/// Writes `contents` to `path` atomically: write to a sibling temp file, then rename
/// over the destination. Satisfies the "certificate file writes are atomic" invariant
/// (spec.md §5) so a reader never observes a partially written certificate.
///
/// # Errors
/// Returns an error if the parent directory cannot be created or either filesystem
/// operation fails.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path {} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).await?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("write-atomic")
    ));
    fs::write(&tmp_path, contents).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Derives the directory name a domain set's certificate is stored under, per
/// spec.md §6:
/// - 1 domain: the domain verbatim.
/// - 2-4 domains: `d1--d2--...--and--dN`.
/// - 5+ domains: `d1--d2--and--(N-2)--others--<blake2s256-hex of the full joined list>`.
///
/// Pure function of `domains`; does not normalize case or ordering, so callers should
/// pass a stable, already-canonicalized domain list.
#[must_use]
pub fn cert_dir_name(domains: &[String]) -> String {
    match domains.len() {
        0 => String::new(),
        1 => domains[0].clone(),
        2..=4 => {
            let (last, rest) = domains.split_last().expect("2..=4 domains is non-empty");
            format!("{}--and--{last}", rest.join("--"))
        }
        n => {
            let joined = domains.join("--");
            let mut hasher = Blake2s256::new();
            hasher.update(joined.as_bytes());
            let digest: [u8; 32] = hasher.finalize().into();
            format!(
                "{}--{}--and--({})--others--{}",
                domains[0],
                domains[1],
                n - 2,
                hex_encode(&digest)
            )
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Base64url-encodes `bytes` with no padding, used for the CSR body (RFC 8555 §7.4) and
/// other base64url-shaped wire fields outside the JWS signing path.
#[must_use]
pub fn b64url(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_ensure_secrets_dir_permissions() {
        let dir = tempdir().unwrap();
        let secrets_dir = dir.path().join("secrets");

        ensure_secrets_dir(&secrets_dir).await.unwrap();

        let mode = std::fs::metadata(&secrets_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SECRETS_DIR_MODE);
    }

    #[tokio::test]
    async fn test_set_key_permissions() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("key.pem");
        fs::write(&key_path, "key-data").await.unwrap();

        set_key_permissions(&key_path).await.unwrap();

        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_FILE_MODE);
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parent_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("certificate.pem");

        write_atomic(&path, b"version-1").await.unwrap();
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "version-1");

        write_atomic(&path, b"version-2").await.unwrap();
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "version-2");

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_cert_dir_name_single_domain() {
        assert_eq!(cert_dir_name(&["a.test".to_string()]), "a.test");
    }

    #[test]
    fn test_cert_dir_name_two_to_four_domains() {
        let domains = vec!["a.test".to_string(), "b.test".to_string(), "c.test".to_string()];
        assert_eq!(cert_dir_name(&domains), "a.test--b.test--and--c.test");
    }

    #[test]
    fn test_cert_dir_name_two_domains() {
        let domains = vec!["a.test".to_string(), "b.test".to_string()];
        assert_eq!(cert_dir_name(&domains), "a.test--and--b.test");
    }

    #[test]
    fn test_cert_dir_name_five_plus_domains_is_deterministic_and_distinct() {
        let domains: Vec<String> = (0..5).map(|i| format!("d{i}.test")).collect();
        let name = cert_dir_name(&domains);
        assert!(name.starts_with("d0.test--d1.test--and--(3)--others--"));
        assert_eq!(name, cert_dir_name(&domains));

        let other: Vec<String> = (0..5).map(|i| format!("e{i}.test")).collect();
        assert_ne!(name, cert_dir_name(&other));
    }
}
