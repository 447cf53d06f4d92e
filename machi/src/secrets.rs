//! Secret Vault: AEAD-encrypted secret storage with placeholder resolution.
//!
//! Secrets are stored at rest as `ChaCha20-Poly1305` ciphertext tokens keyed by a
//! process-local master key. Callers never see plaintext secrets directly; instead
//! they embed `{{secret:<name>}}` placeholders in tool arguments or prompts and
//! call [`SecretVault::resolve`] to substitute them just before use.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};

/// Errors raised by the secret vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// I/O failure reading or writing the master key file.
    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),
    /// SQLite failure on the secrets store.
    #[error("vault storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// The on-disk master key was the wrong length or not valid base64.
    #[error("invalid master key: {0}")]
    InvalidKey(String),
    /// A secret name failed normalization (empty, too long, or bad characters).
    #[error("invalid secret name: {0}")]
    InvalidName(String),
    /// Background blocking task panicked or was cancelled.
    #[error("vault task error: {0}")]
    Task(String),
}

type VaultResult<T> = Result<T, VaultError>;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const MAX_NAME_LEN: usize = 80;

/// Normalizes a secret name to the vault's canonical form.
///
/// Lowercases the name and requires it match `[a-z0-9_.-]{1,80}`.
fn normalize_name(name: &str) -> VaultResult<String> {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() || normalized.len() > MAX_NAME_LEN {
        return Err(VaultError::InvalidName(name.to_owned()));
    }
    if !normalized
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(VaultError::InvalidName(name.to_owned()));
    }
    Ok(normalized)
}

/// Result of scanning text for `{{secret:<name>}}` placeholders or raw ciphertext
/// tokens without performing substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretReferenceReport {
    /// Placeholder names with no matching row in the vault.
    pub missing_keys: Vec<String>,
    /// Ciphertext tokens present in the text that failed to decrypt or parse.
    pub invalid_ciphertexts: Vec<String>,
}

impl SecretReferenceReport {
    /// True if every referenced secret resolved cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.invalid_ciphertexts.is_empty()
    }
}

/// Result of a full placeholder + ciphertext resolution pass.
#[derive(Debug, Clone)]
pub struct ResolvedText {
    /// Text with all resolvable placeholders and ciphertext tokens replaced by plaintext.
    pub text: String,
    /// Report of anything that failed to resolve.
    pub report: SecretReferenceReport,
}

fn ciphertext_token_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"sv1\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+")
            .expect("static ciphertext pattern is valid")
    })
}

fn placeholder_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\{\{secret:([a-zA-Z0-9_.-]+)\}\}")
            .expect("static placeholder pattern is valid")
    })
}

/// An `AEAD`-encrypted named secret store, backed by SQLite.
///
/// Cloneable: all handles share one master key and one connection.
#[derive(Clone)]
pub struct SecretVault {
    cipher: ChaCha20Poly1305,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault").finish_non_exhaustive()
    }
}

impl SecretVault {
    /// Opens (or creates) a vault rooted at `dir`, containing `master.key` and
    /// `secrets.db`.
    pub fn open(dir: impl AsRef<Path>) -> VaultResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let key = load_or_create_key(&dir.join("master.key"))?;
        let conn = Connection::open(dir.join("secrets.db"))?;
        Self::from_parts(key, conn)
    }

    /// Opens an in-memory vault with a freshly generated key. Intended for tests.
    pub fn in_memory() -> VaultResult<Self> {
        let mut key = [0_u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let conn = Connection::open_in_memory()?;
        Self::from_parts(key, conn)
    }

    fn from_parts(key: [u8; KEY_LEN], conn: Connection) -> VaultResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS secrets (
                name TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<F, T>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&Connection) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| VaultError::Task(format!("poisoned lock: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
    }

    fn encrypt(&self, name: &str, plaintext: &str) -> VaultResult<String> {
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = format!("secret:{name}");
        let payload = chacha20poly1305::aead::Payload {
            msg: plaintext.as_bytes(),
            aad: aad.as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|_| VaultError::InvalidKey("encryption failed".to_owned()))?;
        // chacha20poly1305 appends the 16-byte tag to the ciphertext; split it back out.
        let tag_offset = ciphertext.len() - 16;
        let (content, tag) = ciphertext.split_at(tag_offset);
        Ok(format!(
            "sv1.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(content),
        ))
    }

    fn decrypt(&self, name: &str, token: &str) -> Option<String> {
        let rest = token.strip_prefix("sv1.")?;
        let mut parts = rest.split('.');
        let iv = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
        let content = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
        if parts.next().is_some() || iv.len() != NONCE_LEN || tag.len() != 16 {
            return None;
        }
        let mut combined = content;
        combined.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&iv);
        let aad = format!("secret:{name}");
        let payload = chacha20poly1305::aead::Payload {
            msg: &combined,
            aad: aad.as_bytes(),
        };
        let plaintext = self.cipher.decrypt(nonce, payload).ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Stores (or overwrites) a secret under `name`.
    ///
    /// # Errors
    /// Returns [`VaultError::InvalidName`] if `name` fails normalization.
    pub async fn put(&self, name: &str, plaintext: &str) -> VaultResult<()> {
        let name = normalize_name(name)?;
        let ciphertext = self.encrypt(&name, plaintext)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO secrets (name, ciphertext, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(name) DO UPDATE SET ciphertext = excluded.ciphertext, updated_at = excluded.updated_at",
                params![name, ciphertext],
            )?;
            Ok(())
        })
        .await
    }

    /// Removes a secret. No-op if the name doesn't exist.
    pub async fn remove(&self, name: &str) -> VaultResult<()> {
        let name = normalize_name(name)?;
        self.blocking(move |conn| {
            conn.execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
            Ok(())
        })
        .await
    }

    /// Lists all stored secret names, sorted.
    pub async fn list_names(&self) -> VaultResult<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM secrets ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Returns the raw ciphertext token for `name`, if present.
    pub async fn get_cipher(&self, name: &str) -> VaultResult<Option<String>> {
        let name = normalize_name(name)?;
        self.blocking(move |conn| {
            let value = conn
                .query_row(
                    "SELECT ciphertext FROM secrets WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    /// Decrypts and returns the plaintext for `name`. Returns `Ok(None)` if the
    /// secret is absent or fails to decrypt (never surfaces key material in the
    /// error path).
    pub async fn reveal(&self, name: &str) -> VaultResult<Option<String>> {
        let Some(cipher) = self.get_cipher(name).await? else {
            return Ok(None);
        };
        let normalized = normalize_name(name)?;
        Ok(self.decrypt(&normalized, &cipher))
    }

    /// Scans `text` for `{{secret:<name>}}` placeholders and bare ciphertext
    /// tokens without substituting anything; useful as a pre-flight gate.
    pub async fn inspect_references(&self, text: &str) -> VaultResult<SecretReferenceReport> {
        let mut report = SecretReferenceReport::default();
        for name in placeholder_re()
            .captures_iter(text)
            .map(|c| c[1].to_owned())
        {
            if self.get_cipher(&name).await?.is_none() {
                report.missing_keys.push(name);
            }
        }
        for token in ciphertext_token_re()
            .find_iter(text)
            .map(|m| m.as_str().to_owned())
        {
            // A bare token's name binding is unknown; probe against every stored name.
            let names = self.list_names().await?;
            let resolves = names.iter().any(|n| self.decrypt(n, &token).is_some());
            if !resolves {
                report.invalid_ciphertexts.push(token);
            }
        }
        Ok(report)
    }

    /// Replaces `{{secret:<name>}}` placeholders with their ciphertext, then
    /// decrypts any ciphertext token present, returning final plaintext and a
    /// report of anything unresolved.
    pub async fn resolve(&self, text: &str) -> VaultResult<ResolvedText> {
        let mut report = SecretReferenceReport::default();
        let mut with_ciphertext = String::with_capacity(text.len());
        let mut last = 0;
        for caps in placeholder_re().captures_iter(text) {
            let whole = caps.get(0).expect("group 0 always matches");
            let name = &caps[1];
            with_ciphertext.push_str(&text[last..whole.start()]);
            match self.get_cipher(name).await? {
                Some(cipher) => with_ciphertext.push_str(&cipher),
                None => {
                    report.missing_keys.push(name.to_owned());
                    with_ciphertext.push_str(whole.as_str());
                }
            }
            last = whole.end();
        }
        with_ciphertext.push_str(&text[last..]);

        let names = self.list_names().await?;
        let mut resolved = String::with_capacity(with_ciphertext.len());
        let mut last = 0;
        for m in ciphertext_token_re().find_iter(&with_ciphertext) {
            resolved.push_str(&with_ciphertext[last..m.start()]);
            let plaintext = names.iter().find_map(|n| self.decrypt(n, m.as_str()));
            match plaintext {
                Some(p) => resolved.push_str(&p),
                None => {
                    report.invalid_ciphertexts.push(m.as_str().to_owned());
                    resolved.push_str(m.as_str());
                }
            }
            last = m.end();
        }
        resolved.push_str(&with_ciphertext[last..]);

        Ok(ResolvedText {
            text: resolved,
            report,
        })
    }

    /// Redacts any stored plaintext secret (4+ chars) found verbatim in `text`.
    ///
    /// Applied before prompts are sent to an LLM provider so secrets already
    /// revealed in a prior tool call don't leak into the conversation.
    pub async fn mask_known_secrets(&self, text: &str) -> VaultResult<String> {
        let names = self.list_names().await?;
        let mut masked = text.to_owned();
        for name in names {
            if let Some(plaintext) = self.reveal(&name).await?
                && plaintext.len() >= 4
                && masked.contains(&plaintext)
            {
                masked = masked.replace(&plaintext, "[REDACTED:SECRET]");
            }
        }
        Ok(masked)
    }
}

fn load_or_create_key(path: &PathBuf) -> VaultResult<[u8; KEY_LEN]> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| VaultError::InvalidKey("master key has wrong length".to_owned()))
    } else {
        let mut key = [0_u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(path, URL_SAFE_NO_PAD.encode(key))?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_reveal_roundtrip() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("api_key", "sk-top-secret").await.unwrap();
        assert_eq!(
            vault.reveal("api_key").await.unwrap(),
            Some("sk-top-secret".to_owned())
        );
    }

    #[tokio::test]
    async fn name_is_normalized() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("  API_Key  ", "value").await.unwrap();
        assert_eq!(vault.list_names().await.unwrap(), vec!["api_key"]);
    }

    #[tokio::test]
    async fn invalid_name_rejected() {
        let vault = SecretVault::in_memory().unwrap();
        let err = vault.put("bad name!", "value").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidName(_)));
    }

    #[tokio::test]
    async fn resolve_substitutes_placeholder() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("token", "hunter2").await.unwrap();
        let resolved = vault.resolve("auth: {{secret:token}}").await.unwrap();
        assert_eq!(resolved.text, "auth: hunter2");
        assert!(resolved.report.is_clean());
    }

    #[tokio::test]
    async fn resolve_reports_missing_key() {
        let vault = SecretVault::in_memory().unwrap();
        let resolved = vault.resolve("auth: {{secret:missing}}").await.unwrap();
        assert_eq!(resolved.report.missing_keys, vec!["missing".to_owned()]);
        assert!(resolved.text.contains("{{secret:missing}}"));
    }

    #[tokio::test]
    async fn remove_deletes_secret() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("gone", "value").await.unwrap();
        vault.remove("gone").await.unwrap();
        assert_eq!(vault.reveal("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mask_known_secrets_redacts_plaintext() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("pw", "correcthorsebattery").await.unwrap();
        let masked = vault
            .mask_known_secrets("the password is correcthorsebattery, ok?")
            .await
            .unwrap();
        assert_eq!(masked, "the password is [REDACTED:SECRET], ok?");
    }

    #[tokio::test]
    async fn ciphertext_token_resolves_without_placeholder() {
        let vault = SecretVault::in_memory().unwrap();
        vault.put("x", "plain").await.unwrap();
        let token = vault.get_cipher("x").await.unwrap().unwrap();
        let resolved = vault.resolve(&format!("value={token}")).await.unwrap();
        assert_eq!(resolved.text, "value=plain");
    }

    #[test]
    fn open_persists_master_key_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vault1 = SecretVault::open(dir.path()).unwrap();
        let vault2 = SecretVault::open(dir.path()).unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            vault1.put("shared", "value").await.unwrap();
            assert_eq!(
                vault2.reveal("shared").await.unwrap(),
                Some("value".to_owned())
            );
        });
    }
}
