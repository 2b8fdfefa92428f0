//! Credential management for connected social accounts
//!
//! Tokens are stored age-encrypted (passphrase mode, base64-encoded for
//! TEXT columns) and only ever decrypted into [`SecretString`]s. The
//! manager refreshes access tokens proactively before expiry and absorbs
//! concurrent refresh pressure with a time-window guard: a credential row
//! updated within the last 30 seconds is assumed to have just been
//! refreshed by another worker, and its current token is reused instead
//! of burning the (single-use) refresh token a second time.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use base64::Engine;

use crate::config::{ProviderConfig, MIN_MASTER_KEY_LEN};
use crate::db::Database;
use crate::error::{CredentialError, Result};
use crate::notify::Notifier;
use crate::types::{AccountStatus, SocialAccount};

/// Refresh when the access token expires within this window.
const EXPIRY_BUFFER_SECS: i64 = 5 * 60;

/// A row updated more recently than this is treated as freshly refreshed
/// by a concurrent worker; we reuse its token rather than racing for a
/// second exchange.
const CONCURRENT_REFRESH_WINDOW_SECS: i64 = 30;

/// Timeout on the external token endpoint call.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Token encryption
// ============================================================================

/// Symmetric cipher for token fields, keyed by the configured master key.
///
/// The key is validated at construction so a misconfigured deployment
/// fails at startup, not at the first refresh.
#[derive(Clone)]
pub struct TokenCipher {
    passphrase: Arc<SecretString>,
}

impl TokenCipher {
    pub fn new(passphrase: SecretString) -> Result<Self> {
        if passphrase.expose_secret().len() < MIN_MASTER_KEY_LEN {
            return Err(CredentialError::WeakKey(MIN_MASTER_KEY_LEN).into());
        }
        Ok(Self {
            passphrase: Arc::new(passphrase),
        })
    }

    /// Encrypt a token, returning base64-encoded age ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.passphrase.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
    }

    /// Decrypt a stored token.
    ///
    /// Any failure (bad base64, wrong key, truncated ciphertext) collapses
    /// to [`CredentialError::DecryptionFailed`]; callers treat it like a
    /// definitively rejected credential.
    pub fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let decryptor = match age::Decryptor::new(&bytes[..]) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            _ => return Err(CredentialError::DecryptionFailed.into()),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.passphrase.expose_secret().to_string()),
                None,
            )
            .map_err(|_| CredentialError::DecryptionFailed)?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let plaintext =
            String::from_utf8(decrypted).map_err(|_| CredentialError::DecryptionFailed)?;
        Ok(SecretString::from(plaintext))
    }
}

// ============================================================================
// Credential manager
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct CredentialManager {
    db: Database,
    cipher: TokenCipher,
    providers: HashMap<String, ProviderConfig>,
    notifier: Arc<dyn Notifier>,
    http: reqwest::Client,
}

impl CredentialManager {
    pub fn new(
        db: Database,
        cipher: TokenCipher,
        providers: HashMap<String, ProviderConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REFRESH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            db,
            cipher,
            providers,
            notifier,
            http,
        }
    }

    pub fn cipher(&self) -> &TokenCipher {
        &self.cipher
    }

    /// Return a usable access token for the account, refreshing first when
    /// the stored one is near expiry.
    ///
    /// `Ok(None)` means "cannot publish now": the account is missing,
    /// revoked, or the refresh failed transiently. It is never an excuse
    /// to mark the job terminally failed.
    pub async fn get_valid_token(&self, account_id: &str) -> Result<Option<SecretString>> {
        let account = match self.db.get_account(account_id).await? {
            Some(account) => account,
            None => {
                warn!(account_id, "token requested for unknown account");
                return Ok(None);
            }
        };

        if account.status == AccountStatus::Revoked {
            debug!(account_id, "account is revoked; no token");
            return Ok(None);
        }

        let now = chrono::Utc::now().timestamp();
        let near_expiry = account
            .expires_at
            .map(|expires_at| expires_at - now < EXPIRY_BUFFER_SECS)
            .unwrap_or(false);

        if near_expiry {
            return self.refresh(account_id).await;
        }

        let ciphertext = match &account.encrypted_access_token {
            Some(ciphertext) => ciphertext.clone(),
            None => return Ok(None),
        };

        match self.cipher.decrypt(&ciphertext) {
            Ok(token) => Ok(Some(token)),
            Err(_) => {
                self.revoke_and_notify(&account, "stored access token could not be decrypted")
                    .await?;
                Ok(None)
            }
        }
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Definitive rejections (invalid_grant, 400/401) and undecryptable
    /// refresh tokens revoke the account and notify its owner. Transient
    /// failures return `Ok(None)` so the caller simply skips this cycle.
    pub async fn refresh(&self, account_id: &str) -> Result<Option<SecretString>> {
        let account = match self.db.get_account(account_id).await? {
            Some(account) => account,
            None => return Ok(None),
        };

        let refresh_ciphertext = match &account.encrypted_refresh_token {
            Some(ciphertext) => ciphertext.clone(),
            None => {
                debug!(account_id, "no refresh token stored");
                return Ok(None);
            }
        };

        let now = chrono::Utc::now().timestamp();

        // Concurrency guard: a row touched in the last 30s was just
        // refreshed by another worker. Reuse its token; a second exchange
        // would invalidate the rotated refresh token.
        if now - account.updated_at < CONCURRENT_REFRESH_WINDOW_SECS {
            info!(account_id, "concurrent refresh detected, reusing current token");
            return match &account.encrypted_access_token {
                Some(ciphertext) => match self.cipher.decrypt(ciphertext) {
                    Ok(token) => Ok(Some(token)),
                    Err(_) => {
                        self.revoke_and_notify(
                            &account,
                            "stored access token could not be decrypted",
                        )
                        .await?;
                        Ok(None)
                    }
                },
                None => Ok(None),
            };
        }

        let provider = match self.providers.get(&account.platform.to_lowercase()) {
            Some(provider) => provider.clone(),
            None => {
                warn!(
                    account_id,
                    platform = %account.platform,
                    "no OAuth provider configured"
                );
                return Ok(None);
            }
        };

        let refresh_token = match self.cipher.decrypt(&refresh_ciphertext) {
            Ok(token) => token,
            Err(_) => {
                self.revoke_and_notify(&account, "stored refresh token could not be decrypted")
                    .await?;
                return Ok(None);
            }
        };

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ];

        let response = match self.http.post(&provider.token_url).form(&params).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(account_id, "token refresh request failed: {}", e);
                return Ok(None);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body: TokenErrorResponse = response.json().await.unwrap_or(TokenErrorResponse {
                error: None,
                error_description: None,
            });

            let invalid_grant = body.error.as_deref() == Some("invalid_grant")
                || status == reqwest::StatusCode::BAD_REQUEST
                || status == reqwest::StatusCode::UNAUTHORIZED;

            if invalid_grant {
                let reason = body
                    .error_description
                    .or(body.error)
                    .unwrap_or_else(|| format!("token endpoint returned {}", status));
                self.revoke_and_notify(&account, &reason).await?;
                return Ok(None);
            }

            warn!(
                account_id,
                %status,
                "transient token endpoint failure, will retry next cycle"
            );
            return Ok(None);
        }

        let token: TokenResponse = match response.json().await {
            Ok(token) => token,
            Err(e) => {
                warn!(account_id, "malformed token endpoint response: {}", e);
                return Ok(None);
            }
        };

        let encrypted_access = self.cipher.encrypt(&token.access_token)?;
        let encrypted_refresh = token
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;
        let expires_at = token.expires_in.map(|secs| now + secs);

        self.db
            .store_refreshed_tokens(
                account_id,
                &encrypted_access,
                encrypted_refresh.as_deref(),
                expires_at,
                now,
            )
            .await?;

        info!(account_id, platform = %account.platform, "access token refreshed");
        Ok(Some(SecretString::from(token.access_token)))
    }

    async fn revoke_and_notify(&self, account: &SocialAccount, reason: &str) -> Result<()> {
        warn!(
            account_id = %account.id,
            platform = %account.platform,
            "revoking credentials: {}",
            reason
        );

        let now = chrono::Utc::now().timestamp();
        self.db.revoke_account(&account.id, reason, now).await?;

        // Notification failure must not undo the revocation
        if let Err(e) = self
            .notifier
            .credential_revoked(&account.user_id, &account.platform, reason)
            .await
        {
            warn!(account_id = %account.id, "revocation notification failed: {}", e);
        }

        Ok(())
    }
}
