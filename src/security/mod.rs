use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::digits::to_latin_digits;
use crate::{AppError, AppResult};

pub const PIN_HASH_KEY: &str = "pin_hash";
pub const BIO_ENABLED_KEY: &str = "bio_enabled";
pub const MIN_PIN_LEN: usize = 4;

/// Secret-backed key/value storage for the PIN digest and biometric flag.
/// Prod wires the host keystore (or [`FileSecretStore`] as a fallback);
/// tests use [`MemorySecretStore`].
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn delete(&self, key: &str) -> AppResult<()>;
}

/// Biometric capability and challenge port. Hardware availability can change
/// across the app lifecycle, so the gate re-probes on every foreground
/// transition rather than caching the answer.
pub trait BiometricProbe: Send + Sync {
    fn has_hardware(&self) -> bool;
    fn is_enrolled(&self) -> bool;
    fn authenticate(&self, prompt: &str) -> bool;
}

/// Headless default: no biometric hardware.
pub struct NoBiometrics;

impl BiometricProbe for NoBiometrics {
    fn has_hardware(&self) -> bool {
        false
    }
    fn is_enrolled(&self) -> bool {
        false
    }
    fn authenticate(&self, _prompt: &str) -> bool {
        false
    }
}

/// In-memory secret store.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// File-backed secret store: one JSON object, owner-only permissions.
/// Holds only one-way digests and flags, never cleartext secrets.
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        FileSecretStore {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> AppResult<HashMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(AppError::from(e).with_context("path", self.path.display().to_string())),
        }
    }

    fn write_all(&self, values: &HashMap<String, String>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(AppError::from)?;
        }
        let raw = serde_json::to_string_pretty(values).map_err(AppError::from)?;
        std::fs::write(&self.path, raw)
            .map_err(|e| AppError::from(e).with_context("path", self.path.display().to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn delete(&self, key: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut values = self.read_all()?;
        values.remove(key);
        self.write_all(&values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub pin_enabled: bool,
    pub biometric_enabled: bool,
    pub biometrics_available: bool,
    pub locked: bool,
}

/// PIN/biometric lock state machine guarding presentation-layer access.
/// Independent of the store; only a one-way SHA-256 digest of the PIN is
/// ever persisted.
pub struct SecurityGate {
    secrets: Arc<dyn SecretStore>,
    biometrics: Arc<dyn BiometricProbe>,
    locked: Mutex<bool>,
}

/// Digest an entered PIN. Digit glyphs are folded to ASCII first so a PIN
/// typed on an Arabic-Indic keypad matches one set on a Latin keypad.
pub fn hash_pin(pin: &str) -> String {
    let normalized = to_latin_digits(pin.trim());
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

impl SecurityGate {
    pub fn new(secrets: Arc<dyn SecretStore>, biometrics: Arc<dyn BiometricProbe>) -> Self {
        SecurityGate {
            secrets,
            biometrics,
            locked: Mutex::new(false),
        }
    }

    fn pin_hash(&self) -> AppResult<Option<String>> {
        Ok(self
            .secrets
            .get(PIN_HASH_KEY)?
            .filter(|h| !h.trim().is_empty()))
    }

    fn set_locked(&self, locked: bool) {
        *self.locked.lock().unwrap_or_else(|e| e.into_inner()) = locked;
    }

    pub fn lock_state(&self) -> LockState {
        if *self.locked.lock().unwrap_or_else(|e| e.into_inner()) {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }

    fn probe_available(&self) -> bool {
        self.biometrics.has_hardware() && self.biometrics.is_enrolled()
    }

    /// Re-read secrets and re-probe hardware. Locks iff a PIN is
    /// configured, so a gate without a PIN is always `Unlocked`.
    pub fn refresh_status(&self) -> AppResult<SecurityStatus> {
        let pin_enabled = self.pin_hash()?.is_some();
        let biometric_enabled = self
            .secrets
            .get(BIO_ENABLED_KEY)?
            .map(|v| v == "1")
            .unwrap_or(false);
        let biometrics_available = self.probe_available();

        self.set_locked(pin_enabled);

        Ok(SecurityStatus {
            pin_enabled,
            biometric_enabled,
            biometrics_available,
            locked: pin_enabled,
        })
    }

    /// Current status without touching the lock state.
    pub fn status(&self) -> AppResult<SecurityStatus> {
        let pin_enabled = self.pin_hash()?.is_some();
        let biometric_enabled = self
            .secrets
            .get(BIO_ENABLED_KEY)?
            .map(|v| v == "1")
            .unwrap_or(false);
        Ok(SecurityStatus {
            pin_enabled,
            biometric_enabled,
            biometrics_available: self.probe_available(),
            locked: self.lock_state() == LockState::Locked,
        })
    }

    /// Configure a PIN (min 4 digits) and immediately re-lock.
    pub fn set_pin(&self, pin: &str) -> AppResult<()> {
        let pin = pin.trim();
        if pin.chars().count() < MIN_PIN_LEN {
            return Err(AppError::new(
                "AUTH/PIN_TOO_SHORT",
                "PIN must be at least 4 digits",
            ));
        }
        self.secrets.set(PIN_HASH_KEY, &hash_pin(pin))?;
        self.set_locked(true);
        info!(target = "daftar", event = "pin_set");
        Ok(())
    }

    /// Remove the PIN. Requires re-entering the current PIN when one is
    /// configured; with no PIN this is a no-op success. Either way the
    /// biometric flag is forced off, since it depends on the PIN.
    pub fn disable_pin(&self, pin: &str) -> AppResult<()> {
        match self.pin_hash()? {
            Some(existing) => {
                let entered = pin.trim();
                if entered.chars().count() < MIN_PIN_LEN {
                    return Err(AppError::new("AUTH/PIN_REQUIRED", "PIN_REQUIRED"));
                }
                if hash_pin(entered) != existing {
                    return Err(AppError::new("AUTH/PIN_WRONG", "PIN_WRONG"));
                }
                self.secrets.delete(PIN_HASH_KEY)?;
                self.secrets.set(BIO_ENABLED_KEY, "0")?;
                self.set_locked(false);
                info!(target = "daftar", event = "pin_disabled");
                Ok(())
            }
            None => {
                self.secrets.set(BIO_ENABLED_KEY, "0")?;
                self.set_locked(false);
                Ok(())
            }
        }
    }

    /// Toggle biometric unlock. Enabling requires a configured PIN and a
    /// passing capability + enrollment probe.
    pub fn set_biometric(&self, enabled: bool) -> AppResult<()> {
        if enabled {
            if self.pin_hash()?.is_none() {
                return Err(AppError::new("AUTH/PIN_NOT_SET", "Enable PIN first"));
            }
            if !self.probe_available() {
                return Err(AppError::new(
                    "AUTH/BIO_UNAVAILABLE",
                    "Biometrics not available",
                ));
            }
        }
        self.secrets
            .set(BIO_ENABLED_KEY, if enabled { "1" } else { "0" })?;
        info!(target = "daftar", event = "biometric_toggled", enabled = enabled);
        Ok(())
    }

    /// Verify an entered PIN against the stored digest and unlock on match.
    /// The caller owns the input buffer; the gate never clears it.
    pub fn unlock_with_pin(&self, pin: &str) -> AppResult<()> {
        let Some(existing) = self.pin_hash()? else {
            // No PIN configured: the gate is trivially open.
            self.set_locked(false);
            return Ok(());
        };
        let entered = pin.trim();
        if entered.chars().count() < MIN_PIN_LEN {
            return Err(AppError::new(
                "AUTH/PIN_TOO_SHORT",
                "PIN must be at least 4 digits",
            ));
        }
        if hash_pin(entered) != existing {
            warn!(target = "daftar", event = "pin_rejected");
            return Err(AppError::new("AUTH/PIN_WRONG", "Wrong PIN"));
        }
        self.set_locked(false);
        info!(target = "daftar", event = "unlocked_with_pin");
        Ok(())
    }

    /// Attempt a biometric unlock. Returns `false` (without error) unless a
    /// PIN is set, the flag is enabled, the probe passes, and the challenge
    /// succeeds.
    pub fn try_biometric_unlock(&self) -> AppResult<bool> {
        if self.pin_hash()?.is_none() {
            return Ok(false);
        }
        let enabled = self
            .secrets
            .get(BIO_ENABLED_KEY)?
            .map(|v| v == "1")
            .unwrap_or(false);
        if !enabled || !self.probe_available() {
            return Ok(false);
        }
        if self.biometrics.authenticate("Unlock your ledger") {
            self.set_locked(false);
            info!(target = "daftar", event = "unlocked_with_biometrics");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Background transition: re-lock iff a PIN is configured.
    pub fn on_background(&self) -> AppResult<()> {
        if self.pin_hash()?.is_some() {
            self.set_locked(true);
        }
        Ok(())
    }

    /// Foreground transition: re-probe hardware and re-lock if applicable.
    pub fn on_foreground(&self) -> AppResult<SecurityStatus> {
        self.refresh_status()
    }
}
