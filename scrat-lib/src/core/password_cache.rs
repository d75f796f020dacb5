use std::collections::HashMap;

use secrecy::SecretString;
use secrecy::zeroize::Zeroize;

use super::keyring::{KeyringError, get_password};

/// Caches passphrases fetched from the OS keyring for the lifetime of a run,
/// zeroizing them on drop.
pub struct PasswordCache {
    cache: HashMap<String, SecretString>,
}

impl PasswordCache {
    pub fn new() -> Self {
        PasswordCache {
            cache: HashMap::new(),
        }
    }

    pub fn get_password(&mut self, password_id: &str) -> Result<&SecretString, KeyringError> {
        if !self.cache.contains_key(password_id) {
            let password = get_password(password_id)?;
            self.cache.insert(password_id.to_string(), password);
        }

        Ok(self.cache.get(password_id).unwrap())
    }

    #[allow(unused)]
    pub fn clear(&mut self) {
        for secret in self.cache.values_mut() {
            secret.zeroize();
        }

        self.cache.clear();
    }
}

impl Drop for PasswordCache {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Default for PasswordCache {
    fn default() -> Self {
        Self::new()
    }
}
