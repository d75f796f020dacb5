use keyring::Entry;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Errors from talking to the OS credential store (§9: "treat OS credential
/// stores as an external collaborator").
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("entry creation error: {0}")]
    EntryCreation(String),

    #[error("set password error: {0}")]
    SetPassword(String),

    #[error("delete credential error: {0}")]
    DeleteCredential(String),

    #[error("get password error: {0}")]
    GetPassword(String),
}

fn keyring_entry(id: &str) -> Result<Entry, KeyringError> {
    Entry::new("scrat", id).map_err(|err| KeyringError::EntryCreation(err.to_string()))
}

pub fn store_password(id: &str, password: &SecretString) -> Result<(), KeyringError> {
    keyring_entry(id)?
        .set_password(password.expose_secret())
        .map_err(|err| KeyringError::SetPassword(err.to_string()))?;

    Ok(())
}

pub fn remove_password(id: &str) -> Result<(), KeyringError> {
    keyring_entry(id)?
        .delete_credential()
        .map_err(|err| KeyringError::DeleteCredential(err.to_string()))?;

    Ok(())
}

pub fn get_password(id: &str) -> Result<SecretString, KeyringError> {
    let password = keyring_entry(id)?
        .get_password()
        .map_err(|err| KeyringError::GetPassword(err.to_string()))?;

    Ok(SecretString::new(password.into()))
}
