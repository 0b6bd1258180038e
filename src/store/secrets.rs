// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crypto::{CryptoErr, PasscodeTotp, SymmetricKey};
use crate::settings::NodeRole;
use crate::store::SecretsErr;
use log::*;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroize;

pub const AUTH_KEY: &str = "AUTH_KEY";
pub const SECRET_KEY: &str = "SECRET_KEY";
pub const EMAIL_SERVER_ADDRESS: &str = "EMAIL_SERVER_ADDRESS";
pub const EMAIL_SERVER_PWD: &str = "EMAIL_SERVER_PWD";

const SECRET_KEY_HEX_LEN: usize = 64;

pub struct Secrets {
    /// Seals the data directory
    pub auth_key: SymmetricKey,

    /// Signs bearer tokens
    pub secret_key: String,
    pub email_server_address: Option<String>,
    pub email_server_pwd: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("email_server_address", &self.email_server_address)
            .finish_non_exhaustive()
    }
}

impl Drop for Secrets {
    fn drop(&mut self) {
        self.secret_key.zeroize();

        if let Some(pwd) = self.email_server_pwd.as_mut() {
            pwd.zeroize();
        }
    }
}

impl Secrets {
    /// Reads the secrets file at `path`, creating it with fresh keys if it
    /// does not exist yet.
    pub fn load_or_generate(path: &Path, role: NodeRole) -> Result<Self, SecretsErr> {
        if !path.exists() {
            info!("Secrets file {} not found, generating one", path.display());
            generate(path)?;
        }

        let secrets = Self::load(path)?;

        if role == NodeRole::Coordinator && secrets.email_server_address.is_none() {
            warn!(
                "{} is not set in {}, email notifications are disabled",
                EMAIL_SERVER_ADDRESS,
                path.display()
            );
        }

        Ok(secrets)
    }

    pub fn load(path: &Path) -> Result<Self, SecretsErr> {
        let mut entries = HashMap::new();

        for item in dotenvy::from_path_iter(path)? {
            let (key, value) = item?;
            entries.insert(key, value);
        }

        let auth_key = entries.remove(AUTH_KEY).ok_or(SecretsErr::Missing(AUTH_KEY))?;
        let auth_key = SymmetricKey::from_base64(&auth_key).map_err(|_| SecretsErr::Invalid(AUTH_KEY))?;
        let secret_key = entries
            .remove(SECRET_KEY)
            .ok_or(SecretsErr::Missing(SECRET_KEY))?;

        if secret_key.len() != SECRET_KEY_HEX_LEN || hex::decode(&secret_key).is_err() {
            return Err(SecretsErr::Invalid(SECRET_KEY));
        }

        let email_server_address = entries.remove(EMAIL_SERVER_ADDRESS).filter(|v| !v.is_empty());
        let email_server_pwd = entries.remove(EMAIL_SERVER_PWD).filter(|v| !v.is_empty());

        if let Some(address) = &email_server_address {
            if !address.contains('@') {
                return Err(SecretsErr::Invalid(EMAIL_SERVER_ADDRESS));
            }

            if email_server_pwd.is_none() {
                return Err(SecretsErr::Missing(EMAIL_SERVER_PWD));
            }
        }

        Ok(Self {
            auth_key,
            secret_key,
            email_server_address,
            email_server_pwd,
        })
    }

    /// Admin passcodes, keyed by `AUTH_KEY` followed by `SECRET_KEY` as
    /// they appear in the secrets file.
    pub fn passcode(&self) -> Result<PasscodeTotp, CryptoErr> {
        let mut secret = self.auth_key.to_base64().into_bytes();
        secret.extend_from_slice(self.secret_key.as_bytes());
        let totp = PasscodeTotp::new(&secret);
        secret.zeroize();
        totp
    }
}

fn generate(path: &Path) -> Result<(), SecretsErr> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let secret: [u8; SECRET_KEY_HEX_LEN / 2] = rand::thread_rng().gen();
    let mut contents = format!(
        "{AUTH_KEY}={}\n{SECRET_KEY}={}\n",
        SymmetricKey::generate().to_base64(),
        hex::encode(secret)
    );

    let mut file = fs::File::create(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents.as_bytes())?;
    contents.zeroize();
    Ok(())
}
