use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Credential material. Only `expose` gives access to the value, formatting
/// never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl FromStr for Secret {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_owned()))
    }
}

/// Resolves a secret injected either directly in the environment, or as a
/// file mounted by the platform's secret store (`<NAME>_FILE`). The direct
/// value wins when both are set. Empty values count as unset.
pub fn resolve(
    name: &'static str,
    direct: Option<&Secret>,
    file: Option<&str>,
) -> Result<Option<Secret>, ConfigError> {
    if let Some(secret) = direct.filter(|s| !s.0.is_empty()) {
        return Ok(Some(secret.clone()));
    }

    let Some(path) = file.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::SecretFile {
        name,
        path: path.to_owned(),
        source,
    })?;
    let value = contents.trim_end_matches(['\r', '\n']);
    if value.is_empty() {
        return Ok(None);
    }

    Ok(Some(Secret::new(value)))
}
