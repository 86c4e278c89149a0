//! Credential slots and how they are loaded.
//!
//! Slots come from exactly one ordered source, checked in this order:
//!
//! 1. `credentials.entries` in the configuration file
//! 2. numbered environment entries `FLEET_CREDENTIAL_1..N` with optional
//!    `FLEET_CREDENTIAL_<n>_MODEL`
//! 3. the legacy pair `FLEET_API_KEY` / `FLEET_API_KEY_2`
//!
//! A gap in the numbered entries is a configuration error. Blank values are
//! dropped with a warning that names the original entry number; later slots
//! are never renumbered to hide the gap.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::credentials::{LEGACY_ENV_KEYS, LEGACY_ENV_MODELS, NUMBERED_ENV_PREFIX};
use crate::error::{AppError, Result};

const MODEL_SUFFIX: &str = "_MODEL";

/// An upstream API credential. Never printed in full.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// A redacted rendering safe for logs and status payloads.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.masked()).finish()
    }
}

/// One configured credential entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub key: Credential,
    /// Model paired with this credential; the global default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

/// Where a slot was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Config,
    Numbered,
    Legacy,
}

/// A (credential, model) pairing managed by the rotation manager.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialSlot {
    pub credential: Credential,
    pub model: Option<String>,
    pub source: CredentialSource,
    /// 1-based entry number in its source.
    pub entry: usize,
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Build the ordered slot list from configuration entries and the environment.
pub fn load_slots<I>(entries: &[CredentialEntry], env: I) -> Result<Vec<CredentialSlot>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let slots = if entries.is_empty() {
        let env: HashMap<String, String> = env.into_iter().collect();
        let numbered = load_numbered(&env)?;
        if numbered.is_empty() {
            load_legacy(&env)
        } else {
            numbered
        }
    } else {
        load_configured(entries)
    };

    if slots.is_empty() {
        warn!("No usable credentials configured, upstream calls will be unauthenticated");
    } else {
        info!(slots = slots.len(), source = ?slots[0].source, "Loaded credential slots");
    }
    Ok(slots)
}

fn load_configured(entries: &[CredentialEntry]) -> Vec<CredentialSlot> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            if entry.key.is_blank() {
                warn!(entry = i + 1, "Dropping blank credential entry");
                return None;
            }
            Some(CredentialSlot {
                credential: entry.key.clone(),
                model: non_blank(entry.model.as_ref()),
                source: CredentialSource::Config,
                entry: i + 1,
            })
        })
        .collect()
}

fn load_numbered(env: &HashMap<String, String>) -> Result<Vec<CredentialSlot>> {
    let mut numbered: BTreeMap<usize, &String> = BTreeMap::new();
    for (name, value) in env {
        let Some(suffix) = name.strip_prefix(NUMBERED_ENV_PREFIX) else {
            continue;
        };
        if suffix.ends_with(MODEL_SUFFIX) {
            continue;
        }
        match suffix.parse::<usize>() {
            Ok(n) if n >= 1 => {
                numbered.insert(n, value);
            }
            _ => warn!(variable = %name, "Ignoring malformed credential variable"),
        }
    }

    let Some(&last) = numbered.keys().next_back() else {
        return Ok(Vec::new());
    };
    if let Some(missing) = (1..=last).find(|n| !numbered.contains_key(n)) {
        return Err(AppError::Configuration(format!(
            "{prefix}{missing} is missing while {prefix}{last} is set",
            prefix = NUMBERED_ENV_PREFIX
        )));
    }

    let slots = numbered
        .into_iter()
        .filter_map(|(n, value)| {
            let credential = Credential::new(value.trim());
            if credential.is_blank() {
                warn!(entry = n, "Dropping blank credential entry");
                return None;
            }
            let model_var = format!("{NUMBERED_ENV_PREFIX}{n}{MODEL_SUFFIX}");
            Some(CredentialSlot {
                credential,
                model: non_blank(env.get(&model_var)),
                source: CredentialSource::Numbered,
                entry: n,
            })
        })
        .collect();
    Ok(slots)
}

fn load_legacy(env: &HashMap<String, String>) -> Vec<CredentialSlot> {
    LEGACY_ENV_KEYS
        .iter()
        .zip(LEGACY_ENV_MODELS.iter())
        .enumerate()
        .filter_map(|(i, (key_var, model_var))| {
            let value = env.get(*key_var)?;
            let credential = Credential::new(value.trim());
            if credential.is_blank() {
                warn!(entry = i + 1, variable = *key_var, "Dropping blank credential entry");
                return None;
            }
            Some(CredentialSlot {
                credential,
                model: non_blank(env.get(*model_var)),
                source: CredentialSource::Legacy,
                entry: i + 1,
            })
        })
        .collect()
}
