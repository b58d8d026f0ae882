// SPDX-License-Identifier: GPL-3.0-only

//! NFS export bindings and their client options.

use serde::{Deserialize, Serialize};

use crate::pool::DatasetKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn as_option(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Squash {
    #[default]
    Root,
    All,
    None,
}

impl Squash {
    pub fn as_option(self) -> &'static str {
        match self {
            Self::Root => "root_squash",
            Self::All => "all_squash",
            Self::None => "no_root_squash",
        }
    }
}

/// Client-facing options of a single export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Host, network (`10.0.0.0/24`) or wildcard allowed to mount the export.
    pub client: String,
    #[serde(default)]
    pub access: AccessMode,
    #[serde(default)]
    pub squash: Squash,
    #[serde(default = "default_sync")]
    pub sync: bool,
    /// Additional raw export options passed through unchanged.
    #[serde(default)]
    pub extra: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_sync() -> bool {
    true
}

fn is_client_char(character: char) -> bool {
    character.is_ascii_alphanumeric()
        || matches!(character, '.' | '-' | '_' | '*' | '?' | '/' | ':' | '[' | ']' | '@')
}

fn is_option_char(character: char) -> bool {
    character.is_ascii_alphanumeric()
        || matches!(character, '_' | '-' | '=' | ':' | '.' | '/' | '@' | '+')
}

fn validate_client(client: &str) -> Result<(), String> {
    if client.is_empty() {
        return Err("export client is empty".to_string());
    }
    match client.chars().find(|character| !is_client_char(*character)) {
        Some(bad) => Err(format!("export client {client:?} contains {bad:?}")),
        None => Ok(()),
    }
}

fn validate_extra(extra: &[String]) -> Result<(), String> {
    for option in extra {
        if option.is_empty() || !option.chars().all(is_option_char) {
            return Err(format!("invalid export option {option:?}"));
        }
    }
    Ok(())
}

fn validate_comment(comment: &str) -> Result<(), String> {
    if comment.chars().any(char::is_control) {
        return Err("export comment contains control characters".to_string());
    }
    Ok(())
}

/// Export names end up in a marker line of the exports file.
pub fn validate_export_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() || name.chars().any(char::is_control) {
        return Err(format!("invalid export name {name:?}"));
    }
    Ok(())
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            client: "*".to_string(),
            access: AccessMode::default(),
            squash: Squash::default(),
            sync: true,
            extra: Vec::new(),
            comment: None,
        }
    }
}

impl ExportOptions {
    pub fn for_client(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            ..Self::default()
        }
    }

    /// Render the comma separated option list used in an exports line.
    pub fn render(&self) -> String {
        let mut options = vec![
            self.access.as_option().to_string(),
            self.squash.as_option().to_string(),
            if self.sync { "sync" } else { "async" }.to_string(),
        ];
        options.extend(self.extra.iter().cloned());
        options.join(",")
    }

    /// Check that the options render to exactly one well-formed exports line.
    pub fn validate(&self) -> Result<(), String> {
        validate_client(&self.client)?;
        validate_extra(&self.extra)?;
        if let Some(comment) = &self.comment {
            validate_comment(comment)?;
        }
        Ok(())
    }

    /// Inverse of [`ExportOptions::render`]. Unknown tokens are kept in `extra`.
    pub fn parse(client: &str, options: &str) -> Self {
        let mut parsed = Self::for_client(client);

        for token in options.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "ro" => parsed.access = AccessMode::ReadOnly,
                "rw" => parsed.access = AccessMode::ReadWrite,
                "root_squash" => parsed.squash = Squash::Root,
                "all_squash" => parsed.squash = Squash::All,
                "no_root_squash" => parsed.squash = Squash::None,
                "sync" => parsed.sync = true,
                "async" => parsed.sync = false,
                other => parsed.extra.push(other.to_string()),
            }
        }

        parsed
    }

    /// Field-level differences between `self` and `other`.
    pub fn diff(&self, other: &ExportOptions) -> Vec<OptionChange> {
        let mut changes = Vec::new();

        if self.client != other.client {
            changes.push(OptionChange::new("client", &self.client, &other.client));
        }
        if self.access != other.access {
            changes.push(OptionChange::new(
                "access",
                self.access.as_option(),
                other.access.as_option(),
            ));
        }
        if self.squash != other.squash {
            changes.push(OptionChange::new(
                "squash",
                self.squash.as_option(),
                other.squash.as_option(),
            ));
        }
        if self.sync != other.sync {
            changes.push(OptionChange::new(
                "sync",
                &self.sync.to_string(),
                &other.sync.to_string(),
            ));
        }
        if self.extra != other.extra {
            changes.push(OptionChange::new(
                "extra",
                &self.extra.join(","),
                &other.extra.join(","),
            ));
        }
        if self.comment != other.comment {
            changes.push(OptionChange::new(
                "comment",
                self.comment.as_deref().unwrap_or_default(),
                other.comment.as_deref().unwrap_or_default(),
            ));
        }

        changes
    }

    /// Apply a partial update, leaving unspecified fields untouched.
    pub fn merged(&self, patch: &ExportOptionsPatch) -> Self {
        Self {
            client: patch.client.clone().unwrap_or_else(|| self.client.clone()),
            access: patch.access.unwrap_or(self.access),
            squash: patch.squash.unwrap_or(self.squash),
            sync: patch.sync.unwrap_or(self.sync),
            extra: patch.extra.clone().unwrap_or_else(|| self.extra.clone()),
            comment: match &patch.comment {
                Some(comment) if comment.is_empty() => None,
                Some(comment) => Some(comment.clone()),
                None => self.comment.clone(),
            },
        }
    }
}

/// Partial export options carried by a share update.
///
/// An empty `comment` clears the comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptionsPatch {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub access: Option<AccessMode>,
    #[serde(default)]
    pub squash: Option<Squash>,
    #[serde(default)]
    pub sync: Option<bool>,
    #[serde(default)]
    pub extra: Option<Vec<String>>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ExportOptionsPatch {
    /// Validate the fields the patch sets.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(client) = &self.client {
            validate_client(client)?;
        }
        if let Some(extra) = &self.extra {
            validate_extra(extra)?;
        }
        if let Some(comment) = &self.comment {
            validate_comment(comment)?;
        }
        Ok(())
    }
}

impl From<ExportOptions> for ExportOptionsPatch {
    fn from(options: ExportOptions) -> Self {
        Self {
            client: Some(options.client),
            access: Some(options.access),
            squash: Some(options.squash),
            sync: Some(options.sync),
            extra: Some(options.extra),
            comment: Some(options.comment.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionChange {
    pub field: &'static str,
    pub old: String,
    pub new: String,
}

impl OptionChange {
    fn new(field: &'static str, old: &str, new: &str) -> Self {
        Self {
            field,
            old: old.to_string(),
            new: new.to_string(),
        }
    }
}

/// A named export of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBinding {
    pub dataset: DatasetKey,
    pub name: String,
    pub options: ExportOptions,
    /// Producer sequence number of the event that last wrote this binding.
    #[serde(default)]
    pub sequence: u64,
}

impl ExportBinding {
    pub fn new(dataset: DatasetKey, name: impl Into<String>, options: ExportOptions) -> Self {
        Self {
            dataset,
            name: name.into(),
            options,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_export_name(&self.name)?;
        self.options.validate()
    }
}
