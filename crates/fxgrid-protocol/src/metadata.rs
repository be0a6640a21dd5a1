//! Plugin descriptions
//!
//! Exchanged between the server, its sandboxes and scan children, and stored
//! in the known-plugin catalog and the recents lists.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PluginFormat {
    /// Processors compiled into the server.
    Builtin,
    Vst3,
    Vst2,
    AudioUnit,
}

impl PluginFormat {
    pub fn name(self) -> &'static str {
        match self {
            PluginFormat::Builtin => "Builtin",
            PluginFormat::Vst3 => "VST3",
            PluginFormat::Vst2 => "VST",
            PluginFormat::AudioUnit => "AudioUnit",
        }
    }

    /// Parses the names accepted on the command line, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "builtin" => Some(PluginFormat::Builtin),
            "vst3" => Some(PluginFormat::Vst3),
            "vst" | "vst2" => Some(PluginFormat::Vst2),
            "au" | "audiounit" => Some(PluginFormat::AudioUnit),
            _ => None,
        }
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity and capabilities of one loadable plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginDescription {
    /// Human-readable name
    pub name: String,

    pub format: PluginFormat,

    /// Bundle path for file-based formats, identifier otherwise.
    /// This is what a loader receives.
    pub file_or_identifier: String,

    /// Format-specific unique id, distinguishes shells holding several plugins.
    pub unique_id: u32,

    pub vendor: String,

    pub version: String,

    pub category: String,

    pub num_inputs: u32,

    pub num_outputs: u32,

    pub is_instrument: bool,

    #[serde(default)]
    pub supports_f64: bool,
}

impl PluginDescription {
    pub fn new(
        name: impl Into<String>,
        format: PluginFormat,
        file_or_identifier: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            file_or_identifier: file_or_identifier.into(),
            unique_id: 0,
            vendor: String::new(),
            version: "1.0.0".to_string(),
            category: String::new(),
            num_inputs: 2,
            num_outputs: 2,
            is_instrument: false,
            supports_f64: false,
        }
    }

    pub fn unique_id(mut self, id: u32) -> Self {
        self.unique_id = id;
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn audio_io(mut self, inputs: u32, outputs: u32) -> Self {
        self.num_inputs = inputs;
        self.num_outputs = outputs;
        self
    }

    pub fn instrument(mut self, is_instrument: bool) -> Self {
        self.is_instrument = is_instrument;
        self
    }

    pub fn f64_support(mut self, supports_f64: bool) -> Self {
        self.supports_f64 = supports_f64;
        self
    }

    /// Same plugin regardless of display metadata.
    pub fn is_duplicate_of(&self, other: &PluginDescription) -> bool {
        self.file_or_identifier == other.file_or_identifier && self.unique_id == other.unique_id
    }

    /// Key used by catalogs and exclusion sets.
    pub fn identifier(&self) -> String {
        format!("{}-{:x}", self.file_or_identifier, self.unique_id)
    }
}
