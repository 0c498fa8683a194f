//! Typed configuration facade (component K).
//!
//! Three-layer lookup per key: immutable defaults → mutable store → defaults
//! file (§4.11). `set` fires a pre-commit vetoable event before mutating, and
//! a post-commit changed event after. Persistence serializes through a
//! pluggable [`ConfigFormat`]; the core itself never touches a filesystem —
//! callers hand in the bytes to load and get the bytes to write back out.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{MediaEngineError, MediaEngineResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// A listener consulted before (`veto`) and after (`changed`) a key's value
/// changes. Both callbacks run on the caller's thread inside `set` (§4.11);
/// `veto` must be quick and side-effect-free, since it may abort the write.
pub trait ChangeListener: Send + Sync {
    /// Return `Err` to abort the pending write. `new_value` is `None` when
    /// the pending write would remove the key.
    fn veto(&self, key: &str, new_value: Option<&str>) -> MediaEngineResult<()> {
        let _ = (key, new_value);
        Ok(())
    }

    fn changed(&self, key: &str, new_value: Option<&str>) {
        let _ = (key, new_value);
    }
}

/// Defaults supplied at construction time, immutable for the service's
/// lifetime. A key marked `system` also mirrors into the process
/// environment whenever it is set (§4.11's "system-property promotion").
#[derive(Debug, Clone, Default)]
pub struct ScopedDefaults {
    values: HashMap<String, String>,
    system_keys: std::collections::HashSet<String>,
}

impl ScopedDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Marks `key` as a system property: every future `set` for it also
    /// writes into `std::env` under the same name.
    pub fn with_system_key(mut self, key: impl Into<String>) -> Self {
        self.system_keys.insert(key.into());
        self
    }

    /// Builds the facade's immutable-defaults layer from the process
    /// environment bootstrap (§6). `FEC_BUF_SIZE`/`MEDIA_BUF_SIZE` fall back
    /// to this core's own built-in buffer sizes when unset.
    pub fn from_relay_env(relay_env: &armoricore_config::RelayEnv) -> Self {
        let mut defaults = ScopedDefaults::new()
            .with_default(
                "FEC_BUF_SIZE",
                relay_env.fec_buf_size.unwrap_or(crate::fec::DEFAULT_FEC_BUF_SIZE).to_string(),
            )
            .with_default(
                "MEDIA_BUF_SIZE",
                relay_env.media_buf_size.unwrap_or(crate::fec::DEFAULT_MEDIA_BUF_SIZE).to_string(),
            )
            .with_default("DISABLE_NACK_TERMINATION", relay_env.disable_nack_termination.to_string())
            .with_default("REMOVE_RTP_HEADER_EXTENSIONS", relay_env.remove_rtp_header_extensions.to_string());
        if let Some(name) = &relay_env.config_file_name {
            defaults = defaults.with_default("CONFIG_FILE_NAME", name.clone());
        }
        defaults
    }
}

/// Chooses the on-disk encoding for persisted properties (§4.11, §6). Two
/// variants are textually round-trip equivalent for string values; the
/// choice is normally driven by the defaults file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `key=value`, one per line; a leading `*` on the key marks that line
    /// as an immutable default re-applied on load.
    Properties,
    /// `<properties><entry key="...">value</entry>...</properties>`.
    Xml,
}

impl ConfigFormat {
    /// Picks a format from a defaults-file name by extension, defaulting to
    /// `Properties` for anything not recognized as XML.
    pub fn from_file_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".xml") {
            ConfigFormat::Xml
        } else {
            ConfigFormat::Properties
        }
    }

    pub fn serialize(self, store: &HashMap<String, String>, immutable_keys: &[String]) -> String {
        match self {
            ConfigFormat::Properties => {
                let mut out = String::new();
                for (key, value) in store {
                    let prefix = if immutable_keys.iter().any(|k| k == key) { "*" } else { "" };
                    out.push_str(&format!("{}{}={}\n", prefix, key, escape_properties(value)));
                }
                out
            }
            ConfigFormat::Xml => {
                let mut out = String::from("<properties>\n");
                for (key, value) in store {
                    out.push_str(&format!(
                        "  <entry key=\"{}\">{}</entry>\n",
                        escape_xml(key),
                        escape_xml(value)
                    ));
                }
                out.push_str("</properties>\n");
                out
            }
        }
    }

    /// Parses previously-persisted text back into `(key, value, is_immutable)`
    /// triples. `is_immutable` is only ever set by the `Properties` format's
    /// leading `*` convention; the XML format has no such marker.
    pub fn parse(self, text: &str) -> MediaEngineResult<Vec<(String, String, bool)>> {
        match self {
            ConfigFormat::Properties => {
                let mut out = Vec::new();
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (key_part, value) = line.split_once('=').ok_or_else(|| {
                        MediaEngineError::ParseError(format!("malformed property line: {line}"))
                    })?;
                    let (immutable, key) = match key_part.strip_prefix('*') {
                        Some(rest) => (true, rest),
                        None => (false, key_part),
                    };
                    if key.is_empty() {
                        return Err(MediaEngineError::ParseError("empty key".to_string()));
                    }
                    out.push((key.to_string(), unescape_properties(value), immutable));
                }
                Ok(out)
            }
            ConfigFormat::Xml => {
                let mut out = Vec::new();
                let mut rest = text;
                while let Some(start) = rest.find("<entry key=\"") {
                    rest = &rest[start + "<entry key=\"".len()..];
                    let key_end = rest
                        .find('"')
                        .ok_or_else(|| MediaEngineError::ParseError("unterminated entry key".to_string()))?;
                    let key = unescape_xml(&rest[..key_end]);
                    rest = &rest[key_end..];
                    let gt = rest
                        .find('>')
                        .ok_or_else(|| MediaEngineError::ParseError("malformed entry tag".to_string()))?;
                    rest = &rest[gt + 1..];
                    let value_end = rest
                        .find("</entry>")
                        .ok_or_else(|| MediaEngineError::ParseError("unterminated entry".to_string()))?;
                    let value = unescape_xml(&rest[..value_end]);
                    rest = &rest[value_end + "</entry>".len()..];
                    if key.is_empty() {
                        return Err(MediaEngineError::ParseError("empty key".to_string()));
                    }
                    out.push((key, value, false));
                }
                Ok(out)
            }
        }
    }
}

fn escape_properties(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape_properties(value: &str) -> String {
    value.replace("\\n", "\n").replace("\\\\", "\\")
}

fn escape_xml(value: &str) -> String {
    value.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn unescape_xml(value: &str) -> String {
    value.replace("&quot;", "\"").replace("&gt;", ">").replace("&lt;", "<").replace("&amp;", "&")
}

struct Inner {
    defaults: ScopedDefaults,
    /// Values loaded from, or re-serialized to, the defaults file. Re-read on
    /// every lookup miss against `store` so a `*`-marked immutable default
    /// re-surfaces after a key is removed, per §4.11.
    defaults_file: HashMap<String, String>,
    immutable_file_keys: Vec<String>,
    store: HashMap<String, String>,
    read_only: bool,
    listeners: Vec<Arc<dyn ChangeListener>>,
}

/// The configuration facade itself. One instance typically serves an entire
/// session; `set`/`get` are cheap single-mutex operations (§5: lifecycle
/// transitions, not the per-packet hot path).
pub struct ConfigurationService {
    inner: Mutex<Inner>,
}

impl ConfigurationService {
    pub fn new(defaults: ScopedDefaults) -> Self {
        ConfigurationService {
            inner: Mutex::new(Inner {
                defaults,
                defaults_file: HashMap::new(),
                immutable_file_keys: Vec::new(),
                store: HashMap::new(),
                read_only: false,
                listeners: Vec::new(),
            }),
        }
    }

    /// Loads a previously-persisted defaults file (§4.11, §6). Keys marked
    /// immutable in the file behave like `defaults`: they always win over a
    /// removed mutable key.
    pub fn load_defaults_file(&self, format: ConfigFormat, text: &str) -> MediaEngineResult<()> {
        let parsed = format.parse(text)?;
        let mut inner = self.inner.lock().unwrap();
        inner.defaults_file.clear();
        inner.immutable_file_keys.clear();
        for (key, value, immutable) in parsed {
            if immutable {
                inner.immutable_file_keys.push(key.clone());
            }
            inner.defaults_file.insert(key, value);
        }
        Ok(())
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().unwrap().read_only = read_only;
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    /// Three-layer lookup: immutable defaults, then the mutable store, then
    /// the defaults file (§4.11). Defaults passed at construction take
    /// precedence over the persisted file, matching "immutable defaults"
    /// being the outermost layer.
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .defaults
            .values
            .get(key)
            .or_else(|| inner.store.get(key))
            .or_else(|| inner.defaults_file.get(key))
            .cloned()
    }

    pub fn get_or(&self, key: &str, fallback: &str) -> String {
        self.get(key).unwrap_or_else(|| fallback.to_string())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Sets `key` to `value`, or removes it when `value` is `None` (§4.11:
    /// "setting value=null removes the key"). Fires the veto event first;
    /// any listener may abort the write by returning `Err`. On commit, fires
    /// the changed event and, if the key was registered as a system key,
    /// mirrors it into the process environment.
    pub fn set(&self, key: &str, value: Option<&str>) -> MediaEngineResult<()> {
        if key.is_empty() {
            return Err(MediaEngineError::ParseError("empty key".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(MediaEngineError::Veto("configuration is read-only".to_string()));
        }
        for listener in &inner.listeners {
            listener.veto(key, value)?;
        }

        match value {
            Some(v) => {
                inner.store.insert(key.to_string(), v.to_string());
            }
            None => {
                inner.store.remove(key);
            }
        }
        let is_system = inner.defaults.system_keys.contains(key);
        if is_system {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
        trace!(key, value, "configuration key changed");
        for listener in &inner.listeners {
            listener.changed(key, value);
        }
        Ok(())
    }

    /// Serializes the current mutable store for persistence, honoring
    /// read-only mode by refusing the write outright (§6's
    /// `CONFIG_FILE_IS_READ_ONLY`).
    pub fn persist(&self, format: ConfigFormat) -> MediaEngineResult<String> {
        let inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(MediaEngineError::Veto("configuration is read-only, refusing to persist".to_string()));
        }
        debug!(keys = inner.store.len(), "persisting configuration store");
        Ok(format.serialize(&inner.store, &inner.immutable_file_keys))
    }
}
