//! Environment/CLI bootstrap for the media relay core's configuration
//! facade (§6). This crate owns process-level concerns — which env vars are
//! recognized, home-directory composition, `.env` loading — and hands the
//! resolved values to `media-relay-core`'s `ConfigurationService` as a
//! `ScopedDefaults`. It never itself implements veto/changed listeners or
//! persistence; that is the in-crate facade's job.

use std::env;
use std::path::PathBuf;

const DEFAULT_SC_HOME_DIR_NAME: &str = ".sip-communicator";

/// Resolved values of the recognized environment/system options (§6's "CLI /
/// env surface"), before they are folded into the configuration facade's
/// defaults layer.
#[derive(Debug, Clone)]
pub struct RelayEnv {
    pub config_file_name: Option<String>,
    pub config_file_is_read_only: bool,
    pub sc_home_dir_location: Option<String>,
    pub sc_home_dir_name: String,
    pub disable_nack_termination: bool,
    pub remove_rtp_header_extensions: bool,
    pub fec_buf_size: Option<usize>,
    pub media_buf_size: Option<usize>,
}

impl RelayEnv {
    /// Reads the recognized variables from the process environment,
    /// loading a `.env` file first if one is present. Unset booleans default
    /// to `false`; unset sizes default to `None`, leaving the facade to fall
    /// back to its own built-in defaults (32/64, per §4.9).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        RelayEnv {
            config_file_name: env::var("CONFIG_FILE_NAME").ok(),
            config_file_is_read_only: parse_bool_env("CONFIG_FILE_IS_READ_ONLY"),
            sc_home_dir_location: env::var("SC_HOME_DIR_LOCATION").ok(),
            sc_home_dir_name: env::var("SC_HOME_DIR_NAME").unwrap_or_else(|_| DEFAULT_SC_HOME_DIR_NAME.to_string()),
            disable_nack_termination: parse_bool_env("DISABLE_NACK_TERMINATION"),
            remove_rtp_header_extensions: parse_bool_env("REMOVE_RTP_HEADER_EXTENSIONS"),
            fec_buf_size: parse_usize_env("FEC_BUF_SIZE"),
            media_buf_size: parse_usize_env("MEDIA_BUF_SIZE"),
        }
    }

    /// `SC_HOME_DIR_LOCATION`/`SC_HOME_DIR_NAME` composed into the directory
    /// that holds the defaults file, falling back to the current directory
    /// when no location is set.
    pub fn home_dir(&self) -> PathBuf {
        let base = self.sc_home_dir_location.as_deref().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        base.join(&self.sc_home_dir_name)
    }

    /// The defaults-file path: `config_file_name` under `home_dir()`, or
    /// `None` when no filename was configured (nothing to load/persist).
    pub fn config_file_path(&self) -> Option<PathBuf> {
        self.config_file_name.as_ref().map(|name| self.home_dir().join(name))
    }
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn parse_usize_env(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
