//! Role configuration (spec §0.3, §6 "CLI"). Parses the `-o
//! key=val,key2=val2` mount-option string shared by the client mount
//! binary and, in this expansion, used as the config-file syntax for the
//! master and chunkserver-connector roles too, so all three share one
//! parser.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::multi::separated_list;
use nom::sequence::separated_pair;
use nom::IResult;
use serde::{Deserialize, Serialize};

/// Cache mode for the client mount (spec §6 CLI: `mfscachemode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    Never,
    Yes,
    Auto,
    Direct,
}

impl CacheMode {
    fn parse(s: &str) -> Result<CacheMode> {
        match s {
            "NEVER" => Ok(CacheMode::Never),
            "YES" => Ok(CacheMode::Yes),
            "AUTO" => Ok(CacheMode::Auto),
            "DIRECT" => Ok(CacheMode::Direct),
            other => bail!("unknown mfscachemode '{}'", other),
        }
    }
}

/// Client mount configuration (spec §6 CLI surface).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub master_host: String,
    pub master_port: u16,
    pub subfolder: String,
    pub cache_mode: CacheMode,
    pub chunkserver_connect_timeout: Duration,
    pub chunkserver_read_timeout: Duration,
    pub chunkserver_write_timeout: Duration,
    pub write_workers: u32,
    pub io_retries: u32,
    pub write_window_size: u32,
    pub attr_cache_ttl: Duration,
    pub entry_cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            master_host: "mfsmaster".to_string(),
            master_port: 9421,
            subfolder: "/".to_string(),
            cache_mode: CacheMode::Auto,
            chunkserver_connect_timeout: Duration::from_millis(2000),
            chunkserver_read_timeout: Duration::from_millis(2000),
            chunkserver_write_timeout: Duration::from_millis(5000),
            write_workers: 10,
            io_retries: 30,
            write_window_size: 16,
            attr_cache_ttl: Duration::from_secs(1),
            entry_cache_ttl: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Parses and overlays a `-o key=val,key2=val2` string onto the
    /// defaults. Unknown keys are rejected rather than ignored (spec §0.3).
    pub fn from_mount_options(opts: &str) -> Result<ClientConfig> {
        let mut config = ClientConfig::default();
        for (key, value) in parse_option_string(opts)? {
            match key.as_str() {
                "mfsmaster" => config.master_host = value,
                "mfsport" => config.master_port = value.parse().context("mfsport")?,
                "mfssubfolder" => config.subfolder = value,
                "mfscachemode" => config.cache_mode = CacheMode::parse(&value)?,
                "mfsconnecttimeout" => config.chunkserver_connect_timeout = millis(&value)?,
                "mfsreadtimeout" => config.chunkserver_read_timeout = millis(&value)?,
                "mfswritetimeout" => config.chunkserver_write_timeout = millis(&value)?,
                "mfswriteworkers" => config.write_workers = value.parse().context("mfswriteworkers")?,
                "mfsioretries" => config.io_retries = value.parse().context("mfsioretries")?,
                "mfswritewindowsize" => config.write_window_size = value.parse().context("mfswritewindowsize")?,
                "mfsattrcacheto" => config.attr_cache_ttl = seconds(&value)?,
                "mfsentrycacheto" => config.entry_cache_ttl = seconds(&value)?,
                other => bail!("unknown mount option '{}'", other),
            }
        }
        Ok(config)
    }
}

/// Master daemon configuration (§0.3 "a `Config` struct per role").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub data_dir: String,
    pub listen_port: u16,
    pub changelog_rotate_lines: u64,
    pub quota_grace_period: Duration,
    pub default_trashtime: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            data_dir: "/var/lib/lizardfs/master".to_string(),
            listen_port: 9420,
            changelog_rotate_lines: 1_000_000,
            quota_grace_period: Duration::from_secs(7 * 86400),
            default_trashtime: 86400,
        }
    }
}

impl MasterConfig {
    pub fn from_options(opts: &str) -> Result<MasterConfig> {
        let mut config = MasterConfig::default();
        for (key, value) in parse_option_string(opts)? {
            match key.as_str() {
                "datadir" => config.data_dir = value,
                "port" => config.listen_port = value.parse().context("port")?,
                "changelogrotatelines" => config.changelog_rotate_lines = value.parse().context("changelogrotatelines")?,
                "quotagraceperiod" => config.quota_grace_period = seconds(&value)?,
                "defaulttrashtime" => config.default_trashtime = value.parse().context("defaulttrashtime")?,
                other => bail!("unknown master option '{}'", other),
            }
        }
        Ok(config)
    }
}

/// Chunkserver-connector pool configuration (C10), consulted by
/// [`crate::chunk::connector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    pub idle_pool_size: usize,
    pub health_decay_half_life: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            connect_timeout: Duration::from_millis(2000),
            idle_pool_size: 16,
            health_decay_half_life: Duration::from_secs(60),
        }
    }
}

impl ConnectorConfig {
    pub fn from_options(opts: &str) -> Result<ConnectorConfig> {
        let mut config = ConnectorConfig::default();
        for (key, value) in parse_option_string(opts)? {
            match key.as_str() {
                "connecttimeout" => config.connect_timeout = millis(&value)?,
                "idlepoolsize" => config.idle_pool_size = value.parse().context("idlepoolsize")?,
                "healthdecayhalflife" => config.health_decay_half_life = seconds(&value)?,
                other => bail!("unknown connector option '{}'", other),
            }
        }
        Ok(config)
    }
}

fn millis(value: &str) -> Result<Duration> {
    Ok(Duration::from_millis(value.parse().context("duration value")?))
}

fn seconds(value: &str) -> Result<Duration> {
    Ok(Duration::from_secs(value.parse().context("duration value")?))
}

fn key_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn value_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ',' && c != '=')(input)
}

fn pair(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(key_token, char('='), value_token)(input)
}

fn option_list(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    separated_list(char(','), pair)(input)
}

/// Parses a `key=val,key2=val2` string into an ordered map, rejecting
/// anything the grammar doesn't recognize (spec §0.3).
fn parse_option_string(input: &str) -> Result<HashMap<String, String>> {
    if input.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let (rest, pairs) = option_list(input).map_err(|e| anyhow!("malformed option string: {}", e))?;
    if !rest.is_empty() {
        bail!("trailing garbage in option string: '{}'", rest);
    }
    Ok(pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_overlays_named_options_onto_defaults() {
        let config = ClientConfig::from_mount_options("mfsmaster=10.0.0.1,mfsport=9999,mfscachemode=DIRECT").unwrap();
        assert_eq!(config.master_host, "10.0.0.1");
        assert_eq!(config.master_port, 9999);
        assert_eq!(config.cache_mode, CacheMode::Direct);
        assert_eq!(config.write_workers, ClientConfig::default().write_workers);
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(ClientConfig::from_mount_options("bogus=1").is_err());
    }

    #[test]
    fn empty_option_string_yields_defaults() {
        let config = ClientConfig::from_mount_options("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn master_config_parses_its_own_keys() {
        let config = MasterConfig::from_options("port=9111,defaulttrashtime=0").unwrap();
        assert_eq!(config.listen_port, 9111);
        assert_eq!(config.default_trashtime, 0);
    }
}
