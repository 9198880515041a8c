use std::path::PathBuf;

use anyhow::{Context as _, bail};
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub tv: TvConfig,
    pub keyboard: KeyboardConfig,
    pub switch: SwitchConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TvConfig {
    pub host: String,
    pub port: Option<u16>,
    /// Pairing key from a previous registration with the TV. Without one the
    /// TV will reject commands until it is paired out-of-band.
    pub client_key: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct KeyboardConfig {
    /// USB vendor id, 4 hex digits (udev ID_VENDOR_ID format).
    pub vendor_id: String,
    /// USB product id, 4 hex digits (udev ID_MODEL_ID format).
    pub product_id: String,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SwitchConfig {
    /// webOS app id to launch while the keyboard is attached.
    pub connected_input: String,
    /// webOS app id to launch while the keyboard is absent.
    pub disconnected_input: String,
    #[serde(default = "default_wake_screen")]
    pub wake_screen: bool,
}

fn default_wake_screen() -> bool {
    true
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_usb_id(&self.keyboard.vendor_id).context("keyboard.vendor_id")?;
        validate_usb_id(&self.keyboard.product_id).context("keyboard.product_id")?;
        if self.tv.host.is_empty() {
            bail!("tv.host must not be empty");
        }
        if self.switch.connected_input.is_empty() || self.switch.disconnected_input.is_empty() {
            bail!("switch inputs must not be empty");
        }
        Ok(())
    }
}

fn validate_usb_id(id: &str) -> anyhow::Result<()> {
    if id.len() != 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("expected 4 hex digits, got {id:?}");
    }
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lgswitch")
        .join("config.toml")
}

pub fn load(path: &PathBuf) -> anyhow::Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: AppConfig =
        toml::de::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
