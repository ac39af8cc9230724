use crate::colorscale::{ColorScale, Palette};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub style: StyleConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    /// GeoJSON or Shapefile, picked by extension
    pub boundaries: PathBuf,
    pub data_csv: PathBuf,
    /// Feature property holding the region name
    pub join_property: String,
    pub columns: ColumnConfig,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            boundaries: PathBuf::from("china_province.geojson"),
            data_csv: PathBuf::from("data.csv"),
            join_property: "NL_NAME_1".to_string(),
            columns: ColumnConfig::default(),
        }
    }
}

/// CSV headers. They double as the hover labels.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ColumnConfig {
    pub region: String,
    pub confirmed: String,
    pub suspected: String,
    pub recovered: String,
    pub deaths: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            region: "地区".to_string(),
            confirmed: "确诊".to_string(),
            suspected: "疑似".to_string(),
            recovered: "治愈".to_string(),
            deaths: "死亡".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogPolicy {
    /// ln(0) stays -inf and the region is left unshaded
    #[default]
    PassThrough,
    /// ln(max(c, 1))
    Clamp,
    /// zero counts are an error
    Reject,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackgroundStyle {
    #[default]
    CartoDarkmatter,
    CartoPositron,
    OpenStreetMap,
    WhiteBg,
}

impl BackgroundStyle {
    /// Raster basemap URL template, `None` for a plain background.
    pub fn tile_url(&self) -> Option<&'static str> {
        match self {
            BackgroundStyle::CartoDarkmatter => {
                Some("https://basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png")
            }
            BackgroundStyle::CartoPositron => {
                Some("https://basemaps.cartocdn.com/light_all/{z}/{x}/{y}.png")
            }
            BackgroundStyle::OpenStreetMap => {
                Some("https://tile.openstreetmap.org/{z}/{x}/{y}.png")
            }
            BackgroundStyle::WhiteBg => None,
        }
    }

    pub fn attribution(&self) -> &'static str {
        match self {
            BackgroundStyle::CartoDarkmatter | BackgroundStyle::CartoPositron => {
                "&copy; OpenStreetMap contributors &copy; CARTO"
            }
            BackgroundStyle::OpenStreetMap => "&copy; OpenStreetMap contributors",
            BackgroundStyle::WhiteBg => "",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct Center {
    pub lat: f64,
    pub lon: f64,
}

impl Default for Center {
    fn default() -> Self {
        Self {
            lat: 37.110573,
            lon: 106.493924,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StyleConfig {
    pub color_scale: ColorScale,
    pub reverse_scale: bool,
    pub background_style: BackgroundStyle,
    pub zoom: u8,
    pub center: Center,
    pub fill_opacity: f64,
    pub border_width: f64,
    pub border_color: String, // Hex code
    pub show_scale: bool,
    pub log_policy: LogPolicy,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            color_scale: ColorScale::new(Palette::Viridis),
            reverse_scale: false,
            background_style: BackgroundStyle::default(),
            zoom: 3,
            center: Center::default(),
            fill_opacity: 0.8,
            border_width: 0.8,
            border_color: "#444444".to_string(),
            show_scale: true,
            log_policy: LogPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8050 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Falls back to the built-in defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_file(p),
            None => Ok(Self::default()),
        }
    }
}
