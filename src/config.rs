use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub districts: PathBuf,
    pub restaurants: PathBuf,
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    // Declared CRS, takes precedence over whatever the file says
    pub districts_crs: Option<String>,
    pub restaurants_crs: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingRatingPolicy {
    /// Unrated restaurants fail every active rating threshold.
    #[default]
    Exclude,
    /// Unrated restaurants pass when the threshold sits at the observed minimum.
    IncludeAtMinimum,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchemaConfig {
    pub group_candidates: Vec<String>,
    pub category_column: String,
    pub price_column: String,
    pub rating_column: String,
    pub longitude_aliases: Vec<String>,
    pub latitude_aliases: Vec<String>,
    pub missing_rating: MissingRatingPolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub map_image: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

fn default_load_timeout() -> u64 {
    30
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            group_candidates: strings(&["NEIGHBORHENAME", "NEIGHBORHANAME", "ADM1_EN", "NAME_1"]),
            category_column: "categories".to_string(),
            price_column: "price".to_string(),
            rating_column: "rating".to_string(),
            longitude_aliases: strings(&["longitude", "lng", "lon"]),
            latitude_aliases: strings(&["latitude", "lat"]),
            missing_rating: MissingRatingPolicy::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            map_image: PathBuf::from("output/map.png"),
            width: 1000,
            height: 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080, static_dir: None }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_input_section_is_required() {
        let config: AppConfig = toml::from_str(
            r#"
            [input]
            districts = "data/districts.geojson"
            restaurants = "data/restaurants.geojson"
            "#,
        )
        .unwrap();

        assert_eq!(config.input.load_timeout_secs, 30);
        assert_eq!(config.schema.group_candidates[0], "NEIGHBORHENAME");
        assert_eq!(config.schema.missing_rating, MissingRatingPolicy::Exclude);
        assert_eq!(config.output.width, 1000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn schema_overrides_merge_with_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [input]
            districts = "d.shp"
            restaurants = "r.geojson"
            districts_crs = "EPSG:3857"

            [schema]
            group_candidates = ["district"]
            missing_rating = "include_at_minimum"
            "#,
        )
        .unwrap();

        assert_eq!(config.input.districts_crs.as_deref(), Some("EPSG:3857"));
        assert_eq!(config.schema.group_candidates, vec!["district".to_string()]);
        assert_eq!(config.schema.rating_column, "rating");
        assert_eq!(config.schema.missing_rating, MissingRatingPolicy::IncludeAtMinimum);
    }
}
