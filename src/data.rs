use crate::config::{AppConfig, ColumnConfig};
use crate::types::{Boundary, Dataset, RegionRecord};
use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use geo::MultiPolygon;
use shapefile::Reader;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

pub fn load_data(config: &AppConfig) -> Result<Dataset> {
    let boundaries = load_boundaries(&config.input.boundaries, &config.input.join_property)?;
    info!("Loaded {} boundary features", boundaries.len());

    let records = load_records(&config.input.data_csv, &config.input.columns)?;
    info!("Loaded case counts for {} regions", records.len());

    Ok(Dataset {
        boundaries,
        records,
    })
}

pub fn load_boundaries(path: &Path, join_property: &str) -> Result<Vec<Boundary>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("Boundary file has no extension: {:?}", path))?;

    match extension.as_str() {
        "shp" => load_shapefile(path, join_property),
        "json" | "geojson" => load_geojson(path, join_property),
        _ => Err(anyhow!("Unsupported geometry format: {}", extension)),
    }
}

pub fn load_records(path: &Path, columns: &ColumnConfig) -> Result<Vec<RegionRecord>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    let headers = rdr
        .headers()
        .with_context(|| format!("Failed to read CSV header: {:?}", path))?
        .clone();

    let index_of = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}') == name)
            .ok_or_else(|| anyhow!("Column '{}' not found in {:?}", name, path))
    };
    let region_idx = index_of(&columns.region)?;
    let count_idx = [
        index_of(&columns.confirmed)?,
        index_of(&columns.suspected)?,
        index_of(&columns.recovered)?,
        index_of(&columns.deaths)?,
    ];

    let mut records = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        // header is line 1
        let line = row + 2;
        let record = result.with_context(|| format!("Malformed CSV at line {}", line))?;

        let mut counts = [0u64; 4];
        for (slot, &idx) in counts.iter_mut().zip(&count_idx) {
            let raw = record.get(idx).unwrap_or("");
            *slot = raw.parse().with_context(|| {
                format!(
                    "Invalid count {:?} in column '{}' at line {}",
                    raw, &headers[idx], line
                )
            })?;
        }

        records.push(RegionRecord {
            name: record.get(region_idx).unwrap_or("").to_string(),
            confirmed: counts[0],
            suspected: counts[1],
            recovered: counts[2],
            deaths: counts[3],
        });
    }

    Ok(records)
}

fn load_shapefile(path: &Path, join_property: &str) -> Result<Vec<Boundary>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut boundaries = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let key = match record.get(join_property) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => Some(s.clone()),
            Some(shapefile::dbase::FieldValue::Character(None)) | None => None,
            Some(_) => {
                return Err(anyhow!(
                    "Shapefile join column '{}' must be a string",
                    join_property
                ))
            }
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => continue, // Skip non-polygon shapes
        };

        boundaries.push(Boundary { key, geometry });
    }

    Ok(boundaries)
}

fn load_geojson(path: &Path, join_property: &str) -> Result<Vec<Boundary>> {
    use geojson::GeoJson;

    debug!("Loading GeoJSON from {:?}", path);
    let file =
        File::open(path).with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let reader = BufReader::new(file);

    let geojson = GeoJson::from_reader(reader)
        .with_context(|| format!("Failed to parse GeoJSON: {:?}", path))?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut boundaries = Vec::new();

    for feature in collection.features {
        let key = match feature
            .properties
            .as_ref()
            .and_then(|props| props.get(join_property))
        {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let valid_geo: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;

                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue, // Skip points/lines
                }
            }
            None => continue,
        };

        boundaries.push(Boundary { key, geometry });
    }

    Ok(boundaries)
}
