use geo::MultiPolygon;
use serde::Serialize;

/// One row of the case-count table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRecord {
    pub name: String,
    pub confirmed: u64,
    pub suspected: u64,
    pub recovered: u64,
    pub deaths: u64,
}

/// A polygon from the boundary file, tagged with its join key if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub key: Option<String>,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub boundaries: Vec<Boundary>,
    pub records: Vec<RegionRecord>,
}
