use crate::choropleth::{Choropleth, ChoroplethFeature};
use crate::colorscale::parse_hex;
use crate::config::StyleConfig;
use anyhow::{Context, Result};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::{LineString, Point};
use image::{ImageBuffer, ImageOutputFormat, Pixel, Rgba, RgbaImage};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

// Constants for Web Mercator
pub const TILE_SIZE: u32 = 256;
pub const MAX_ZOOM: u8 = 22;
const MAX_LAT: f64 = 85.051_128_779_806_59;
const MAX_CACHED_TILES: usize = 4096;

// Wrapper for RTree indexing
struct FeatureIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for FeatureIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// The choropleth ready for display: spatial index, paint settings and a PNG cache.
pub struct MapLayer {
    choropleth: Choropleth,
    tree: RTree<FeatureIndex>,
    fill_alpha: u8,
    border: Option<Brush>,
    /// Shared PNG for tiles with no features in them
    empty_tile: Arc<Vec<u8>>,
    cache: Mutex<HashMap<(u8, u32, u32), Arc<Vec<u8>>>>,
    cache_limit: usize,
}

#[derive(Debug, Clone, Copy)]
struct Brush {
    color: Rgba<u8>,
    size: i64,
}

impl MapLayer {
    pub fn new(choropleth: Choropleth, style: &StyleConfig) -> Result<Self> {
        let tree_items: Vec<FeatureIndex> = choropleth
            .features
            .iter()
            .enumerate()
            .filter_map(|(i, feature)| {
                let rect = feature.geometry.bounding_rect()?;
                Some(FeatureIndex {
                    index: i,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();
        let tree = RTree::bulk_load(tree_items);

        let border = if style.border_width > 0.0 {
            let mut color = parse_hex(&style.border_color)
                .with_context(|| "Invalid style.border_color")?;
            // widths below one pixel are drawn as a single translucent pixel
            let size = style.border_width.ceil().max(1.0);
            color[3] = to_alpha(style.border_width / size);
            Some(Brush {
                color,
                size: size as i64,
            })
        } else {
            None
        };

        Ok(Self {
            choropleth,
            tree,
            fill_alpha: to_alpha(style.fill_opacity),
            border,
            empty_tile: Arc::new(encode_png(&ImageBuffer::new(TILE_SIZE, TILE_SIZE))?),
            cache: Mutex::new(HashMap::new()),
            cache_limit: MAX_CACHED_TILES,
        })
    }

    pub fn choropleth(&self) -> &Choropleth {
        &self.choropleth
    }

    /// Topmost feature containing the point.
    pub fn feature_at(&self, lat: f64, lon: f64) -> Option<&ChoroplethFeature> {
        let point = Point::new(lon, lat);
        self.candidates(&AABB::from_point([lon, lat]))
            .into_iter()
            .rev()
            .map(|i| &self.choropleth.features[i])
            .find(|feature| feature.geometry.contains(&point))
    }

    /// Feature indices whose bounding box meets the envelope, in draw order.
    fn candidates(&self, envelope: &AABB<[f64; 2]>) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(envelope)
            .map(|item| item.index)
            .collect();
        found.sort_unstable();
        found
    }

    fn tile_candidates(&self, z: u8, x: u32, y: u32) -> Vec<usize> {
        let origin_x = x as f64 * TILE_SIZE as f64;
        let origin_y = y as f64 * TILE_SIZE as f64;
        let (north, west) = world_pixel_to_lat_lon(origin_x, origin_y, z);
        let (south, east) = world_pixel_to_lat_lon(
            origin_x + TILE_SIZE as f64,
            origin_y + TILE_SIZE as f64,
            z,
        );
        self.candidates(&AABB::from_corners([west, south], [east, north]))
    }

    /// Renders one tile, `None` if the address is outside the tile grid.
    pub fn render_tile(&self, z: u8, x: u32, y: u32) -> Option<RgbaImage> {
        if !tile_in_range(z, x, y) {
            return None;
        }
        let started = Instant::now();

        let origin_x = x as f64 * TILE_SIZE as f64;
        let origin_y = y as f64 * TILE_SIZE as f64;
        let candidates = self.tile_candidates(z, x, y);

        let mut img: RgbaImage = ImageBuffer::new(TILE_SIZE, TILE_SIZE);
        if candidates.is_empty() {
            return Some(img);
        }

        let filled: Vec<&ChoroplethFeature> = candidates
            .iter()
            .rev()
            .map(|&i| &self.choropleth.features[i])
            .filter(|f| f.fill.is_some())
            .collect();

        if !filled.is_empty() {
            let alpha = self.fill_alpha;
            img.par_enumerate_pixels_mut().for_each(|(px, py, pixel)| {
                let (lat, lon) =
                    world_pixel_to_lat_lon(origin_x + px as f64 + 0.5, origin_y + py as f64 + 0.5, z);
                let point = Point::new(lon, lat);
                if let Some(fill) = filled
                    .iter()
                    .find(|f| f.geometry.contains(&point))
                    .and_then(|f| f.fill)
                {
                    *pixel = Rgba([fill[0], fill[1], fill[2], alpha]);
                }
            });
        }

        if let Some(brush) = self.border {
            for &i in &candidates {
                for polygon in &self.choropleth.features[i].geometry {
                    draw_ring(&mut img, polygon.exterior(), z, origin_x, origin_y, brush);
                    for interior in polygon.interiors() {
                        draw_ring(&mut img, interior, z, origin_x, origin_y, brush);
                    }
                }
            }
        }

        debug!(
            "Rendered tile {}/{}/{} with {} features in {:?}",
            z,
            x,
            y,
            candidates.len(),
            started.elapsed()
        );
        Some(img)
    }

    /// PNG bytes for a tile. Tiles with features are cached up to `cache_limit`
    /// entries; empty tiles all share one PNG and are never cached.
    pub fn tile_png(&self, z: u8, x: u32, y: u32) -> Result<Option<Arc<Vec<u8>>>> {
        if !tile_in_range(z, x, y) {
            return Ok(None);
        }
        if let Some(hit) = self.lock_cache().get(&(z, x, y)) {
            return Ok(Some(hit.clone()));
        }
        if self.tile_candidates(z, x, y).is_empty() {
            return Ok(Some(self.empty_tile.clone()));
        }

        let Some(img) = self.render_tile(z, x, y) else {
            return Ok(None);
        };
        let png = Arc::new(encode_png(&img)?);

        let mut cache = self.lock_cache();
        if cache.len() < self.cache_limit {
            cache.insert((z, x, y), png.clone());
        }
        Ok(Some(png))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<(u8, u32, u32), Arc<Vec<u8>>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .context("Failed to encode tile as PNG")?;
    Ok(bytes)
}

fn to_alpha(opacity: f64) -> u8 {
    (opacity.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn tile_in_range(z: u8, x: u32, y: u32) -> bool {
    if z > MAX_ZOOM {
        return false;
    }
    let n = 1u64 << z;
    (x as u64) < n && (y as u64) < n
}

// Coordinate conversions
pub fn lat_lon_to_world_pixel(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let n = 2.0_f64.powi(zoom as i32) * TILE_SIZE as f64;
    let x = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.clamp(-MAX_LAT, MAX_LAT).to_radians();
    let y = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n;
    (x, y)
}

pub fn world_pixel_to_lat_lon(x: f64, y: f64, zoom: u8) -> (f64, f64) {
    let n = 2.0_f64.powi(zoom as i32) * TILE_SIZE as f64;
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    (lat, lon)
}

fn draw_ring(
    img: &mut RgbaImage,
    ring: &LineString<f64>,
    zoom: u8,
    origin_x: f64,
    origin_y: f64,
    brush: Brush,
) {
    let local = |c: &geo::Coord<f64>| {
        let (x, y) = lat_lon_to_world_pixel(c.y, c.x, zoom);
        (x - origin_x, y - origin_y)
    };
    for line in ring.lines() {
        draw_segment(img, local(&line.start), local(&line.end), brush);
    }
}

fn draw_segment(img: &mut RgbaImage, from: (f64, f64), to: (f64, f64), brush: Brush) {
    let pad = brush.size as f64;
    let size = TILE_SIZE as f64;
    let Some((a, b)) = clip_segment(from, to, -pad, size + pad) else {
        return;
    };

    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
    let half = (brush.size - 1) / 2;
    let mut last = None;

    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let cx = (a.0 + dx * t).floor() as i64;
        let cy = (a.1 + dy * t).floor() as i64;
        if last == Some((cx, cy)) {
            continue;
        }
        last = Some((cx, cy));

        for ox in 0..brush.size {
            for oy in 0..brush.size {
                let (px, py) = (cx - half + ox, cy - half + oy);
                if px >= 0 && py >= 0 && px < TILE_SIZE as i64 && py < TILE_SIZE as i64 {
                    img.get_pixel_mut(px as u32, py as u32).blend(&brush.color);
                }
            }
        }
    }
}

/// Liang-Barsky clip of a segment against the square [lo, hi]².
fn clip_segment(
    a: (f64, f64),
    b: (f64, f64),
    lo: f64,
    hi: f64,
) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;

    for (p, q) in [
        (-dx, a.0 - lo),
        (dx, hi - a.0),
        (-dy, a.1 - lo),
        (dy, hi - a.1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }

    Some((
        (a.0 + t0 * dx, a.1 + t0 * dy),
        (a.0 + t1 * dx, a.1 + t1 * dy),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choropleth::tests::{build, record, square};

    fn lat_lon_to_tile(lat: f64, lon: f64, zoom: u8) -> (u32, u32) {
        let (x, y) = lat_lon_to_world_pixel(lat, lon, zoom);
        let max = (1u64 << zoom) as f64 - 1.0;
        let tx = (x / TILE_SIZE as f64).floor().clamp(0.0, max);
        let ty = (y / TILE_SIZE as f64).floor().clamp(0.0, max);
        (tx as u32, ty as u32)
    }

    fn layer() -> MapLayer {
        let ch = build(
            vec![square("X", 100.0, 30.0, 10.0), square("W", 80.0, 30.0, 5.0)],
            &[record("X", 100, 10, 5, 1)],
        );
        MapLayer::new(ch, &StyleConfig::default()).unwrap()
    }

    #[test]
    fn test_world_pixel_round_trip() {
        let (x, y) = lat_lon_to_world_pixel(0.0, 0.0, 0);
        assert!((x - 128.0).abs() < 1e-9);
        assert!((y - 128.0).abs() < 1e-9);

        let (x, y) = lat_lon_to_world_pixel(37.110573, 106.493924, 3);
        let (lat, lon) = world_pixel_to_lat_lon(x, y, 3);
        assert!((lat - 37.110573).abs() < 1e-9);
        assert!((lon - 106.493924).abs() < 1e-9);
    }

    #[test]
    fn test_tile_for_default_center() {
        assert_eq!(lat_lon_to_tile(37.110573, 106.493924, 3), (6, 3));
        assert_eq!(lat_lon_to_tile(89.9, 180.0, 2), (3, 0));
    }

    #[test]
    fn test_tile_range() {
        assert!(tile_in_range(0, 0, 0));
        assert!(!tile_in_range(0, 1, 0));
        assert!(tile_in_range(3, 7, 7));
        assert!(!tile_in_range(3, 8, 0));
        assert!(!tile_in_range(MAX_ZOOM + 1, 0, 0));
    }

    #[test]
    fn test_render_fills_matched_feature() {
        let layer = layer();
        let img = layer.render_tile(3, 6, 3).unwrap();
        let fill = layer.choropleth().feature("X").unwrap().fill.unwrap();

        // inside X, away from its borders
        assert_eq!(*img.get_pixel(85, 43), Rgba([fill[0], fill[1], fill[2], 204]));
        // east of X, nothing drawn
        assert_eq!(*img.get_pixel(150, 43), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_unmatched_feature_is_outlined_not_filled() {
        let layer = layer();
        // W spans lon 80..85, lat 30..35
        let (tx, ty) = lat_lon_to_tile(32.5, 82.5, 5);
        let img = layer.render_tile(5, tx, ty).unwrap();

        let (cx, cy) = lat_lon_to_world_pixel(32.5, 82.5, 5);
        let center = img.get_pixel(
            (cx - tx as f64 * 256.0) as u32,
            (cy - ty as f64 * 256.0) as u32,
        );
        assert_eq!(center[3], 0);
        assert!(img.pixels().any(|p| p[3] > 0));
    }

    #[test]
    fn test_empty_ocean_tile_is_transparent() {
        let img = layer().render_tile(3, 0, 7).unwrap();
        assert!(img.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn test_feature_at() {
        let layer = layer();
        assert_eq!(
            layer.feature_at(35.0, 105.0).and_then(|f| f.key.as_deref()),
            Some("X")
        );
        assert!(layer.feature_at(32.0, 82.0).unwrap().hover.is_none());
        assert!(layer.feature_at(-10.0, 0.0).is_none());
    }

    #[test]
    fn test_tile_png_is_cached() {
        let layer = layer();
        let first = layer.tile_png(3, 6, 3).unwrap().unwrap();
        let second = layer.tile_png(3, 6, 3).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&first[1..4], b"PNG");
        assert!(layer.tile_png(3, 9, 0).unwrap().is_none());
    }

    #[test]
    fn test_empty_tiles_share_one_png_and_skip_cache() {
        let layer = layer();
        let a = layer.tile_png(3, 0, 7).unwrap().unwrap();
        let b = layer.tile_png(4, 0, 15).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &layer.empty_tile));
        assert!(layer.lock_cache().is_empty());
    }

    #[test]
    fn test_cache_stops_growing_at_limit() {
        let mut layer = layer();
        layer.cache_limit = 1;

        // X spans lon 100..110, lat 30..40
        let (x4, y4) = lat_lon_to_tile(35.0, 105.0, 4);
        let (x5, y5) = lat_lon_to_tile(35.0, 105.0, 5);
        layer.tile_png(4, x4, y4).unwrap().unwrap();
        let first = layer.tile_png(5, x5, y5).unwrap().unwrap();
        let second = layer.tile_png(5, x5, y5).unwrap().unwrap();

        assert_eq!(layer.lock_cache().len(), 1);
        assert!(layer.lock_cache().contains_key(&(4, x4, y4)));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
    }

    #[test]
    fn test_clip_segment() {
        assert!(clip_segment((-10.0, -10.0), (-5.0, -1.0), 0.0, 256.0).is_none());
        let (a, b) = clip_segment((-100.0, 10.0), (400.0, 10.0), 0.0, 256.0).unwrap();
        assert!(a.0.abs() < 1e-9 && (a.1 - 10.0).abs() < 1e-9);
        assert!((b.0 - 256.0).abs() < 1e-9 && (b.1 - 10.0).abs() < 1e-9);
    }
}
