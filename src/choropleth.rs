use crate::colorscale::{ColorRange, ColorScale};
use crate::config::{ColumnConfig, StyleConfig};
use crate::types::{Boundary, RegionRecord};
use geo::MultiPolygon;
use image::Rgba;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Hover payload for a matched region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoverInfo {
    pub region: String,
    pub confirmed: u64,
    pub suspected: u64,
    pub recovered: u64,
    pub deaths: u64,
    /// Serialized as `null` when non-finite.
    pub log_confirmed: Option<f64>,
    pub text: String,
}

impl HoverInfo {
    fn new(record: &RegionRecord, value: f64, labels: &ColumnConfig) -> Self {
        Self {
            region: record.name.clone(),
            confirmed: record.confirmed,
            suspected: record.suspected,
            recovered: record.recovered,
            deaths: record.deaths,
            log_confirmed: value.is_finite().then_some(value),
            text: hover_text(record, labels),
        }
    }
}

/// Region name in bold, then one line per count. Names and labels are HTML-escaped.
pub fn hover_text(record: &RegionRecord, labels: &ColumnConfig) -> String {
    format!(
        "<b>{}</b><br><br>{}：{}<br>{}：{}<br>{}：{}<br>{}：{}<br>",
        escape_html(&record.name),
        escape_html(&labels.confirmed),
        record.confirmed,
        escape_html(&labels.suspected),
        record.suspected,
        escape_html(&labels.recovered),
        record.recovered,
        escape_html(&labels.deaths),
        record.deaths,
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ChoroplethFeature {
    pub key: Option<String>,
    pub geometry: MultiPolygon<f64>,
    /// Derived value of the matched row, if any
    pub value: Option<f64>,
    /// `None` for unmatched features and non-finite values
    pub fill: Option<Rgba<u8>>,
    pub hover: Option<HoverInfo>,
}

impl ChoroplethFeature {
    pub fn is_matched(&self) -> bool {
        self.hover.is_some()
    }

    pub fn is_colored(&self) -> bool {
        self.fill.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Choropleth {
    pub features: Vec<ChoroplethFeature>,
    /// Table rows whose name matched no feature
    pub unmatched_rows: Vec<String>,
    pub range: Option<ColorRange>,
    pub scale: ColorScale,
}

impl Choropleth {
    pub fn colored(&self) -> impl Iterator<Item = &ChoroplethFeature> {
        self.features.iter().filter(|f| f.is_colored())
    }
}

/// Joins rows to boundaries by region name and assigns fill colors.
///
/// `values` is the derived column, parallel to `records`. A repeated region name is
/// resolved last-row-wins. The color range spans every finite value in the table,
/// including rows that match no feature.
pub fn build_choropleth(
    boundaries: Vec<Boundary>,
    records: &[RegionRecord],
    values: &[f64],
    style: &StyleConfig,
    labels: &ColumnConfig,
) -> Choropleth {
    debug_assert_eq!(records.len(), values.len());

    let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if by_name.insert(record.name.as_str(), i).is_some() {
            warn!("Region '{}' appears more than once; using the last row", record.name);
        }
    }

    let matched: Vec<Option<usize>> = boundaries
        .iter()
        .map(|b| b.key.as_deref().and_then(|k| by_name.get(k).copied()))
        .collect();

    let range = ColorRange::from_values(values.iter().copied());
    let scale = style.color_scale.with_reverse(style.reverse_scale);

    let mut used = vec![false; records.len()];
    let features: Vec<ChoroplethFeature> = boundaries
        .into_iter()
        .zip(matched)
        .map(|(boundary, row)| {
            let Some(i) = row else {
                return ChoroplethFeature {
                    key: boundary.key,
                    geometry: boundary.geometry,
                    value: None,
                    fill: None,
                    hover: None,
                };
            };
            used[i] = true;
            let value = values[i];
            let fill = match range {
                Some(r) if value.is_finite() => Some(scale.sample(r.normalize(value))),
                _ => None,
            };
            ChoroplethFeature {
                key: boundary.key,
                geometry: boundary.geometry,
                value: Some(value),
                fill,
                hover: Some(HoverInfo::new(&records[i], value, labels)),
            }
        })
        .collect();

    let unmatched_rows: Vec<String> = by_name
        .iter()
        .filter(|(_, i)| !used[**i])
        .map(|(&name, &i)| (i, name.to_string()))
        .collect::<std::collections::BTreeMap<_, _>>()
        .into_values()
        .collect();

    for name in &unmatched_rows {
        debug!("No boundary feature for region '{}'", name);
    }

    let choropleth = Choropleth {
        features,
        unmatched_rows,
        range,
        scale,
    };

    info!(
        "Joined {} of {} regions to {} features ({} colored, {} unmatched rows)",
        choropleth.features.iter().filter(|f| f.is_matched()).count(),
        by_name.len(),
        choropleth.features.len(),
        choropleth.colored().count(),
        choropleth.unmatched_rows.len(),
    );

    choropleth
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::colorscale::Palette;
    use crate::config::LogPolicy;
    use crate::transform::derive_log_confirmed;
    use geo::{polygon, Polygon};

    impl Choropleth {
        pub(crate) fn feature(&self, key: &str) -> Option<&ChoroplethFeature> {
            self.features.iter().find(|f| f.key.as_deref() == Some(key))
        }
    }

    pub(crate) fn square(key: &str, x: f64, y: f64, size: f64) -> Boundary {
        let p: Polygon<f64> = polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
            (x: x, y: y),
        ];
        Boundary {
            key: Some(key.to_string()),
            geometry: MultiPolygon::new(vec![p]),
        }
    }

    pub(crate) fn record(name: &str, c: u64, s: u64, r: u64, d: u64) -> RegionRecord {
        RegionRecord {
            name: name.to_string(),
            confirmed: c,
            suspected: s,
            recovered: r,
            deaths: d,
        }
    }

    pub(crate) fn build(boundaries: Vec<Boundary>, records: &[RegionRecord]) -> Choropleth {
        let values = derive_log_confirmed(records, LogPolicy::PassThrough).unwrap();
        build_choropleth(
            boundaries,
            records,
            &values,
            &StyleConfig::default(),
            &ColumnConfig::default(),
        )
    }

    #[test]
    fn test_single_region_scenario() {
        let ch = build(vec![square("X", 100.0, 30.0, 5.0)], &[record("X", 100, 10, 5, 1)]);

        let x = ch.feature("X").unwrap();
        assert!(x.is_colored());
        assert!((x.value.unwrap() - 4.605).abs() < 1e-3);

        let hover = x.hover.as_ref().unwrap();
        assert_eq!(
            hover.text,
            "<b>X</b><br><br>确诊：100<br>疑似：10<br>治愈：5<br>死亡：1<br>"
        );
        let pos = |needle: &str| hover.text.find(needle).unwrap();
        assert!(pos("100") < pos("10<") && pos("10<") < pos("5<") && pos("5<") < pos("1<"));

        // single value: degenerate range, low end of the scale
        assert_eq!(x.fill, Some(ColorScale::new(Palette::Viridis).sample(0.0)));
    }

    #[test]
    fn test_unmatched_rows_and_features() {
        let ch = build(
            vec![square("X", 0.0, 0.0, 1.0), square("W", 2.0, 0.0, 1.0)],
            &[record("X", 10, 0, 0, 0), record("Nowhere", 3, 0, 0, 0)],
        );

        assert!(ch.feature("X").unwrap().is_colored());
        let w = ch.feature("W").unwrap();
        assert!(!w.is_matched());
        assert!(!w.is_colored());
        assert_eq!(ch.unmatched_rows, vec!["Nowhere".to_string()]);
        assert_eq!(ch.colored().count(), 1);
    }

    #[test]
    fn test_range_includes_unmatched_rows() {
        let ch = build(
            vec![square("A", 0.0, 0.0, 1.0), square("B", 2.0, 0.0, 1.0)],
            &[
                record("A", 10, 0, 0, 0),
                record("B", 1000, 0, 0, 0),
                record("Elsewhere", 1_000_000, 0, 0, 0),
            ],
        );
        let range = ch.range.unwrap();
        assert_eq!(range.min, 10f64.ln());
        assert_eq!(range.max, 1_000_000f64.ln());

        // ln 1000 sits halfway between ln 10 and ln 1e6
        let viridis = ColorScale::new(Palette::Viridis);
        assert_eq!(ch.feature("A").unwrap().fill, Some(viridis.sample(0.0)));
        assert_eq!(
            ch.feature("B").unwrap().fill,
            Some(viridis.sample(range.normalize(1000f64.ln())))
        );
        assert_ne!(ch.feature("B").unwrap().fill, Some(viridis.sample(1.0)));
    }

    #[test]
    fn test_range_from_unmatched_rows_only() {
        let ch = build(vec![square("A", 0.0, 0.0, 1.0)], &[record("Nowhere", 40, 0, 0, 0)]);
        assert_eq!(ch.range.unwrap().min, 40f64.ln());
        assert_eq!(ch.colored().count(), 0);
    }

    #[test]
    fn test_hover_text_escapes_names_and_labels() {
        let labels = ColumnConfig {
            confirmed: "a<b".to_string(),
            ..ColumnConfig::default()
        };
        let text = hover_text(&record("<script>\"x\"&", 1, 2, 3, 4), &labels);
        assert!(text.starts_with("<b>&lt;script&gt;&quot;x&quot;&amp;</b><br><br>a&lt;b：1<br>"));
        assert!(!text.contains("<script>"));
    }

    #[test]
    fn test_zero_confirmed_is_matched_but_unshaded() {
        let ch = build(
            vec![square("A", 0.0, 0.0, 1.0), square("Z", 2.0, 0.0, 1.0)],
            &[record("A", 50, 0, 0, 0), record("Z", 0, 4, 0, 0)],
        );
        let z = ch.feature("Z").unwrap();
        assert!(z.is_matched());
        assert!(!z.is_colored());
        assert_eq!(z.value, Some(f64::NEG_INFINITY));
        assert_eq!(z.hover.as_ref().unwrap().log_confirmed, None);
        assert_eq!(ch.range.unwrap().min, 50f64.ln());
    }

    #[test]
    fn test_empty_table() {
        let ch = build(vec![square("X", 0.0, 0.0, 1.0)], &[]);
        assert_eq!(ch.colored().count(), 0);
        assert!(ch.range.is_none());
        assert!(ch.unmatched_rows.is_empty());
        assert_eq!(ch.features.len(), 1);
    }

    #[test]
    fn test_duplicate_name_last_row_wins() {
        let ch = build(
            vec![square("X", 0.0, 0.0, 1.0)],
            &[record("X", 5, 0, 0, 0), record("X", 9, 0, 0, 0)],
        );
        let x = ch.feature("X").unwrap();
        assert_eq!(x.hover.as_ref().unwrap().confirmed, 9);
        assert!(ch.unmatched_rows.is_empty());
    }

    #[test]
    fn test_reverse_scale_flips_fill() {
        let style = StyleConfig {
            reverse_scale: true,
            ..StyleConfig::default()
        };
        let records = [record("A", 10, 0, 0, 0), record("B", 100, 0, 0, 0)];
        let values = derive_log_confirmed(&records, LogPolicy::PassThrough).unwrap();
        let ch = build_choropleth(
            vec![square("A", 0.0, 0.0, 1.0), square("B", 2.0, 0.0, 1.0)],
            &records,
            &values,
            &style,
            &ColumnConfig::default(),
        );
        let viridis = ColorScale::new(Palette::Viridis);
        assert_eq!(ch.feature("A").unwrap().fill, Some(viridis.sample(1.0)));
    }
}
