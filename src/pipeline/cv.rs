//! Blueprint computer vision: scale detection, roof boundary
//! measurement, and feature detection.
//!
//! Pages come in as rendered PNGs. Edges are found with Canny, contours
//! traced and filtered by area, aspect ratio, and solidity, then scaled
//! to square feet through the detected pixels-per-foot ratio.

use std::path::Path;
use std::sync::LazyLock;

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::edges::canny;
use imageproc::geometry::convex_hull;
use imageproc::point::Point;
use regex::Regex;
use tracing::debug;

use crate::config::CvConfig;
use crate::error::{PipelineError, Result};
use crate::models::{FeatureKind, RegionMeasurement, RoofFeature};

/// A parsed scale annotation.
#[derive(Debug, Clone)]
pub struct ScaleInfo {
    pub pixels_per_foot: f64,
    pub confidence: f64,
    /// The matched annotation text, for audit.
    pub annotation: String,
}

/// Scale annotation patterns. Each maps a match to feet-per-inch of
/// paper; pixels-per-foot follows from the render DPI.
struct ScalePattern {
    re: Regex,
    confidence: f64,
    /// Convert captures to feet represented by one inch of paper.
    feet_per_inch: fn(&regex::Captures<'_>) -> Option<f64>,
}

/// Compiled once and reused across pages and documents.
static SCALE_PATTERNS: LazyLock<Vec<ScalePattern>> = LazyLock::new(|| {
    vec![
        // 1" = 20'
        ScalePattern {
            re: Regex::new(r#"1\s*(?:"|”)\s*=\s*(\d+(?:\.\d+)?)\s*'"#).unwrap(),
            confidence: 0.9,
            feet_per_inch: |caps| caps[1].parse().ok(),
        },
        // SCALE: 1/4" = 1'-0"  (a quarter inch of paper per foot)
        ScalePattern {
            re: Regex::new(r#"(?i)scale\s*:?\s*1\s*/\s*(\d+)\s*(?:"|”)?\s*=\s*1\s*'"#).unwrap(),
            confidence: 0.85,
            feet_per_inch: |caps| caps[1].parse::<f64>().ok(),
        },
        // 3/16" = 1'-0" without the SCALE prefix
        ScalePattern {
            re: Regex::new(r#"(\d+)\s*/\s*(\d+)\s*(?:"|”)\s*=\s*1\s*'"#).unwrap(),
            confidence: 0.75,
            feet_per_inch: |caps| {
                let num: f64 = caps[1].parse().ok()?;
                let den: f64 = caps[2].parse().ok()?;
                if num > 0.0 {
                    Some(den / num)
                } else {
                    None
                }
            },
        },
    ]
});

/// Locate a scale annotation in page OCR text and convert it to a
/// pixels-per-foot ratio at the given render DPI.
pub fn detect_scale(ocr_text: &str, dpi: u32) -> Option<ScaleInfo> {
    for spec in SCALE_PATTERNS.iter() {
        if let Some(caps) = spec.re.captures(ocr_text) {
            let feet_per_inch = (spec.feet_per_inch)(&caps)?;
            if feet_per_inch <= 0.0 {
                continue;
            }
            let pixels_per_foot = dpi as f64 / feet_per_inch;
            debug!(
                annotation = &caps[0],
                pixels_per_foot, "scale annotation found"
            );
            return Some(ScaleInfo {
                pixels_per_foot,
                confidence: spec.confidence,
                annotation: caps[0].trim().to_string(),
            });
        }
    }
    None
}

/// Shoelace area of a closed pixel contour.
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        twice_area += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (twice_area.abs() as f64) / 2.0
}

/// Axis-aligned bounding box (x, y, w, h).
pub fn bounding_box(points: &[Point<i32>]) -> (i32, i32, i32, i32) {
    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    (min_x, min_y, (max_x - min_x).max(1), (max_y - min_y).max(1))
}

/// Area over convex-hull area, in (0, 1].
pub fn solidity(points: &[Point<i32>]) -> f64 {
    let area = polygon_area(points);
    if area <= 0.0 {
        return 0.0;
    }
    let hull = convex_hull(points);
    let hull_area = polygon_area(&hull);
    if hull_area <= 0.0 {
        return 0.0;
    }
    (area / hull_area).min(1.0)
}

/// Geometry summary of one traced contour.
#[derive(Debug, Clone)]
pub struct ContourStats {
    pub area_px: f64,
    pub bbox: (i32, i32, i32, i32),
    pub aspect: f64,
    pub solidity: f64,
    /// Area over bounding-box area; near 1 for rectangles.
    pub rectangularity: f64,
}

pub fn contour_stats(contour: &Contour<i32>) -> ContourStats {
    let area_px = polygon_area(&contour.points);
    let bbox = bounding_box(&contour.points);
    let (w, h) = (bbox.2 as f64, bbox.3 as f64);
    ContourStats {
        area_px,
        bbox,
        aspect: w / h,
        solidity: solidity(&contour.points),
        rectangularity: if w * h > 0.0 { area_px / (w * h) } else { 0.0 },
    }
}

/// Output of analyzing one rendered blueprint page.
#[derive(Debug, Default)]
pub struct PageAnalysis {
    pub regions: Vec<RegionMeasurement>,
    pub features: Vec<RoofFeature>,
    /// Confidence that real roof boundaries were found.
    pub boundary_confidence: f64,
}

/// Analyze a rendered page: find the roof boundary contours and the
/// feature shapes, scaled by `pixels_per_foot` when available.
pub fn analyze_page(
    image_path: &Path,
    pixels_per_foot: Option<f64>,
    page_text: &str,
    cfg: &CvConfig,
) -> Result<PageAnalysis> {
    let gray = image::open(image_path)
        .map_err(|e| PipelineError::Upstream(format!("cannot open page image: {e}")))?
        .to_luma8();
    Ok(analyze_gray(&gray, pixels_per_foot, page_text, cfg))
}

fn analyze_gray(
    gray: &GrayImage,
    pixels_per_foot: Option<f64>,
    page_text: &str,
    cfg: &CvConfig,
) -> PageAnalysis {
    let edges = canny(gray, cfg.canny_low, cfg.canny_high);
    let contours: Vec<Contour<i32>> = find_contours(&edges);

    let mut analysis = PageAnalysis::default();
    let mut feature_counts = FeatureCounts::default();
    let text_mentions_equipment = {
        let upper = page_text.to_uppercase();
        ["HVAC", "RTU", "UNIT", "CONDENSER"]
            .iter()
            .any(|t| upper.contains(t))
    };

    for contour in &contours {
        if contour.border_type != BorderType::Outer || contour.points.len() < 8 {
            continue;
        }
        let stats = contour_stats(contour);

        if is_roof_boundary(&stats, cfg) {
            if let Some(ppf) = pixels_per_foot {
                let area_sqft = stats.area_px / (ppf * ppf);
                analysis.regions.push(RegionMeasurement {
                    area_sqft,
                    method: crate::models::MeasurementMethod::Cv,
                    confidence: 0.85,
                    bbox: Some([
                        stats.bbox.0 as f64,
                        stats.bbox.1 as f64,
                        stats.bbox.2 as f64,
                        stats.bbox.3 as f64,
                    ]),
                });
            }
            continue;
        }

        if let Some(ppf) = pixels_per_foot {
            classify_feature(&stats, ppf, text_mentions_equipment, &mut feature_counts);
        }
    }

    analysis.features = feature_counts.into_features();
    analysis.boundary_confidence = if analysis.regions.is_empty() {
        0.3
    } else {
        0.9
    };
    analysis
}

fn is_roof_boundary(stats: &ContourStats, cfg: &CvConfig) -> bool {
    stats.area_px >= cfg.min_contour_area
        && stats.aspect >= cfg.aspect_min
        && stats.aspect <= cfg.aspect_max
        && stats.solidity >= cfg.min_solidity
}

#[derive(Debug, Default)]
struct FeatureCounts {
    drains: u32,
    exhaust_ports: u32,
    walkways: u32,
    equipment_pads: u32,
    equipment: u32,
}

impl FeatureCounts {
    fn into_features(self) -> Vec<RoofFeature> {
        let mut features = Vec::new();
        let mut push = |kind: FeatureKind, count: u32, confidence: f64| {
            if count > 0 {
                features.push(RoofFeature::new(kind, count, confidence));
            }
        };
        push(FeatureKind::Drain, self.drains, 0.75);
        push(FeatureKind::ExhaustPort, self.exhaust_ports, 0.7);
        push(FeatureKind::Walkway, self.walkways, 0.7);
        push(FeatureKind::EquipmentPad, self.equipment_pads, 0.65);
        push(FeatureKind::Equipment, self.equipment, 0.7);
        features
    }
}

/// Sort a small contour into a feature bucket. Circles are recognized by
/// near-square extent with elliptical fill, then split into drain or
/// exhaust port by physical diameter.
fn classify_feature(
    stats: &ContourStats,
    ppf: f64,
    text_mentions_equipment: bool,
    counts: &mut FeatureCounts,
) {
    let (w_px, h_px) = (stats.bbox.2 as f64, stats.bbox.3 as f64);
    let diameter_ft = w_px.max(h_px) / ppf;
    let area_sqft = stats.area_px / (ppf * ppf);

    // Ignore speckle below a drain-sized footprint.
    if diameter_ft < 0.3 || stats.area_px < 30.0 {
        return;
    }

    let near_square = (0.8..=1.25).contains(&stats.aspect);
    let ellipse_fill = stats.area_px / (std::f64::consts::FRAC_PI_4 * w_px * h_px);
    if near_square && (0.7..=1.1).contains(&ellipse_fill) && diameter_ft <= 6.0 {
        if diameter_ft < 2.0 {
            counts.drains += 1;
        } else {
            counts.exhaust_ports += 1;
        }
        return;
    }

    let elongated = stats.aspect >= 4.0 || stats.aspect <= 0.25;
    if stats.rectangularity >= 0.85 && elongated && area_sqft >= 20.0 {
        counts.walkways += 1;
        return;
    }
    if stats.rectangularity >= 0.85 && area_sqft >= 10.0 && area_sqft <= 400.0 {
        counts.equipment_pads += 1;
        return;
    }
    if text_mentions_equipment && area_sqft >= 50.0 && stats.solidity < 0.85 {
        counts.equipment += 1;
    }
}
