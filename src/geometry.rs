//! Frame-space geometry: points, bounding boxes and named polygonal zones.
//!
//! All coordinates are pixels in the frame the detector saw. Zones are static
//! for the lifetime of a session; membership tests are boundary-inclusive.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned box given by its top-left and bottom-right corners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    /// Fraction of `self` covered by `other`. Zero for degenerate boxes.
    pub fn overlap_ratio(&self, other: &BoundingBox) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / area
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Entrance,
    ProductArea,
    Checkout,
    General,
}

/// Named polygonal region of the frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub kind: ZoneKind,
    pub vertices: Vec<Point>,
    /// Display color (RGB). Not used for analysis.
    pub color: [u8; 3],
}

impl Zone {
    pub fn new(
        name: impl Into<String>,
        kind: ZoneKind,
        vertices: Vec<Point>,
        color: [u8; 3],
    ) -> Result<Self> {
        let name = name.into();
        validate_zone_name(&name)?;
        if vertices.len() < 3 {
            return Err(anyhow!(
                "zone '{}' needs at least 3 vertices, got {}",
                name,
                vertices.len()
            ));
        }
        if vertices.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(anyhow!("zone '{}' has a non-finite vertex", name));
        }
        Ok(Self {
            name,
            kind,
            vertices,
            color,
        })
    }

    /// Axis-aligned rectangular zone.
    pub fn rect(
        name: impl Into<String>,
        kind: ZoneKind,
        top_left: Point,
        bottom_right: Point,
        color: [u8; 3],
    ) -> Result<Self> {
        let b = BoundingBox::new(top_left.x, top_left.y, bottom_right.x, bottom_right.y);
        Self::new(
            name,
            kind,
            vec![
                Point::new(b.x1, b.y1),
                Point::new(b.x2, b.y1),
                Point::new(b.x2, b.y2),
                Point::new(b.x1, b.y2),
            ],
            color,
        )
    }

    /// Point-in-polygon test. Points on an edge or vertex count as inside.
    pub fn contains(&self, p: Point) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[i];
            let b = self.vertices[j];
            if on_segment(a, b, p) {
                return true;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    const EPS: f64 = 1e-9;
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EPS * (1.0 + a.distance(&b)) {
        return false;
    }
    p.x >= a.x.min(b.x) - EPS
        && p.x <= a.x.max(b.x) + EPS
        && p.y >= a.y.min(b.y) - EPS
        && p.y <= a.y.max(b.y) + EPS
}

/// Zone names are short local labels: `[a-z0-9_-]{1,64}`.
pub fn validate_zone_name(name: &str) -> Result<()> {
    static ZONE_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_-]{1,64}$").expect("zone name pattern is valid")
    });
    if !re.is_match(name) {
        return Err(anyhow!(
            "zone name '{}' must match [a-z0-9_-] and be 1..=64 chars",
            name
        ));
    }
    Ok(())
}

/// Three regions along the frame diagonal: entrance (top-left third),
/// product area (center) and checkout (bottom-right third).
pub fn default_zones(width: u32, height: u32) -> Result<Vec<Zone>> {
    let w = f64::from(width);
    let h = f64::from(height);
    Ok(vec![
        Zone::rect(
            "entrance",
            ZoneKind::Entrance,
            Point::new(0.0, 0.0),
            Point::new(w / 3.0, h / 3.0),
            [0, 255, 0],
        )?,
        Zone::rect(
            "product_area",
            ZoneKind::ProductArea,
            Point::new(w / 3.0, h / 3.0),
            Point::new(2.0 * w / 3.0, 2.0 * h / 3.0),
            [255, 0, 0],
        )?,
        Zone::rect(
            "checkout",
            ZoneKind::Checkout,
            Point::new(2.0 * w / 3.0, 2.0 * h / 3.0),
            Point::new(w, h),
            [0, 0, 255],
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Zone {
        Zone::rect(
            "square",
            ZoneKind::General,
            Point::new(10.0, 10.0),
            Point::new(20.0, 20.0),
            [1, 2, 3],
        )
        .unwrap()
    }

    #[test]
    fn contains_is_boundary_inclusive() {
        let z = square();
        assert!(z.contains(Point::new(15.0, 15.0)));
        assert!(z.contains(Point::new(10.0, 15.0)));
        assert!(z.contains(Point::new(20.0, 20.0)));
        assert!(!z.contains(Point::new(20.5, 15.0)));
        assert!(!z.contains(Point::new(5.0, 5.0)));
    }

    #[test]
    fn concave_polygon() {
        // L-shape with the top-right quadrant cut away.
        let z = Zone::new(
            "ell",
            ZoneKind::General,
            vec![
                Point::new(0.0, 0.0),
                Point::new(5.0, 0.0),
                Point::new(5.0, 5.0),
                Point::new(10.0, 5.0),
                Point::new(10.0, 10.0),
                Point::new(0.0, 10.0),
            ],
            [0, 0, 0],
        )
        .unwrap();
        assert!(z.contains(Point::new(2.0, 2.0)));
        assert!(z.contains(Point::new(8.0, 8.0)));
        assert!(!z.contains(Point::new(8.0, 2.0)));
    }

    #[test]
    fn rejects_bad_zones() {
        assert!(Zone::new("Bad Name", ZoneKind::General, vec![], [0, 0, 0]).is_err());
        assert!(Zone::new(
            "two",
            ZoneKind::General,
            vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
            [0, 0, 0]
        )
        .is_err());
    }

    #[test]
    fn default_zones_split_frame_into_thirds() {
        let zones = default_zones(640, 480).unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, vec!["entrance", "product_area", "checkout"]);
        assert!(zones[0].contains(Point::new(10.0, 10.0)));
        assert!(zones[1].contains(Point::new(320.0, 240.0)));
        assert!(zones[2].contains(Point::new(600.0, 450.0)));
        assert!(!zones[2].contains(Point::new(320.0, 240.0)));
    }

    #[test]
    fn overlap_ratio_is_relative_to_self() {
        let face = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let body = BoundingBox::new(5.0, 0.0, 100.0, 100.0);
        assert!((face.overlap_ratio(&body) - 0.5).abs() < 1e-9);
        let degenerate = BoundingBox::new(3.0, 3.0, 3.0, 8.0);
        assert_eq!(degenerate.overlap_ratio(&body), 0.0);
    }
}
