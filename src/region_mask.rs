// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use imageproc::point::Point as Vertex;
use imageproc::rect::Rect;

/// User-supplied region used to filter detected maxima. Membership follows
/// the usual shape containment conventions: pixel (x, y) is tested as the
/// point (x, y), rectangles are half open, polygons use the even-odd rule.
#[derive(Clone, Debug, PartialEq)]
pub enum RegionMask {
    Rectangle(Rect),
    /// Ellipse inscribed in the given bounds.
    Ellipse(Rect),
    Polygon(Vec<Vertex<f32>>),
    /// A line has no interior. Slices with a line mask are rejected.
    Line { start: Vertex<f32>, end: Vertex<f32> },
    /// Discrete pixel locations; contains exactly those pixels.
    Points(Vec<(u32, u32)>),
}

impl RegionMask {
    pub fn polygon_from_points(points: &[(f32, f32)]) -> RegionMask {
        RegionMask::Polygon(points.iter().map(|(x, y)| Vertex::new(*x, *y)).collect())
    }

    /// True if the mask cannot enclose anything: a line, or a polygon whose
    /// vertices are all collinear.
    pub fn is_line(&self) -> bool {
        match self {
            RegionMask::Line { .. } => true,
            RegionMask::Polygon(vertices) => {
                !vertices.is_empty() && polygon_area(vertices) == 0.0
            },
            RegionMask::Rectangle(_) | RegionMask::Ellipse(_) |
            RegionMask::Points(_) => false,
        }
    }

    /// True if the mask carries no geometry at all. An empty mask does not
    /// filter anything.
    pub fn is_empty(&self) -> bool {
        match self {
            RegionMask::Polygon(vertices) => vertices.is_empty(),
            RegionMask::Points(points) => points.is_empty(),
            _ => false,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (px, py) = (x as f64, y as f64);
        match self {
            RegionMask::Rectangle(rect) => {
                px >= rect.left() as f64 &&
                    px < rect.left() as f64 + rect.width() as f64 &&
                    py >= rect.top() as f64 &&
                    py < rect.top() as f64 + rect.height() as f64
            },
            RegionMask::Ellipse(bounds) => {
                let rx = bounds.width() as f64 / 2.0;
                let ry = bounds.height() as f64 / 2.0;
                let cx = bounds.left() as f64 + rx;
                let cy = bounds.top() as f64 + ry;
                let dx = (px - cx) / rx;
                let dy = (py - cy) / ry;
                dx * dx + dy * dy < 1.0
            },
            RegionMask::Polygon(vertices) => polygon_contains(vertices, px, py),
            RegionMask::Line { .. } => false,
            RegionMask::Points(points) => points.contains(&(x, y)),
        }
    }
}

fn polygon_area(vertices: &[Vertex<f32>]) -> f64 {
    let n = vertices.len();
    let mut twice_area = 0.0_f64;
    for i in 0..n {
        let a = vertices[i];
        let b = vertices[(i + 1) % n];
        twice_area += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    (twice_area / 2.0).abs()
}

// Even-odd crossing test.
fn polygon_contains(vertices: &[Vertex<f32>], px: f64, py: f64) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (vertices[i].x as f64, vertices[i].y as f64);
        let (xj, yj) = (vertices[j].x as f64, vertices[j].y as f64);
        if (yi > py) != (yj > py) {
            let x_cross = xi + (py - yi) * (xj - xi) / (yj - yi);
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}
