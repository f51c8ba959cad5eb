//! Contour geometry over binary masks.
//!
//! Contours are traced through boundary pixel centres (Moore-neighbour
//! tracing, 8-connectivity) and compressed to the vertices where the chain
//! changes direction. Area and perimeter are then polygon measures over those
//! vertices, so a single isolated pixel has zero area and zero perimeter.

use crate::mask::Mask;
use rand::seq::SliceRandom;
use std::collections::VecDeque;

/// Integer pixel coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Clockwise (in image coordinates) starting west
const DIRECTIONS: [(i32, i32); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

/// Axis-aligned pixel bounds, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Intersection over union of two boxes
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix0 = self.min_x.max(other.min_x);
        let iy0 = self.min_y.max(other.min_y);
        let ix1 = self.max_x.min(other.max_x);
        let iy1 = self.max_y.min(other.max_y);
        if ix0 > ix1 || iy0 > iy1 {
            return 0.0;
        }
        let inter = (ix1 - ix0 + 1) as f64 * (iy1 - iy0 + 1) as f64;
        inter / (self.area() as f64 + other.area() as f64 - inter)
    }
}

/// One 8-connected foreground region
#[derive(Debug, Clone)]
pub struct Component {
    pub pixels: Vec<(u32, u32)>,
    pub bbox: BoundingBox,
}

impl Component {
    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    /// Render this component alone onto a mask of the given size
    pub fn to_mask(&self, width: u32, height: u32) -> Mask {
        let mut mask = Mask::new(width, height);
        for &(x, y) in &self.pixels {
            mask.set(x, y, true);
        }
        mask
    }
}

/// Label 8-connected foreground regions in raster order of their first pixel
pub fn connected_components(mask: &Mask) -> Vec<Component> {
    let (width, height) = mask.dimensions();
    let mut visited = vec![false; width as usize * height as usize];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for y in 0..height {
        for x in 0..width {
            let idx = y as usize * width as usize + x as usize;
            if visited[idx] || !mask.data()[idx] {
                continue;
            }

            visited[idx] = true;
            queue.push_back((x, y));
            let mut pixels = Vec::new();
            let mut bbox = BoundingBox {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            };

            while let Some((px, py)) = queue.pop_front() {
                pixels.push((px, py));
                bbox.min_x = bbox.min_x.min(px);
                bbox.min_y = bbox.min_y.min(py);
                bbox.max_x = bbox.max_x.max(px);
                bbox.max_y = bbox.max_y.max(py);

                for (dx, dy) in DIRECTIONS {
                    let nx = px as i64 + dx as i64;
                    let ny = py as i64 + dy as i64;
                    if !mask.get(nx, ny) {
                        continue;
                    }
                    let nidx = ny as usize * width as usize + nx as usize;
                    if !visited[nidx] {
                        visited[nidx] = true;
                        queue.push_back((nx as u32, ny as u32));
                    }
                }
            }

            components.push(Component { pixels, bbox });
        }
    }

    components
}

/// Trace the outer boundary of the component whose raster-first pixel is `start`
fn trace_boundary(mask: &Mask, start: Point) -> Vec<Point> {
    let fg = |p: Point| mask.get(p.x as i64, p.y as i64);
    let limit = 4 * mask.area() + 16;

    let mut contour = vec![start];
    let mut current = start;
    // The west neighbour of a raster-first pixel is always background
    let mut backtrack = 0usize;
    let mut first_move: Option<usize> = None;

    for _ in 0..limit {
        let next = (1..=8).map(|k| (backtrack + k) % 8).find(|&d| {
            let (dx, dy) = DIRECTIONS[d];
            fg(Point::new(current.x + dx, current.y + dy))
        });
        let Some(dir) = next else {
            // Isolated pixel
            break;
        };

        if current == start {
            match first_move {
                None => first_move = Some(dir),
                Some(first) if first == dir => break,
                Some(_) => {}
            }
        }

        let (dx, dy) = DIRECTIONS[dir];
        current = Point::new(current.x + dx, current.y + dy);
        backtrack = if dir % 2 == 0 { (dir + 6) % 8 } else { (dir + 5) % 8 };
        contour.push(current);
    }

    if contour.len() > 1 && contour.last() == Some(&start) {
        contour.pop();
    }
    contour
}

/// Drop vertices lying on a straight run of the chain
pub fn compress_chain(points: &[Point]) -> Vec<Point> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }

    let step = |a: Point, b: Point| (b.x - a.x, b.y - a.y);
    let kept: Vec<Point> = (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let cur = points[i];
            let next = points[(i + 1) % n];
            step(prev, cur) != step(cur, next)
        })
        .map(|i| points[i])
        .collect();

    if kept.is_empty() {
        points[..1].to_vec()
    } else {
        kept
    }
}

/// External contours of every 8-connected region, compressed
pub fn external_contours(mask: &Mask) -> Vec<Vec<Point>> {
    connected_components(mask)
        .iter()
        .map(|component| {
            let (x, y) = component.pixels[0];
            compress_chain(&trace_boundary(mask, Point::new(x as i32, y as i32)))
        })
        .collect()
}

/// Absolute polygon area (shoelace)
pub fn contour_area(points: &[Point]) -> f64 {
    signed_area(points).abs()
}

fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    twice as f64 / 2.0
}

/// Closed polygon perimeter
pub fn arc_length(points: &[Point]) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            ((b.x - a.x) as f64).hypot((b.y - a.y) as f64)
        })
        .sum()
}

/// `4π·area / perimeter²`; zero when the perimeter is zero
pub fn circularity(area: f64, perimeter: f64) -> f64 {
    if perimeter > 0.0 {
        4.0 * std::f64::consts::PI * area / (perimeter * perimeter)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center: (f64, f64),
    pub radius: f64,
}

impl Circle {
    fn contains(&self, p: (f64, f64)) -> bool {
        let d = (p.0 - self.center.0).hypot(p.1 - self.center.1);
        d <= self.radius + 1e-7 * self.radius.max(1.0)
    }

    fn from_two(a: (f64, f64), b: (f64, f64)) -> Circle {
        let center = ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0);
        Circle {
            center,
            radius: (a.0 - center.0).hypot(a.1 - center.1),
        }
    }

    fn from_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Option<Circle> {
        let (bx, by) = (b.0 - a.0, b.1 - a.1);
        let (cx, cy) = (c.0 - a.0, c.1 - a.1);
        let d = 2.0 * (bx * cy - by * cx);
        if d.abs() < 1e-12 {
            return None;
        }
        let b2 = bx * bx + by * by;
        let c2 = cx * cx + cy * cy;
        let ux = (cy * b2 - by * c2) / d;
        let uy = (bx * c2 - cx * b2) / d;
        Some(Circle {
            center: (a.0 + ux, a.1 + uy),
            radius: ux.hypot(uy),
        })
    }
}

/// Smallest circle enclosing every point (randomised incremental, Welzl)
pub fn min_enclosing_circle(points: &[Point]) -> Option<Circle> {
    let mut pts: Vec<(f64, f64)> = points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    pts.shuffle(&mut rand::thread_rng());

    let first = *pts.first()?;
    let mut circle = Circle {
        center: first,
        radius: 0.0,
    };

    for i in 1..pts.len() {
        if circle.contains(pts[i]) {
            continue;
        }
        circle = Circle {
            center: pts[i],
            radius: 0.0,
        };
        for j in 0..i {
            if circle.contains(pts[j]) {
                continue;
            }
            circle = Circle::from_two(pts[i], pts[j]);
            for k in 0..j {
                if circle.contains(pts[k]) {
                    continue;
                }
                circle = Circle::from_three(pts[i], pts[j], pts[k]).unwrap_or_else(|| {
                    // Collinear: the farthest pair spans the other point
                    [
                        Circle::from_two(pts[i], pts[j]),
                        Circle::from_two(pts[i], pts[k]),
                        Circle::from_two(pts[j], pts[k]),
                    ]
                    .into_iter()
                    .fold(Circle::from_two(pts[i], pts[j]), |best, c| {
                        if c.radius > best.radius {
                            c
                        } else {
                            best
                        }
                    })
                });
            }
        }
    }

    Some(circle)
}

/// Ellipse with full axis lengths
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: (f64, f64),
    pub major_axis: f64,
    pub minor_axis: f64,
    /// Orientation of the major axis, degrees
    pub angle: f64,
}

pub const MIN_ELLIPSE_POINTS: usize = 5;

/// Fit an ellipse with the same second moments as the contour polygon.
///
/// Returns `None` for fewer than [`MIN_ELLIPSE_POINTS`] vertices or a
/// polygon with no area.
pub fn fit_ellipse(points: &[Point]) -> Option<Ellipse> {
    if points.len() < MIN_ELLIPSE_POINTS {
        return None;
    }

    // Green's theorem moment integrals, relative to the first vertex
    let origin = points[0];
    let n = points.len();
    let (mut a, mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        let (x0, y0) = ((p.x - origin.x) as f64, (p.y - origin.y) as f64);
        let (x1, y1) = ((q.x - origin.x) as f64, (q.y - origin.y) as f64);
        let cross = x0 * y1 - x1 * y0;
        a += cross;
        sx += (x0 + x1) * cross;
        sy += (y0 + y1) * cross;
        sxx += (x0 * x0 + x0 * x1 + x1 * x1) * cross;
        syy += (y0 * y0 + y0 * y1 + y1 * y1) * cross;
        sxy += (x0 * y1 + 2.0 * x0 * y0 + 2.0 * x1 * y1 + x1 * y0) * cross;
    }
    let area = a / 2.0;
    if area.abs() < 1e-9 {
        return None;
    }

    let cx = sx / (6.0 * area);
    let cy = sy / (6.0 * area);
    let mu20 = sxx / (12.0 * area) - cx * cx;
    let mu02 = syy / (12.0 * area) - cy * cy;
    let mu11 = sxy / (24.0 * area) - cx * cy;

    let mean = (mu20 + mu02) / 2.0;
    let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
    let major_var = mean + spread;
    let minor_var = (mean - spread).max(0.0);
    if !major_var.is_finite() || major_var <= 0.0 {
        return None;
    }

    Some(Ellipse {
        center: (cx + origin.x as f64, cy + origin.y as f64),
        major_axis: 4.0 * major_var.sqrt(),
        minor_axis: 4.0 * minor_var.sqrt(),
        angle: 0.5 * (2.0 * mu11).atan2(mu20 - mu02).to_degrees(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(size: u32, cx: f64, cy: f64, r: f64) -> Mask {
        Mask::from_fn(size, size, |x, y| {
            (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2) <= r * r
        })
    }

    #[test]
    fn test_components_use_eight_connectivity() {
        // Diagonal neighbours join, a gap splits
        let mask = Mask::from_fn(6, 3, |x, y| (x == 0 && y == 0) || (x == 1 && y == 1) || x == 5);
        let components = connected_components(&mask);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].area(), 2);
        assert_eq!(components[1].area(), 3);
        assert_eq!(components[1].bbox.min_x, 5);
    }

    #[test]
    fn test_rectangle_contour() {
        let mask = Mask::from_fn(10, 10, |x, y| (2..=6).contains(&x) && (3..=5).contains(&y));
        let contours = external_contours(&mask);
        assert_eq!(contours.len(), 1);

        let contour = &contours[0];
        assert_eq!(contour.len(), 4);
        assert_eq!(contour[0], Point::new(2, 3));
        // Pixel centres span 4 x 2
        assert_eq!(contour_area(contour), 8.0);
        assert_eq!(arc_length(contour), 12.0);
    }

    #[test]
    fn test_single_pixel_is_degenerate() {
        let mask = Mask::from_fn(3, 3, |x, y| x == 1 && y == 1);
        let contours = external_contours(&mask);
        assert_eq!(contours, vec![vec![Point::new(1, 1)]]);
        assert_eq!(contour_area(&contours[0]), 0.0);
        assert_eq!(arc_length(&contours[0]), 0.0);
    }

    #[test]
    fn test_hole_does_not_change_external_contour() {
        let ring = Mask::from_fn(9, 9, |x, y| {
            (1..=7).contains(&x) && (1..=7).contains(&y) && !((3..=5).contains(&x) && (3..=5).contains(&y))
        });
        let contours = external_contours(&ring);
        assert_eq!(contours.len(), 1);
        assert_eq!(contour_area(&contours[0]), 36.0);
    }

    #[test]
    fn test_disk_is_nearly_circular() {
        let mask = disk(64, 32.0, 32.0, 20.0);
        let contours = external_contours(&mask);
        assert_eq!(contours.len(), 1);

        let area = contour_area(&contours[0]);
        let perimeter = arc_length(&contours[0]);
        let c = circularity(area, perimeter);
        assert!(c > 0.85 && c <= 1.0, "circularity {c}");
    }

    #[test]
    fn test_min_enclosing_circle() {
        let points = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(5, 3),
            Point::new(5, -2),
        ];
        let circle = min_enclosing_circle(&points).unwrap();
        assert!((circle.center.0 - 5.0).abs() < 1e-9);
        assert!((circle.center.1).abs() < 1e-9);
        assert!((circle.radius - 5.0).abs() < 1e-9);

        assert!(min_enclosing_circle(&[]).is_none());
    }

    #[test]
    fn test_min_enclosing_circle_of_disk_contour() {
        let mask = disk(64, 30.0, 34.0, 12.0);
        let contour = &external_contours(&mask)[0];
        let circle = min_enclosing_circle(contour).unwrap();
        assert!((circle.radius - 12.0).abs() < 0.5, "radius {}", circle.radius);
        assert!((circle.center.0 - 30.0).abs() < 0.5);
        assert!((circle.center.1 - 34.0).abs() < 0.5);
    }

    #[test]
    fn test_fit_ellipse_axes() {
        let mask = Mask::from_fn(80, 60, |x, y| {
            let dx = (x as f64 - 40.0) / 30.0;
            let dy = (y as f64 - 30.0) / 15.0;
            dx * dx + dy * dy <= 1.0
        });
        let contour = &external_contours(&mask)[0];
        let ellipse = fit_ellipse(contour).unwrap();
        assert!((ellipse.major_axis - 60.0).abs() < 2.0, "major {}", ellipse.major_axis);
        assert!((ellipse.minor_axis - 30.0).abs() < 2.0, "minor {}", ellipse.minor_axis);
        assert!(ellipse.angle.abs() < 1.0);
    }

    #[test]
    fn test_fit_ellipse_needs_five_points() {
        let square = vec![
            Point::new(0, 0),
            Point::new(4, 0),
            Point::new(4, 4),
            Point::new(0, 4),
        ];
        assert!(fit_ellipse(&square).is_none());
    }

    #[test]
    fn test_bbox_iou() {
        let a = BoundingBox {
            min_x: 0,
            min_y: 0,
            max_x: 9,
            max_y: 9,
        };
        let b = BoundingBox {
            min_x: 5,
            min_y: 0,
            max_x: 14,
            max_y: 9,
        };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-12);
        assert_eq!(a.iou(&a), 1.0);
    }
}
