//! Rasterisation of brush disks, strokes, lines, polygons and splines.
//!
//! Geometry is expressed with floating-point [`Point`]s in `(x, y)` image
//! coordinates; rasterised pixels are returned as `(y, x)` index pairs,
//! matching ndarray's row-major indexing. Everything is clipped to the
//! `height × width` image.

use ndarray::Array2;

/// A point in image coordinates (pixel centres sit on integers).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

/// A rasterised pixel as `(y, x)`.
pub type Pixel = (usize, usize);

fn clip_range(lo: f64, hi: f64, size: usize) -> Option<(usize, usize)> {
    if size == 0 || hi < 0.0 || lo > (size - 1) as f64 {
        return None;
    }
    let lo = lo.max(0.0).floor() as usize;
    let hi = (hi.min((size - 1) as f64)).ceil() as usize;
    Some((lo, hi.min(size - 1)))
}

/// Pixels whose centre lies within `radius` of `center`.
pub fn disk(center: Point, radius: f64, height: usize, width: usize) -> Vec<Pixel> {
    let Some((y0, y1)) = clip_range(center.y - radius, center.y + radius, height) else {
        return Vec::new();
    };
    let Some((x0, x1)) = clip_range(center.x - radius, center.x + radius, width) else {
        return Vec::new();
    };
    let r2 = radius * radius + 1e-9;
    let mut pixels = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dy = y as f64 - center.y;
            let dx = x as f64 - center.x;
            if dy * dy + dx * dx <= r2 {
                pixels.push((y, x));
            }
        }
    }
    pixels
}

/// Even-odd point-in-polygon test.
pub fn point_in_polygon(p: Point, vertices: &[Point]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = vertices[i];
        let vj = vertices[j];
        if (vi.y > p.y) != (vj.y > p.y) && p.x < (vj.x - vi.x) * (p.y - vi.y) / (vj.y - vi.y) + vi.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > 1e-9 {
        return false;
    }
    p.x >= a.x.min(b.x) - 1e-9
        && p.x <= a.x.max(b.x) + 1e-9
        && p.y >= a.y.min(b.y) - 1e-9
        && p.y <= a.y.max(b.y) + 1e-9
}

fn on_boundary(p: Point, vertices: &[Point]) -> bool {
    let n = vertices.len();
    (0..n).any(|i| on_segment(p, vertices[i], vertices[(i + 1) % n]))
}

/// Pixels whose centre lies inside the closed polygon or on its boundary.
pub fn fill_polygon(vertices: &[Point], height: usize, width: usize) -> Vec<Pixel> {
    if vertices.len() < 3 {
        return Vec::new();
    }
    let min_x = vertices.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = vertices.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = vertices.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = vertices.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    let Some((y0, y1)) = clip_range(min_y, max_y, height) else {
        return Vec::new();
    };
    let Some((x0, x1)) = clip_range(min_x, max_x, width) else {
        return Vec::new();
    };
    let mut pixels = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let p = Point::new(x as f64, y as f64);
            if point_in_polygon(p, vertices) || on_boundary(p, vertices) {
                pixels.push((y, x));
            }
        }
    }
    pixels
}

/// Bresenham line between two points, unclipped, as `(y, x)`.
pub fn line_pixels(a: Point, b: Point) -> Vec<(i64, i64)> {
    let (mut x0, mut y0) = (a.x.round() as i64, a.y.round() as i64);
    let (x1, y1) = (b.x.round() as i64, b.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let mut out = Vec::with_capacity((dx - dy + 1) as usize);
    loop {
        out.push((y0, x0));
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
    out
}

fn clip_pixels(raw: impl IntoIterator<Item = (i64, i64)>, height: usize, width: usize) -> Vec<Pixel> {
    raw.into_iter()
        .filter(|&(y, x)| y >= 0 && x >= 0 && (y as usize) < height && (x as usize) < width)
        .map(|(y, x)| (y as usize, x as usize))
        .collect()
}

/// The convex envelope joining two equal-radius disks.
///
/// This is the quadrilateral bounded by the two outer tangent lines, so a
/// fast brush drag leaves no gaps between successive disk stamps.
pub fn stroke_envelope(a: Point, b: Point, radius: f64, height: usize, width: usize) -> Vec<Pixel> {
    let len = a.distance_to(&b);
    if len < f64::EPSILON {
        return Vec::new();
    }
    let nx = -(b.y - a.y) / len * radius;
    let ny = (b.x - a.x) / len * radius;
    let quad = [
        a.translated(nx, ny),
        b.translated(nx, ny),
        b.translated(-nx, -ny),
        a.translated(-nx, -ny),
    ];
    let mut pixels = fill_polygon(&quad, height, width);
    pixels.extend(clip_pixels(line_pixels(a, b), height, width));
    dedup(pixels)
}

/// A line of the given width (rotated rectangle around the segment).
pub fn thick_line(a: Point, b: Point, line_width: f64, height: usize, width: usize) -> Vec<Pixel> {
    let mut pixels = clip_pixels(line_pixels(a, b), height, width);
    if line_width > 1.0 {
        pixels.extend(stroke_envelope(a, b, line_width / 2.0, height, width));
    }
    dedup(pixels)
}

/// Open polyline of the given width.
pub fn polyline(points: &[Point], line_width: f64, height: usize, width: usize) -> Vec<Pixel> {
    let mut pixels = Vec::new();
    if points.len() == 1 {
        pixels.extend(disk(points[0], (line_width / 2.0).max(0.0), height, width));
    }
    for pair in points.windows(2) {
        pixels.extend(thick_line(pair[0], pair[1], line_width, height, width));
    }
    dedup(pixels)
}

/// Axis-aligned rectangle between two corners, inclusive.
pub fn rectangle(a: Point, b: Point, height: usize, width: usize) -> Vec<Pixel> {
    let Some((y0, y1)) = clip_range(a.y.min(b.y), a.y.max(b.y), height) else {
        return Vec::new();
    };
    let Some((x0, x1)) = clip_range(a.x.min(b.x), a.x.max(b.x), width) else {
        return Vec::new();
    };
    let mut pixels = Vec::with_capacity((y1 - y0 + 1) * (x1 - x0 + 1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            pixels.push((y, x));
        }
    }
    pixels
}

/// Sample a closed Catmull-Rom spline through the control points.
pub fn catmull_rom_closed(points: &[Point], samples_per_segment: usize) -> Vec<Point> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    let samples = samples_per_segment.max(1);
    let mut out = Vec::with_capacity(n * samples);
    for i in 0..n {
        let p0 = points[(i + n - 1) % n];
        let p1 = points[i];
        let p2 = points[(i + 1) % n];
        let p3 = points[(i + 2) % n];
        for s in 0..samples {
            let t = s as f64 / samples as f64;
            let t2 = t * t;
            let t3 = t2 * t;
            let blend = |a: f64, b: f64, c: f64, d: f64| {
                0.5 * (2.0 * b + (-a + c) * t + (2.0 * a - 5.0 * b + 4.0 * c - d) * t2
                    + (-a + 3.0 * b - 3.0 * c + d) * t3)
            };
            out.push(Point::new(
                blend(p0.x, p1.x, p2.x, p3.x),
                blend(p0.y, p1.y, p2.y, p3.y),
            ));
        }
    }
    out
}

/// Boolean mask of the given pixels.
pub fn mask_from_pixels(pixels: &[Pixel], height: usize, width: usize) -> Array2<bool> {
    let mut mask = Array2::from_elem((height, width), false);
    for &(y, x) in pixels {
        if y < height && x < width {
            mask[[y, x]] = true;
        }
    }
    mask
}

fn dedup(mut pixels: Vec<Pixel>) -> Vec<Pixel> {
    pixels.sort_unstable();
    pixels.dedup();
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_radius_one_is_plus() {
        let pixels = disk(Point::new(2.0, 2.0), 1.0, 5, 5);
        assert_eq!(pixels.len(), 5);
        assert!(pixels.contains(&(1, 2)));
        assert!(pixels.contains(&(2, 1)));
        assert!(!pixels.contains(&(1, 1)));
    }

    #[test]
    fn test_disk_clipped_at_border() {
        let pixels = disk(Point::new(0.0, 0.0), 1.0, 5, 5);
        assert_eq!(pixels.len(), 3);
        assert!(pixels.iter().all(|&(y, x)| y < 5 && x < 5));
        assert!(disk(Point::new(-10.0, -10.0), 2.0, 5, 5).is_empty());
    }

    #[test]
    fn test_stroke_envelope_covers_gap() {
        let a = Point::new(1.0, 5.0);
        let b = Point::new(9.0, 5.0);
        let pixels = stroke_envelope(a, b, 1.0, 11, 11);
        for x in 1..=9 {
            assert!(pixels.contains(&(5, x)));
        }
        assert!(pixels.contains(&(4, 5)) && pixels.contains(&(6, 5)));
    }

    #[test]
    fn test_line_pixels_endpoints() {
        let line = line_pixels(Point::new(0.0, 0.0), Point::new(3.0, 1.0));
        assert_eq!(line.first(), Some(&(0, 0)));
        assert_eq!(line.last(), Some(&(1, 3)));
        assert_eq!(line.len(), 4);
    }

    #[test]
    fn test_fill_polygon_square() {
        let square = [
            Point::new(0.5, 0.5),
            Point::new(3.5, 0.5),
            Point::new(3.5, 3.5),
            Point::new(0.5, 3.5),
        ];
        let pixels = fill_polygon(&square, 10, 10);
        assert_eq!(pixels.len(), 9);
    }

    #[test]
    fn test_rectangle_clipped() {
        let pixels = rectangle(Point::new(3.0, 3.0), Point::new(8.0, -2.0), 5, 5);
        assert_eq!(pixels.len(), 4 * 2);
    }

    #[test]
    fn test_spline_passes_through_controls() {
        let pts = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        let sampled = catmull_rom_closed(&pts, 8);
        assert_eq!(sampled.len(), 32);
        assert!(sampled[8].distance_to(&pts[1]) < 1e-9);
    }
}
