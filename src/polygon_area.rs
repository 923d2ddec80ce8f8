// Planar polygon measurements in slide pixel space: ring area, equivalent
// diameter, self-intersection, and exact clipping against tile rectangles.

use geo::geometry::{Coord, LineString, Polygon, Rect};
use std::f64::consts::PI;

// Vertices of a ring without the closing duplicate and without repeated
// consecutive points.
pub fn open_ring(ring: &LineString<f64>) -> Vec<Coord<f64>> {
    let mut vertices: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for &c in ring.0.iter() {
        if vertices.last() != Some(&c) {
            vertices.push(c);
        }
    }
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    vertices
}

/// Signed area of an open ring. Positive when counter-clockwise in a y-up frame.
pub fn signed_ring_area(vertices: &[Coord<f64>]) -> f64 {
    if vertices.len() < 3 {
        return 0.0;
    }

    let mut area = 0.0;
    for (i, u) in vertices.iter().enumerate() {
        let v = vertices[(i + 1) % vertices.len()];

        // triangle formula.
        // area += u.x * v.y - v.x * u.y;

        // trapezoid formula (this is more numerically stable with large coordinates)
        area += (u.x + v.x) * (v.y - u.y);
    }
    area / 2.0
}

pub fn ring_area(vertices: &[Coord<f64>]) -> f64 {
    signed_ring_area(vertices).abs()
}

/// Area of the exterior minus the area of any holes.
pub fn polygon_area(polygon: &Polygon<f64>) -> f64 {
    let exterior = ring_area(&open_ring(polygon.exterior()));
    let holes: f64 = polygon
        .interiors()
        .iter()
        .map(|ring| ring_area(&open_ring(ring)))
        .sum();
    (exterior - holes).max(0.0)
}

/// Diameter of the circle with the given area.
pub fn equivalent_diameter(area: f64) -> f64 {
    2.0 * (area / PI).sqrt()
}

pub fn bounding_rect(vertices: &[Coord<f64>]) -> Option<Rect<f64>> {
    let first = vertices.first()?;
    let (mut min, mut max) = (*first, *first);
    for c in &vertices[1..] {
        min.x = min.x.min(c.x);
        min.y = min.y.min(c.y);
        max.x = max.x.max(c.x);
        max.y = max.y.max(c.y);
    }
    Some(Rect::new(min, max))
}

// Strict interior overlap; rectangles that only share an edge do not overlap.
pub fn rects_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x < b.max().x && b.min().x < a.max().x && a.min().y < b.max().y && b.min().y < a.max().y
}

fn orient(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

// c is assumed collinear with a-b
fn within_segment(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>) -> bool {
    c.x >= a.x.min(b.x) && c.x <= a.x.max(b.x) && c.y >= a.y.min(b.y) && c.y <= a.y.max(b.y)
}

fn segments_touch(p1: Coord<f64>, p2: Coord<f64>, q1: Coord<f64>, q2: Coord<f64>) -> bool {
    let d1 = orient(q1, q2, p1);
    let d2 = orient(q1, q2, p2);
    let d3 = orient(p1, p2, q1);
    let d4 = orient(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && within_segment(q1, q2, p1))
        || (d2 == 0.0 && within_segment(q1, q2, p2))
        || (d3 == 0.0 && within_segment(p1, p2, q1))
        || (d4 == 0.0 && within_segment(p1, p2, q2))
}

/// True if any two non-adjacent edges of the ring cross or touch.
pub fn ring_self_intersects(vertices: &[Coord<f64>]) -> bool {
    let n = vertices.len();
    if n < 4 {
        return false;
    }

    let edge = |i: usize| (vertices[i], vertices[(i + 1) % n]);
    let edge_bounds = |(a, b): (Coord<f64>, Coord<f64>)| {
        (a.x.min(b.x), a.x.max(b.x), a.y.min(b.y), a.y.max(b.y))
    };

    for i in 0..n {
        let (p1, p2) = edge(i);
        let (pxmin, pxmax, pymin, pymax) = edge_bounds((p1, p2));
        for j in (i + 2)..n {
            if i == 0 && j == n - 1 {
                continue;
            }
            let (q1, q2) = edge(j);
            let (qxmin, qxmax, qymin, qymax) = edge_bounds((q1, q2));
            if qxmin > pxmax || pxmin > qxmax || qymin > pymax || pymin > qymax {
                continue;
            }
            if segments_touch(p1, p2, q1, q2) {
                return true;
            }
        }
    }
    false
}

#[derive(Copy, Clone, Debug)]
enum ClipEdge {
    Left(f64),
    Right(f64),
    Bottom(f64),
    Top(f64),
}

impl ClipEdge {
    fn inside(&self, c: Coord<f64>) -> bool {
        match *self {
            ClipEdge::Left(x) => c.x >= x,
            ClipEdge::Right(x) => c.x <= x,
            ClipEdge::Bottom(y) => c.y >= y,
            ClipEdge::Top(y) => c.y <= y,
        }
    }

    // Only called for segments that cross the edge, so the denominator is nonzero.
    fn intersect(&self, a: Coord<f64>, b: Coord<f64>) -> Coord<f64> {
        match *self {
            ClipEdge::Left(x) | ClipEdge::Right(x) => {
                let t = (x - a.x) / (b.x - a.x);
                Coord { x, y: a.y + t * (b.y - a.y) }
            }
            ClipEdge::Bottom(y) | ClipEdge::Top(y) => {
                let t = (y - a.y) / (b.y - a.y);
                Coord { x: a.x + t * (b.x - a.x), y }
            }
        }
    }

    fn clip(&self, input: &[Coord<f64>], output: &mut Vec<Coord<f64>>) {
        output.clear();
        let Some(&last) = input.last() else {
            return;
        };

        let mut prev = last;
        for &cur in input {
            let prev_inside = self.inside(prev);
            if self.inside(cur) {
                if !prev_inside {
                    output.push(self.intersect(prev, cur));
                }
                output.push(cur);
            } else if prev_inside {
                output.push(self.intersect(prev, cur));
            }
            prev = cur;
        }
    }
}

/// Reusable scratch space for rectangle clipping.
#[derive(Default, Debug)]
pub struct ClipBuffers {
    front: Vec<Coord<f64>>,
    back: Vec<Coord<f64>>,
}

impl ClipBuffers {
    pub fn new() -> Self {
        ClipBuffers::default()
    }

    /// Area of the part of a ring inside `rect` (Sutherland-Hodgman; exact for
    /// any simple ring since the clip window is convex).
    pub fn clipped_ring_area(&mut self, vertices: &[Coord<f64>], rect: &Rect<f64>) -> f64 {
        let edges = [
            ClipEdge::Left(rect.min().x),
            ClipEdge::Right(rect.max().x),
            ClipEdge::Bottom(rect.min().y),
            ClipEdge::Top(rect.max().y),
        ];

        self.front.clear();
        self.front.extend_from_slice(vertices);
        for edge in edges {
            edge.clip(&self.front, &mut self.back);
            std::mem::swap(&mut self.front, &mut self.back);
            if self.front.is_empty() {
                return 0.0;
            }
        }
        ring_area(&self.front)
    }

    pub fn clipped_polygon_area(
        &mut self,
        exterior: &[Coord<f64>],
        holes: &[Vec<Coord<f64>>],
        rect: &Rect<f64>,
    ) -> f64 {
        let mut area = self.clipped_ring_area(exterior, rect);
        if area == 0.0 {
            return 0.0;
        }
        for hole in holes {
            area -= self.clipped_ring_area(hole, rect);
        }
        area.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(points: &[(f64, f64)]) -> Vec<Coord<f64>> {
        points.iter().map(|&(x, y)| Coord { x, y }).collect()
    }

    fn square(x0: f64, y0: f64, side: f64) -> Vec<Coord<f64>> {
        ring(&[(x0, y0), (x0 + side, y0), (x0 + side, y0 + side), (x0, y0 + side)])
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect<f64> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    #[test]
    fn test_ring_area_orientation() {
        let ccw = square(0.0, 0.0, 10.0);
        let mut cw = ccw.clone();
        cw.reverse();
        assert_eq!(signed_ring_area(&ccw), 100.0);
        assert_eq!(signed_ring_area(&cw), -100.0);
        assert_eq!(ring_area(&cw), 100.0);
    }

    #[test]
    fn test_open_ring_strips_closing_and_repeats() {
        let ls = LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]);
        assert_eq!(open_ring(&ls), ring(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn test_polygon_area_with_hole() {
        let polygon = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]),
            vec![LineString::from(vec![(2.0, 2.0), (4.0, 2.0), (4.0, 4.0), (2.0, 4.0)])],
        );
        assert_eq!(polygon_area(&polygon), 96.0);
    }

    #[test]
    fn test_equivalent_diameter() {
        let area = PI * 30.0 * 30.0;
        assert!((equivalent_diameter(area) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_intersection() {
        let bowtie = ring(&[(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)]);
        assert!(ring_self_intersects(&bowtie));
        assert!(!ring_self_intersects(&square(0.0, 0.0, 5.0)));

        // concave but simple
        let ell = ring(&[(0.0, 0.0), (4.0, 0.0), (4.0, 1.0), (1.0, 1.0), (1.0, 4.0), (0.0, 4.0)]);
        assert!(!ring_self_intersects(&ell));

        // vertex touching a non-adjacent edge
        let pinched = ring(&[(0.0, 0.0), (4.0, 0.0), (2.0, 0.0), (2.0, 3.0)]);
        assert!(ring_self_intersects(&pinched));
    }

    #[test]
    fn test_clip_fully_inside_and_outside() {
        let mut buffers = ClipBuffers::new();
        let tile = rect(0.0, 0.0, 100.0, 100.0);
        assert_eq!(buffers.clipped_ring_area(&square(10.0, 10.0, 20.0), &tile), 400.0);
        assert_eq!(buffers.clipped_ring_area(&square(200.0, 0.0, 20.0), &tile), 0.0);
    }

    #[test]
    fn test_clip_containing_polygon() {
        let mut buffers = ClipBuffers::new();
        let tile = rect(0.0, 0.0, 100.0, 100.0);
        assert_eq!(buffers.clipped_ring_area(&square(-50.0, -50.0, 300.0), &tile), 10000.0);
    }

    #[test]
    fn test_clip_partial_and_concave() {
        let mut buffers = ClipBuffers::new();
        let tile = rect(0.0, 0.0, 10.0, 10.0);
        assert_eq!(buffers.clipped_ring_area(&square(5.0, 5.0, 10.0), &tile), 25.0);

        // U shape whose arms both cross the tile edge
        let u = ring(&[
            (2.0, -5.0),
            (8.0, -5.0),
            (8.0, 5.0),
            (6.0, 5.0),
            (6.0, 0.0),
            (4.0, 0.0),
            (4.0, 5.0),
            (2.0, 5.0),
        ]);
        // two arms 2x5 above y=0
        assert!((buffers.clipped_ring_area(&u, &tile) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_clip_polygon_with_hole() {
        let mut buffers = ClipBuffers::new();
        let tile = rect(0.0, 0.0, 10.0, 10.0);
        let exterior = square(-10.0, -10.0, 40.0);
        let holes = vec![square(5.0, 5.0, 10.0)];
        assert_eq!(buffers.clipped_polygon_area(&exterior, &holes, &tile), 75.0);
    }

    #[test]
    fn test_rects_overlap_is_strict() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        assert!(rects_overlap(&a, &rect(5.0, 5.0, 15.0, 15.0)));
        assert!(!rects_overlap(&a, &rect(10.0, 0.0, 20.0, 10.0)));
    }
}
