// Outlines of unions of axis-aligned rectangles, used to turn groups of
// predicted tiles back into polygons.

use geo::geometry::{Coord, LineString, MultiPolygon, Polygon, Rect};
use std::collections::HashSet;

// Lattice corner (i, j) on the compressed grid of rectangle edge coordinates.
type Point = (i32, i32);

// Directed boundary edge with the covered region on its left.
type Edge = (Point, Point);

// Traces the outline of a union of axis-aligned rectangles.
//
// Rectangle edges are snapped to a compressed lattice so that shared edges
// match exactly, every lattice cell is marked covered or not, and the
// boundary between covered and uncovered cells is walked as a set of
// directed unit edges. At a corner where two covered cells touch only
// diagonally the walk turns left, which keeps rings simple: the two cells
// end up in separate rings rather than one self-touching ring.
pub struct PolygonBuilder {
    edges: Vec<Edge>,
    visited: Vec<bool>,
}

fn direction(edge: &Edge) -> Point {
    (edge.1 .0 - edge.0 .0, edge.1 .1 - edge.0 .1)
}

fn mark_visited(edges: &[Edge], visited: &mut [bool], edge: &Edge) {
    if let Ok(pos) = edges.binary_search(edge) {
        visited[pos] = true;
    }
}

// Twice the signed area, positive for counter-clockwise rings.
fn signed_area2(ring: &[Point]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|k| {
            let (a, b) = (ring[k], ring[(k + 1) % n]);
            a.0 as i64 * b.1 as i64 - b.0 as i64 * a.1 as i64
        })
        .sum()
}

// Even-odd test of a point given in doubled lattice coordinates. Points are
// always cell centres, so they never lie on a ring.
fn ring_contains(ring: &[Point], p: (i64, i64)) -> bool {
    let n = ring.len();
    let mut inside = false;
    for k in 0..n {
        let (ax, ay) = (2 * ring[k].0 as i64, 2 * ring[k].1 as i64);
        let (bx, by) = (2 * ring[(k + 1) % n].0 as i64, 2 * ring[(k + 1) % n].1 as i64);
        if (ay > p.1) != (by > p.1) {
            let x_cross = ax as f64 + (p.1 - ay) as f64 * (bx - ax) as f64 / (by - ay) as f64;
            if (p.0 as f64) < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

// Drop vertices where the ring continues straight on.
fn remove_collinear(ring: &[Point]) -> Vec<Point> {
    let n = ring.len();
    (0..n)
        .filter(|&k| {
            let prev = ring[(k + n - 1) % n];
            let next = ring[(k + 1) % n];
            let u = ((ring[k].0 - prev.0).signum(), (ring[k].1 - prev.1).signum());
            let v = ((next.0 - ring[k].0).signum(), (next.1 - ring[k].1).signum());
            u != v
        })
        .map(|k| ring[k])
        .collect()
}

fn lattice(axis: &[f64], v: f64) -> i32 {
    axis.partition_point(|&a| a < v) as i32
}

fn sorted_axis(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut axis: Vec<f64> = values.collect();
    axis.sort_by(f64::total_cmp);
    axis.dedup();
    axis
}

impl PolygonBuilder {
    pub fn new() -> Self {
        PolygonBuilder {
            edges: Vec::new(),
            visited: Vec::new(),
        }
    }

    // Successor of `edge` along its ring.
    fn next_edge(&self, edge: &Edge) -> Option<Edge> {
        let u = edge.1;
        let first = self.edges.partition_point(|e| e.0 < u);
        let last = self.edges.partition_point(|e| e.0 <= u);
        let outgoing = &self.edges[first..last];

        match outgoing.len() {
            0 => None,
            1 => Some(outgoing[0]),
            _ => {
                let d = direction(edge);
                let left = (-d.1, d.0);
                outgoing
                    .iter()
                    .find(|e| direction(e) == left)
                    .or_else(|| outgoing.first())
                    .copied()
            }
        }
    }

    pub fn rects_to_multipolygon(&mut self, rects: &[Rect<f64>]) -> MultiPolygon<f64> {
        let xs = sorted_axis(rects.iter().flat_map(|r| [r.min().x, r.max().x]));
        let ys = sorted_axis(rects.iter().flat_map(|r| [r.min().y, r.max().y]));

        let mut covered: HashSet<Point> = HashSet::new();
        for r in rects {
            for i in lattice(&xs, r.min().x)..lattice(&xs, r.max().x) {
                for j in lattice(&ys, r.min().y)..lattice(&ys, r.max().y) {
                    covered.insert((i, j));
                }
            }
        }

        self.edges.clear();
        for &(i, j) in &covered {
            if !covered.contains(&(i, j - 1)) {
                self.edges.push(((i, j), (i + 1, j)));
            }
            if !covered.contains(&(i + 1, j)) {
                self.edges.push(((i + 1, j), (i + 1, j + 1)));
            }
            if !covered.contains(&(i, j + 1)) {
                self.edges.push(((i + 1, j + 1), (i, j + 1)));
            }
            if !covered.contains(&(i - 1, j)) {
                self.edges.push(((i, j + 1), (i, j)));
            }
        }
        self.edges.sort_unstable();

        self.visited.clear();
        self.visited.resize(self.edges.len(), false);

        // (ring, doubled centre of an uncovered cell on its right)
        let mut rings: Vec<(Vec<Point>, (i64, i64))> = Vec::new();
        while let Some(start) = self.visited.iter().position(|v| !v) {
            let first = self.edges[start];
            self.visited[start] = true;

            let mut ring = vec![first.0];
            let mut edge = first;
            while let Some(next) = self.next_edge(&edge) {
                if next == first {
                    break;
                }
                ring.push(next.0);
                mark_visited(&self.edges, &mut self.visited, &next);
                edge = next;
            }

            let d = direction(&first);
            let outside = (
                (first.0 .0 + first.1 .0 + d.1) as i64,
                (first.0 .1 + first.1 .1 - d.0) as i64,
            );
            rings.push((remove_collinear(&ring), outside));
        }

        let to_coords = |ring: &[Point]| -> LineString<f64> {
            ring.iter()
                .map(|&(i, j)| Coord {
                    x: xs[i as usize],
                    y: ys[j as usize],
                })
                .collect()
        };

        let exteriors: Vec<(&Vec<Point>, i64)> = rings
            .iter()
            .map(|(ring, _)| (ring, signed_area2(ring)))
            .filter(|(_, area)| *area > 0)
            .collect();
        let mut holes: Vec<Vec<LineString<f64>>> = vec![Vec::new(); exteriors.len()];
        for (ring, outside) in rings.iter().filter(|(ring, _)| signed_area2(ring) < 0) {
            let parent = exteriors
                .iter()
                .enumerate()
                .filter(|(_, (exterior, _))| ring_contains(exterior.as_slice(), *outside))
                .min_by_key(|(_, (_, area))| *area)
                .map(|(k, _)| k);
            if let Some(k) = parent {
                holes[k].push(to_coords(ring.as_slice()));
            }
        }

        MultiPolygon::new(
            exteriors
                .iter()
                .zip(holes)
                .map(|((exterior, _), interiors)| Polygon::new(to_coords(exterior.as_slice()), interiors))
                .collect(),
        )
    }
}
