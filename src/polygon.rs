//! 2D polygons as deduplicated directed edge sets with boolean algebra.
//!
//! A polygon is a set of vertices and directed edges (counter-clockwise
//! loops, interior on the left), both stored in contiguous arenas with
//! exact-value lookup maps for O(1) dedup. A BSP tree over the edges is
//! computed lazily and cached; any mutation invalidates it.
//!
//! The boolean operators consume their operands. Intersection runs both
//! boundaries through a `BspLineSegSplitter`; union, difference, and
//! symmetric difference derive from intersection and complement via the
//! De Morgan identities.
//!
//! Representation limit: the empty polygon has no boundary, so its
//! complement (the whole plane) is representationally identical to it.

use std::collections::HashMap;
use std::ops::{BitAnd, BitOr, BitXor, Not, Sub};

use glam::Vec2;

use crate::bsp::{BspLineSegSplitter, BspTree2d};
use crate::line_seg::LineSeg;

/// Exact-bit-pattern key for vertex dedup. Values must match exactly;
/// tolerance handling belongs to the splitter, not the arena.
#[inline]
fn vertex_key(vertex: Vec2) -> (u32, u32) {
    (vertex.x.to_bits(), vertex.y.to_bits())
}

#[derive(Debug, Clone, Default)]
pub struct Polygon2d {
    vertices: Vec<Vec2>,
    vertex_lookup: HashMap<(u32, u32), usize>,
    edges: Vec<(usize, usize)>,
    edge_lookup: HashMap<(usize, usize), usize>,
    bsp: Option<BspTree2d>,
}

impl Polygon2d {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = LineSeg>,
    {
        let mut polygon = Self::new();
        for edge in edges {
            polygon.add_edge(edge);
        }
        polygon
    }

    /// Add a directed edge, interning both endpoints. Duplicate edges and
    /// degenerate segments are rejected. Invalidates the cached BSP tree.
    pub fn add_edge(&mut self, seg: LineSeg) -> bool {
        if seg.is_degenerate() {
            return false;
        }
        let start = self.intern_vertex(seg.start);
        let end = self.intern_vertex(seg.end);
        if self.edge_lookup.contains_key(&(start, end)) {
            return false;
        }
        self.edge_lookup.insert((start, end), self.edges.len());
        self.edges.push((start, end));
        self.bsp = None;
        true
    }

    fn intern_vertex(&mut self, vertex: Vec2) -> usize {
        let vertices = &mut self.vertices;
        *self
            .vertex_lookup
            .entry(vertex_key(vertex))
            .or_insert_with(|| {
                vertices.push(vertex);
                vertices.len() - 1
            })
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Iterate the boundary edges as segments.
    pub fn edges(&self) -> impl Iterator<Item = LineSeg> + '_ {
        self.edges
            .iter()
            .map(|&(start, end)| LineSeg::new(self.vertices[start], self.vertices[end]))
    }

    /// The cached BSP tree, built on first use after a mutation.
    pub fn bsp_tree(&mut self) -> &BspTree2d {
        let segments: Vec<LineSeg> = if self.bsp.is_none() {
            self.edges().collect()
        } else {
            Vec::new()
        };
        self.bsp.get_or_insert_with(|| BspTree2d::build(&segments))
    }

    /// Whether `point` lies in the interior (boundary counts as inside).
    pub fn contains_point(&mut self, point: Vec2) -> bool {
        self.bsp_tree().contains_point(point)
    }

    /// Complement: every edge reversed. An already-cached BSP tree is
    /// inverted structurally instead of recomputed.
    pub fn complement(mut self) -> Self {
        for edge in &mut self.edges {
            *edge = (edge.1, edge.0);
        }
        self.edge_lookup = self
            .edges
            .iter()
            .enumerate()
            .map(|(index, &edge)| (edge, index))
            .collect();
        if let Some(bsp) = self.bsp.as_mut() {
            bsp.invert();
        }
        self
    }

    /// Intersection: clip each operand's boundary through the other's
    /// tree; the pieces inside both form the result boundary.
    pub fn intersection(mut self, mut other: Polygon2d) -> Polygon2d {
        self.bsp_tree();
        other.bsp_tree();

        let mut splitter = BspLineSegSplitter::new();
        if let Some(tree) = self.bsp.as_ref() {
            for edge in other.edges() {
                splitter.split(tree, edge);
            }
        }
        if let Some(tree) = other.bsp.as_ref() {
            for edge in self.edges() {
                splitter.split(tree, edge);
            }
        }
        Polygon2d::from_edges(splitter.take_inside())
    }
}

impl Not for Polygon2d {
    type Output = Polygon2d;

    fn not(self) -> Polygon2d {
        self.complement()
    }
}

impl BitAnd for Polygon2d {
    type Output = Polygon2d;

    fn bitand(self, rhs: Polygon2d) -> Polygon2d {
        self.intersection(rhs)
    }
}

impl BitOr for Polygon2d {
    type Output = Polygon2d;

    /// Union via De Morgan: `A | B = !(!A & !B)`.
    fn bitor(self, rhs: Polygon2d) -> Polygon2d {
        !(!self & !rhs)
    }
}

impl Sub for Polygon2d {
    type Output = Polygon2d;

    /// Difference: `A - B = A & !B`.
    fn sub(self, rhs: Polygon2d) -> Polygon2d {
        self & !rhs
    }
}

impl BitXor for Polygon2d {
    type Output = Polygon2d;

    /// Symmetric difference: `A ^ B = (A - B) | (B - A)`.
    fn bitxor(self, rhs: Polygon2d) -> Polygon2d {
        (self.clone() - rhs.clone()) | (rhs - self)
    }
}
