//! Axis-aligned rectangle geometry used for zone invasion tests.

use serde::{Deserialize, Serialize};

/// Pixel coordinate, top-left origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Rectangle given by its start (top-left) and end (bottom-right) corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub start: Point,
    pub end: Point,
}

impl Rect {
    pub const fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    pub fn width(&self) -> i64 {
        self.end.x - self.start.x
    }

    pub fn height(&self) -> i64 {
        self.end.y - self.start.y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        rectangles_intersect(self.start, self.end, other.start, other.end)
    }
}

/// Inclusive intersection test: rectangles that only share an edge or a
/// corner intersect.
pub fn rectangles_intersect(a_start: Point, a_end: Point, b_start: Point, b_end: Point) -> bool {
    if b_start.x > a_end.x || b_end.x < a_start.x {
        return false;
    }
    if b_start.y > a_end.y || b_end.y < a_start.y {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x1: i64, y1: i64, x2: i64, y2: i64) -> Rect {
        Rect::new(Point::new(x1, y1), Point::new(x2, y2))
    }

    #[test]
    fn touching_edge_counts_as_intersection() {
        let zone = rect(880, 360, 1280, 720);
        // rect end.x == zone start.x
        assert!(rect(800, 400, 880, 500).intersects(&zone));
        // rect start.y == zone end.y
        assert!(rect(900, 720, 950, 760).intersects(&zone));
        // corner contact only
        assert!(rect(800, 300, 880, 360).intersects(&zone));
    }

    #[test]
    fn separated_rectangles_do_not_intersect() {
        let zone = rect(880, 360, 1280, 720);
        assert!(!rect(0, 0, 879, 700).intersects(&zone));
        assert!(!rect(900, 0, 1000, 359).intersects(&zone));
        assert!(!rect(900, 721, 1000, 800).intersects(&zone));
    }

    #[test]
    fn containment_and_overlap_intersect() {
        let zone = rect(100, 100, 200, 200);
        assert!(rect(120, 120, 130, 130).intersects(&zone));
        assert!(rect(0, 0, 1000, 1000).intersects(&zone));
        assert!(rect(150, 50, 400, 150).intersects(&zone));
    }

    #[test]
    fn intersection_is_symmetric() {
        let a = rect(10, 10, 50, 50);
        let b = rect(50, 20, 90, 30);
        assert_eq!(
            rectangles_intersect(a.start, a.end, b.start, b.end),
            rectangles_intersect(b.start, b.end, a.start, a.end)
        );
    }
}
