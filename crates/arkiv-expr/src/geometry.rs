//! Geometry literal values.
//!
//! This is intentionally *not* a geometry library: it carries just enough
//! structure to represent the WKT-style literals the expression grammar
//! accepts (`POINT(1 2)`, `POLYGON((…))`, …). Spatial predicates such as
//! `covers` and `intersects` are resolved by the catalogue backend, which
//! typically translates them to its native geometry engine.

use serde::{Deserialize, Serialize};

/// A 2D coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineString(pub Vec<Point>);

/// A closed ring of points. The closing duplicate point is *not* stored;
/// the parser strips it after validating closure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinearRing(pub Vec<Point>);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polygon(pub Vec<LinearRing>);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiPoint(pub Vec<Point>);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiLineString(pub Vec<LineString>);

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiPolygon(pub Vec<Polygon>);

/// Any geometry value the expression language can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Point(Point),
    LineString(LineString),
    Polygon(Polygon),
    MultiPoint(MultiPoint),
    MultiLineString(MultiLineString),
    MultiPolygon(MultiPolygon),
}
