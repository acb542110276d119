//! Geometry adapter over the `geo` crate.
//!
//! All coordinates are longitude/latitude (EPSG:4326). Polygons arrive as
//! GeoJSON from the map client and are normalised into a `MultiPolygon` so a
//! single point-in-polygon predicate covers both drawn shapes and multi-part
//! selections.

use geo::{
    BoundingRect, Coord, ConvexHull, HaversineDistance, Intersects, LineString, MultiPoint,
    MultiPolygon, Point, Polygon,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::GeometryError;

/// Axis-aligned bounds of a point set, serialised the way the map client expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(rename = "minX")]
    pub min_x: f64,
    #[serde(rename = "minY")]
    pub min_y: f64,
    #[serde(rename = "maxX")]
    pub max_x: f64,
    #[serde(rename = "maxY")]
    pub max_y: f64,
}

#[derive(Deserialize)]
struct PolygonCoords {
    coordinates: Vec<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct MultiPolygonCoords {
    coordinates: Vec<Vec<Vec<Vec<f64>>>>,
}

#[derive(Deserialize)]
struct FeatureWrapper {
    geometry: Value,
}

/// Build a validated point from a stored longitude/latitude pair.
pub fn point(lon: f64, lat: f64) -> Result<Point<f64>, GeometryError> {
    let valid = lon.is_finite()
        && lat.is_finite()
        && (-180.0..=180.0).contains(&lon)
        && (-90.0..=90.0).contains(&lat);
    if !valid {
        return Err(GeometryError::InvalidCoordinate { lon, lat });
    }
    Ok(Point::new(lon, lat))
}

/// Parse a GeoJSON `Polygon`, `MultiPolygon`, or a `Feature` wrapping one.
pub fn polygon_from_geojson(value: &Value) -> Result<MultiPolygon<f64>, GeometryError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GeometryError::Malformed("missing \"type\"".to_string()))?;

    match kind {
        "Polygon" => {
            let parsed: PolygonCoords = serde_json::from_value(value.clone())
                .map_err(|e| GeometryError::Malformed(e.to_string()))?;
            Ok(MultiPolygon::new(vec![polygon_from_rings(&parsed.coordinates)?]))
        }
        "MultiPolygon" => {
            let parsed: MultiPolygonCoords = serde_json::from_value(value.clone())
                .map_err(|e| GeometryError::Malformed(e.to_string()))?;
            if parsed.coordinates.is_empty() {
                return Err(GeometryError::DegeneratePolygon(0));
            }
            let polygons = parsed
                .coordinates
                .iter()
                .map(|rings| polygon_from_rings(rings))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MultiPolygon::new(polygons))
        }
        "Feature" => {
            let feature: FeatureWrapper = serde_json::from_value(value.clone())
                .map_err(|e| GeometryError::Malformed(e.to_string()))?;
            polygon_from_geojson(&feature.geometry)
        }
        other => Err(GeometryError::UnsupportedType(other.to_string())),
    }
}

fn polygon_from_rings(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>, GeometryError> {
    let Some((exterior, interiors)) = rings.split_first() else {
        return Err(GeometryError::DegeneratePolygon(0));
    };

    let exterior = ring(exterior)?;
    let vertices = distinct_vertices(&exterior);
    if vertices < 3 {
        return Err(GeometryError::DegeneratePolygon(vertices));
    }

    let interiors = interiors
        .iter()
        .map(|r| ring(r))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Polygon::new(exterior, interiors))
}

fn ring(positions: &[Vec<f64>]) -> Result<LineString<f64>, GeometryError> {
    let coords = positions
        .iter()
        .map(|position| match position.as_slice() {
            [lon, lat, ..] => point(*lon, *lat).map(Coord::from),
            _ => Err(GeometryError::Malformed(format!(
                "position needs 2 numbers, got {}",
                position.len()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn distinct_vertices(ring: &LineString<f64>) -> usize {
    let mut seen: Vec<Coord<f64>> = Vec::new();
    for coord in ring.coords() {
        if !seen.contains(coord) {
            seen.push(*coord);
        }
    }
    seen.len()
}

/// Boundary-inclusive point-in-polygon test.
pub fn point_in_polygon(point: &Point<f64>, polygon: &MultiPolygon<f64>) -> bool {
    polygon.0.iter().any(|part| part.intersects(point))
}

pub fn bounding_box(points: &[Point<f64>]) -> Option<BoundingBox> {
    let rect = MultiPoint::new(points.to_vec()).bounding_rect()?;
    Some(BoundingBox {
        min_x: rect.min().x,
        min_y: rect.min().y,
        max_x: rect.max().x,
        max_y: rect.max().y,
    })
}

pub fn convex_hull(points: &[Point<f64>]) -> Option<Polygon<f64>> {
    if points.is_empty() {
        return None;
    }
    Some(MultiPoint::new(points.to_vec()).convex_hull())
}

/// GeoJSON footprint of a point set: a `Point` for one distinct location, a
/// `LineString` for two, otherwise the convex hull polygon.
pub fn footprint_geojson(points: &[Point<f64>]) -> Option<Value> {
    let mut distinct: Vec<Point<f64>> = Vec::new();
    for p in points {
        if !distinct.contains(p) {
            distinct.push(*p);
        }
    }

    match distinct.as_slice() {
        [] => None,
        [only] => Some(json!({
            "type": "Point",
            "coordinates": [only.x(), only.y()],
        })),
        [a, b] => Some(json!({
            "type": "LineString",
            "coordinates": [[a.x(), a.y()], [b.x(), b.y()]],
        })),
        _ => {
            let hull = convex_hull(&distinct)?;
            let ring: Vec<[f64; 2]> = hull.exterior().coords().map(|c| [c.x, c.y]).collect();
            Some(json!({
                "type": "Polygon",
                "coordinates": [ring],
            }))
        }
    }
}

/// Great-circle distance in metres.
pub fn haversine_meters(a: &Point<f64>, b: &Point<f64>) -> f64 {
    a.haversine_distance(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[[9.0, 59.0], [11.0, 59.0], [11.0, 61.0], [9.0, 61.0], [9.0, 59.0]]]
        })
    }

    #[test]
    fn test_point_in_polygon_inclusive_boundary() {
        let poly = polygon_from_geojson(&square()).unwrap();
        assert!(point_in_polygon(&Point::new(10.0, 60.0), &poly));
        assert!(point_in_polygon(&Point::new(11.0, 60.0), &poly));
        assert!(point_in_polygon(&Point::new(9.0, 59.0), &poly));
        assert!(!point_in_polygon(&Point::new(11.5, 60.0), &poly));
    }

    #[test]
    fn test_hole_excludes_points() {
        let value = json!({
            "type": "Polygon",
            "coordinates": [
                [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
                [[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0], [4.0, 4.0]]
            ]
        });
        let poly = polygon_from_geojson(&value).unwrap();
        assert!(point_in_polygon(&Point::new(1.0, 1.0), &poly));
        assert!(!point_in_polygon(&Point::new(5.0, 5.0), &poly));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let value = json!({
            "type": "Polygon",
            "coordinates": [[[9.0, 59.0], [11.0, 59.0], [9.0, 59.0]]]
        });
        assert_eq!(
            polygon_from_geojson(&value).unwrap_err(),
            GeometryError::DegeneratePolygon(2)
        );

        let empty = json!({ "type": "Polygon", "coordinates": [] });
        assert_eq!(
            polygon_from_geojson(&empty).unwrap_err(),
            GeometryError::DegeneratePolygon(0)
        );
    }

    #[test]
    fn test_feature_and_multipolygon_accepted() {
        let feature = json!({ "type": "Feature", "properties": {}, "geometry": square() });
        assert_eq!(polygon_from_geojson(&feature).unwrap().0.len(), 1);

        let multi = json!({
            "type": "MultiPolygon",
            "coordinates": [
                [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
                [[[5.0, 5.0], [6.0, 5.0], [6.0, 6.0], [5.0, 5.0]]]
            ]
        });
        let poly = polygon_from_geojson(&multi).unwrap();
        assert!(point_in_polygon(&Point::new(5.9, 5.5), &poly));
        assert!(!point_in_polygon(&Point::new(3.0, 3.0), &poly));
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let line = json!({ "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] });
        assert!(matches!(
            polygon_from_geojson(&line),
            Err(GeometryError::UnsupportedType(_))
        ));
        assert!(matches!(
            polygon_from_geojson(&json!({ "coordinates": [] })),
            Err(GeometryError::Malformed(_))
        ));
        let bad_coord = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0], [1.0, 1.0], [0.0, 0.0]]]
        });
        assert!(matches!(
            polygon_from_geojson(&bad_coord),
            Err(GeometryError::Malformed(_))
        ));
    }

    #[test]
    fn test_point_validation() {
        assert!(point(10.0, 60.0).is_ok());
        assert!(point(200.0, 60.0).is_err());
        assert!(point(10.0, f64::NAN).is_err());
    }

    #[test]
    fn test_bounding_box() {
        assert_eq!(bounding_box(&[]), None);
        let bounds = bounding_box(&[Point::new(10.0, 60.0), Point::new(10.1, 60.1)]).unwrap();
        assert_eq!(bounds.min_x, 10.0);
        assert_eq!(bounds.min_y, 60.0);
        assert_eq!(bounds.max_x, 10.1);
        assert_eq!(bounds.max_y, 60.1);

        let encoded = serde_json::to_value(bounds).unwrap();
        assert_eq!(encoded["minX"], json!(10.0));
        assert_eq!(encoded["maxY"], json!(60.1));
    }

    #[test]
    fn test_footprint_shapes() {
        assert_eq!(footprint_geojson(&[]), None);

        let one = footprint_geojson(&[Point::new(1.0, 2.0), Point::new(1.0, 2.0)]).unwrap();
        assert_eq!(one["type"], "Point");

        let two = footprint_geojson(&[Point::new(1.0, 2.0), Point::new(3.0, 4.0)]).unwrap();
        assert_eq!(two["type"], "LineString");

        let hull = footprint_geojson(&[
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 2.0),
            Point::new(0.0, 2.0),
            Point::new(1.0, 1.0),
        ])
        .unwrap();
        assert_eq!(hull["type"], "Polygon");
        // interior point dropped, ring closed
        assert_eq!(hull["coordinates"][0].as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_haversine() {
        let a = Point::new(10.0, 60.0);
        let b = Point::new(10.0, 60.001);
        let d = haversine_meters(&a, &b);
        assert!((d - 111.2).abs() < 1.0, "distance was {}", d);
    }
}
