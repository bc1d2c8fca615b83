//! GeoJSON export of raw samples for inspection in a desktop GIS.

use std::fs;
use std::path::Path;

use chrono::SecondsFormat;
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value};
use log::info;
use serde_json::json;

use crate::Sample;

/// Builds a point FeatureCollection with `time` and `radius` properties,
/// declaring WGS84 (EPSG:4326) as its coordinate reference system.
pub fn samples_to_geojson(samples: &[Sample]) -> GeoJson {
    let features = samples
        .iter()
        .map(|s| {
            let mut properties = JsonObject::new();
            properties.insert(
                "time".to_string(),
                json!(s.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            );
            properties.insert("radius".to_string(), json!(s.accuracy_radius));

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Point(vec![s.longitude(), s.latitude()]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let mut crs = JsonObject::new();
    crs.insert(
        "crs".to_string(),
        json!({ "type": "name", "properties": { "name": "EPSG:4326" } }),
    );

    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(crs),
    })
}

/// Writes [`samples_to_geojson`] to `path`.
pub fn write_geojson(samples: &[Sample], path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, samples_to_geojson(samples).to_string())?;
    info!("[Export] Wrote {} samples to {}", samples.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_export_feature_collection() {
        let samples = vec![
            Sample::new(
                DateTime::parse_from_rfc3339("2024-05-01T08:00:00+02:00").unwrap(),
                13.405,
                52.52,
                Some(4.5),
            ),
            Sample::new(
                DateTime::parse_from_rfc3339("2024-05-01T08:00:05+02:00").unwrap(),
                13.406,
                52.521,
                None,
            ),
        ];

        let json: serde_json::Value =
            serde_json::from_str(&samples_to_geojson(&samples).to_string()).unwrap();

        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["crs"]["properties"]["name"], "EPSG:4326");
        let features = json["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["geometry"]["type"], "Point");
        assert_eq!(features[0]["geometry"]["coordinates"][0], 13.405);
        assert_eq!(features[0]["geometry"]["coordinates"][1], 52.52);
        assert_eq!(features[0]["properties"]["time"], "2024-05-01T08:00:00+02:00");
        assert_eq!(features[0]["properties"]["radius"], 4.5);
        assert!(features[1]["properties"]["radius"].is_null());
    }

    #[test]
    fn test_write_geojson_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("samples.geojson");
        write_geojson(&[], &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("FeatureCollection"));
    }
}
