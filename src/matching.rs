//! Map-matching capability and the OSRM `match` wire format.
//!
//! The pipeline only talks to a [`MatchService`]; [`crate::http::OsrmClient`]
//! is the network implementation. Request building and response decoding
//! live here so they can be used without the `http` feature.

use async_trait::async_trait;
use geo::{Coord, LineString};
use log::debug;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use url::Url;

use crate::error::{MatchError, PolylineError};
use crate::{MatchedRoute, Sample};

/// Decimal precision of OSRM `polyline6` geometries.
pub const POLYLINE_PRECISION: u32 = 6;

const CHUNK_MIN: u8 = 63;
const CHUNK_MAX: u8 = CHUNK_MIN + 0x3f;
const CONTINUATION: u8 = 0x20;
// 12 chunks carry 60 bits; a 13th would not fit in an i64.
const MAX_CHUNKS: usize = 12;

/// A service that snaps a batch of samples onto a road network.
#[async_trait]
pub trait MatchService: Send + Sync {
    /// Match `samples` (non-empty, sorted by timestamp) with the routing
    /// `profile`, e.g. `"foot"` or `"car"`.
    async fn match_batch(&self, profile: &str, samples: &[Sample]) -> Result<MatchedRoute, MatchError>;
}

/// Builds the `GET {base}match/v1/{profile}/polyline6(...)` request URL.
///
/// Samples without an accuracy radius are sent with `default_radius`.
pub fn build_match_url(
    base_url: &str,
    profile: &str,
    samples: &[Sample],
    default_radius: f64,
) -> Result<Url, MatchError> {
    let encoded = encode_polyline6(samples.iter().map(|s| s.position.0))?;
    let encoded = percent_encode(encoded.as_bytes(), NON_ALPHANUMERIC);
    let profile = percent_encode(profile.as_bytes(), NON_ALPHANUMERIC);

    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    let mut url = Url::parse(&base)?.join(&format!("match/v1/{profile}/polyline6({encoded})"))?;

    let timestamps = samples
        .iter()
        .map(|s| s.timestamp.timestamp().to_string())
        .collect::<Vec<_>>()
        .join(";");
    let radiuses = samples
        .iter()
        .map(|s| s.accuracy_radius.unwrap_or(default_radius).to_string())
        .collect::<Vec<_>>()
        .join(";");

    url.query_pairs_mut()
        .append_pair("geometries", "polyline6")
        .append_pair("tidy", "true")
        .append_pair("steps", "false")
        .append_pair("timestamps", &timestamps)
        .append_pair("radiuses", &radiuses);

    Ok(url)
}

/// Encodes coordinates (x = longitude, y = latitude) as `polyline6`.
pub fn encode_polyline6(
    coords: impl IntoIterator<Item = Coord<f64>>,
) -> Result<String, PolylineError> {
    polyline::encode_coordinates(coords, POLYLINE_PRECISION)
        .map_err(|e| PolylineError::Encode(e.to_string()))
}

/// Decodes a `polyline6` geometry (x = longitude, y = latitude).
pub fn decode_polyline6(encoded: &str) -> Result<LineString<f64>, PolylineError> {
    check_chunks(encoded)?;
    polyline::decode_polyline(encoded, POLYLINE_PRECISION)
        .map_err(|e| PolylineError::Decode(e.to_string()))
}

/// Rejects characters outside the chunk alphabet, values too wide for an
/// `i64`, an unfinished value and a latitude without its longitude.
fn check_chunks(encoded: &str) -> Result<(), PolylineError> {
    let mut chunks = 0;
    let mut values = 0usize;
    for (position, byte) in encoded.bytes().enumerate() {
        if !(CHUNK_MIN..=CHUNK_MAX).contains(&byte) {
            return Err(PolylineError::InvalidCharacter { position, byte });
        }
        chunks += 1;
        if chunks > MAX_CHUNKS {
            return Err(PolylineError::Overflow { position });
        }
        if (byte - CHUNK_MIN) & CONTINUATION == 0 {
            chunks = 0;
            values += 1;
        }
    }
    if chunks != 0 || values % 2 != 0 {
        return Err(PolylineError::Truncated);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    matchings: Vec<Matching>,
}

#[derive(Debug, Deserialize)]
struct Matching {
    geometry: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Decodes an OSRM `match` response body into a route.
///
/// Matchings whose `confidence` is below `min_confidence` are dropped.
pub fn decode_match_response(body: &[u8], min_confidence: f64) -> Result<MatchedRoute, MatchError> {
    let response: MatchResponse = serde_json::from_slice(body)?;

    if response.code != "Ok" {
        return Err(MatchError::Service {
            message: response.message.unwrap_or_default(),
            code: response.code,
        });
    }

    let total = response.matchings.len();
    let legs = response
        .matchings
        .into_iter()
        .filter(|m| m.confidence.map_or(true, |c| c >= min_confidence))
        .map(|m| decode_polyline6(&m.geometry))
        .collect::<Result<Vec<_>, _>>()?;

    debug!("[Match] Decoded {} of {} matchings", legs.len(), total);
    Ok(MatchedRoute::new(legs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn samples() -> Vec<Sample> {
        vec![
            Sample::new(
                DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z").unwrap(),
                13.405,
                52.52,
                Some(8.0),
            ),
            Sample::new(
                DateTime::parse_from_rfc3339("2024-05-01T08:00:30Z").unwrap(),
                13.406,
                52.521,
                None,
            ),
        ]
    }

    #[test]
    fn test_build_match_url() {
        let url = build_match_url("http://localhost:5000", "foot", &samples(), 5.0).unwrap();

        assert!(url.path().starts_with("/match/v1/foot/polyline6("));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("geometries"), Some("polyline6"));
        assert_eq!(get("tidy"), Some("true"));
        assert_eq!(get("steps"), Some("false"));
        assert_eq!(get("timestamps"), Some("1714550400;1714550430"));
        assert_eq!(get("radiuses"), Some("8;5"));
    }

    #[test]
    fn test_build_match_url_keeps_base_path() {
        let url = build_match_url("https://example.org/osrm/", "car", &samples(), 5.0).unwrap();
        assert!(url.path().starts_with("/osrm/match/v1/car/"));
    }

    #[test]
    fn test_encoded_coordinates_round_trip() {
        let url = build_match_url("http://localhost:5000/", "foot", &samples(), 5.0).unwrap();
        let segment = url.path_segments().unwrap().last().unwrap().to_string();
        let inner = segment
            .strip_prefix("polyline6(")
            .and_then(|s| s.strip_suffix(')'))
            .unwrap();
        let decoded = percent_encoding::percent_decode_str(inner).decode_utf8().unwrap();
        let line = decode_polyline6(&decoded).unwrap();
        assert!((line.0[1].x - 13.406).abs() < 1e-9);
        assert!((line.0[1].y - 52.521).abs() < 1e-9);
    }

    #[test]
    fn test_decode_response_with_matchings() {
        let a = encode_polyline6([Coord { x: 13.4, y: 52.5 }, Coord { x: 13.5, y: 52.6 }]).unwrap();
        let b = encode_polyline6([Coord { x: 1.0, y: 2.0 }, Coord { x: 1.5, y: 2.5 }]).unwrap();
        let body = serde_json::json!({
            "code": "Ok",
            "matchings": [
                { "geometry": a, "confidence": 0.9 },
                { "geometry": b, "confidence": 0.1 }
            ],
            "tracepoints": []
        })
        .to_string();

        let route = decode_match_response(body.as_bytes(), 0.0).unwrap();
        assert_eq!(route.legs.len(), 2);
        assert!((route.legs[0].0[1].y - 52.6).abs() < 1e-9);

        let confident = decode_match_response(body.as_bytes(), 0.5).unwrap();
        assert_eq!(confident.legs.len(), 1);
    }

    #[test]
    fn test_decode_response_without_matchings() {
        let route = decode_match_response(br#"{"code":"Ok","matchings":[]}"#, 0.0).unwrap();
        assert!(route.is_empty());
    }

    #[test]
    fn test_decode_service_error() {
        let err = decode_match_response(br#"{"code":"NoMatch","message":"Could not match"}"#, 0.0)
            .unwrap_err();
        match err {
            MatchError::Service { code, message } => {
                assert_eq!(code, "NoMatch");
                assert_eq!(message, "Could not match");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_body() {
        let err = decode_match_response(b"<html>502</html>", 0.0).unwrap_err();
        assert!(matches!(err, MatchError::Body(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_decode_bad_geometry() {
        let err = decode_match_response(br#"{"code":"Ok","matchings":[{"geometry":"_p~i"}]}"#, 0.0)
            .unwrap_err();
        assert!(matches!(err, MatchError::Polyline(_)));
    }

    #[test]
    fn test_reference_polyline() {
        // Example from the polyline algorithm documentation, at precision 5.
        let coords = vec![
            Coord { x: -120.2, y: 38.5 },
            Coord { x: -120.95, y: 40.7 },
            Coord { x: -126.453, y: 43.252 },
        ];
        let encoded = polyline::encode_coordinates(LineString::from(coords), 5).unwrap();
        assert_eq!(encoded, "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn test_polyline6_keeps_micro_degrees() {
        let coords = [
            Coord { x: 13.404954, y: 52.520008 },
            Coord { x: 13.405001, y: 52.520111 },
        ];
        let line = decode_polyline6(&encode_polyline6(coords).unwrap()).unwrap();
        assert_eq!(line.0.len(), 2);
        for (a, b) in coords.iter().zip(line.coords()) {
            assert!((a.x - b.x).abs() < 5e-7);
            assert!((a.y - b.y).abs() < 5e-7);
        }
    }

    #[test]
    fn test_polyline_invalid_character() {
        assert_eq!(
            decode_polyline6("_p~iF ps|U"),
            Err(PolylineError::InvalidCharacter { position: 5, byte: b' ' })
        );
    }

    #[test]
    fn test_polyline_truncated() {
        // A continuation chunk with nothing after it.
        assert_eq!(decode_polyline6("_p~i"), Err(PolylineError::Truncated));
        // A latitude with no longitude.
        assert_eq!(decode_polyline6("_p~iF"), Err(PolylineError::Truncated));
    }

    #[test]
    fn test_polyline_value_width_limit() {
        // Twelve chunks (eleven continuations and a terminator) still fit.
        let widest = format!("{}??", "_".repeat(11));
        assert_eq!(decode_polyline6(&widest).unwrap().0.len(), 1);

        // A thirteenth chunk would lose bits.
        let too_wide = format!("{}?", "_".repeat(12));
        assert_eq!(
            decode_polyline6(&too_wide),
            Err(PolylineError::Overflow { position: 12 })
        );
    }
}
