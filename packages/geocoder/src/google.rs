//! Google Maps response parsing.
//!
//! Pure extraction from the Geocoding API and the "find place from
//! text" fallback. Address components are matched by their type tags;
//! the fallback carries only the reduced field set the endpoint
//! returns.

/// Fields extracted from one provider response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodePayload {
    pub formatted_address: Option<String>,
    pub place_id: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Precision classifier (`ROOFTOP`, `APPROXIMATE`, ...).
    pub location_type: Option<String>,
    pub partial_match: bool,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub admin_area_level1: Option<String>,
    pub admin_area_level2: Option<String>,
    pub admin_area_level3: Option<String>,
    pub route: Option<String>,
    pub street_number: Option<String>,
    /// Comma-joined place types.
    pub types: Option<String>,
}

/// Parses a Geocoding API response. Returns `None` when the result
/// array is empty (the caller then tries the find-place fallback).
#[must_use]
pub fn parse_geocode_response(body: &serde_json::Value) -> Option<GeocodePayload> {
    let first = body.get("results")?.as_array()?.first()?;

    let mut payload = GeocodePayload {
        formatted_address: first
            .get("formatted_address")
            .and_then(|v| v.as_str())
            .map(String::from),
        place_id: first
            .get("place_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        partial_match: first
            .get("partial_match")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        ..GeocodePayload::default()
    };

    if let Some(geometry) = first.get("geometry") {
        if let Some(location) = geometry.get("location") {
            payload.lat = location.get("lat").and_then(serde_json::Value::as_f64);
            payload.lng = location.get("lng").and_then(serde_json::Value::as_f64);
        }
        payload.location_type = geometry
            .get("location_type")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    if let Some(components) = first.get("address_components").and_then(|v| v.as_array()) {
        for component in components {
            let Some(name) = component.get("long_name").and_then(|v| v.as_str()) else {
                continue;
            };
            let types: Vec<&str> = component
                .get("types")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|t| t.as_str()).collect())
                .unwrap_or_default();

            if types.contains(&"postal_code") {
                payload.postal_code = Some(name.to_owned());
            } else if types.contains(&"country") {
                payload.country = Some(name.to_owned());
            } else if types.contains(&"administrative_area_level_1") {
                payload.admin_area_level1 = Some(name.to_owned());
            } else if types.contains(&"administrative_area_level_2") {
                payload.admin_area_level2 = Some(name.to_owned());
            } else if types.contains(&"administrative_area_level_3") {
                payload.admin_area_level3 = Some(name.to_owned());
            } else if types.contains(&"route") {
                payload.route = Some(name.to_owned());
            } else if types.contains(&"street_number") {
                payload.street_number = Some(name.to_owned());
            }
        }
    }

    if let Some(types) = first.get("types").and_then(|v| v.as_array()) {
        let joined: Vec<&str> = types.iter().filter_map(|t| t.as_str()).collect();
        if !joined.is_empty() {
            payload.types = Some(joined.join(","));
        }
    }

    Some(payload)
}

/// Parses a "find place from text" response: address, place id, and
/// coordinates only.
#[must_use]
pub fn parse_find_place_response(body: &serde_json::Value) -> Option<GeocodePayload> {
    let first = body.get("candidates")?.as_array()?.first()?;

    let mut payload = GeocodePayload {
        formatted_address: first
            .get("formatted_address")
            .and_then(|v| v.as_str())
            .map(String::from),
        place_id: first
            .get("place_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        ..GeocodePayload::default()
    };

    if let Some(location) = first.get("geometry").and_then(|g| g.get("location")) {
        payload.lat = location.get("lat").and_then(serde_json::Value::as_f64);
        payload.lng = location.get("lng").and_then(serde_json::Value::as_f64);
    }

    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_geocode_result() {
        let body = serde_json::json!({
            "results": [{
                "formatted_address": "100台灣台北市中正區凱達格蘭大道1號",
                "place_id": "ChIJxxx",
                "partial_match": true,
                "geometry": {
                    "location": { "lat": 25.0393, "lng": 121.5117 },
                    "location_type": "ROOFTOP"
                },
                "address_components": [
                    { "long_name": "100", "types": ["postal_code"] },
                    { "long_name": "台灣", "types": ["country", "political"] },
                    { "long_name": "台北市", "types": ["administrative_area_level_1"] },
                    { "long_name": "中正區", "types": ["administrative_area_level_2"] },
                    { "long_name": "建國里", "types": ["administrative_area_level_3"] },
                    { "long_name": "凱達格蘭大道", "types": ["route"] },
                    { "long_name": "1號", "types": ["street_number"] }
                ],
                "types": ["street_address"]
            }]
        });

        let payload = parse_geocode_response(&body).unwrap();
        assert_eq!(payload.lat, Some(25.0393));
        assert_eq!(payload.lng, Some(121.5117));
        assert!(payload.partial_match);
        assert_eq!(payload.location_type.as_deref(), Some("ROOFTOP"));
        assert_eq!(payload.postal_code.as_deref(), Some("100"));
        assert_eq!(payload.country.as_deref(), Some("台灣"));
        assert_eq!(payload.admin_area_level1.as_deref(), Some("台北市"));
        assert_eq!(payload.admin_area_level3.as_deref(), Some("建國里"));
        assert_eq!(payload.route.as_deref(), Some("凱達格蘭大道"));
        assert_eq!(payload.street_number.as_deref(), Some("1號"));
        assert_eq!(payload.types.as_deref(), Some("street_address"));
    }

    #[test]
    fn empty_results_yield_none() {
        let body = serde_json::json!({ "results": [], "status": "ZERO_RESULTS" });
        assert!(parse_geocode_response(&body).is_none());
    }

    #[test]
    fn parses_find_place_candidate() {
        let body = serde_json::json!({
            "candidates": [{
                "formatted_address": "台北市信義區市府路45號",
                "place_id": "ChIJyyy",
                "geometry": { "location": { "lat": 25.0330, "lng": 121.5654 } }
            }]
        });

        let payload = parse_find_place_response(&body).unwrap();
        assert_eq!(payload.lat, Some(25.0330));
        assert_eq!(payload.place_id.as_deref(), Some("ChIJyyy"));
        assert!(payload.location_type.is_none());
        assert!(!payload.partial_match);
    }

    #[test]
    fn empty_candidates_yield_none() {
        let body = serde_json::json!({ "candidates": [] });
        assert!(parse_find_place_response(&body).is_none());
    }
}
