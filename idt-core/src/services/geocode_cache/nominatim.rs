//! OpenStreetMap Nominatim reverse geocoder
//!
//! Nominatim's usage policy asks for an identifying User-Agent and at most one
//! request per second; the cache enforces the rate, this client sets the header.

use super::{CacheError, ReverseGeocoder};
use async_trait::async_trait;
use idt_common::Coordinate;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org";

/// City-level detail
const ZOOM: u8 = 10;

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    municipality: Option<String>,
    county: Option<String>,
    state: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

impl Address {
    /// `"Austin, Texas"` in the US, `"Paris, Île-de-France, France"` elsewhere
    fn place_name(&self) -> Option<String> {
        let locality = self
            .city
            .as_ref()
            .or(self.town.as_ref())
            .or(self.village.as_ref())
            .or(self.hamlet.as_ref())
            .or(self.municipality.as_ref())
            .or(self.county.as_ref());

        let mut parts: Vec<&str> = Vec::new();
        parts.extend(locality.map(String::as_str));
        parts.extend(self.state.as_deref());

        let domestic = self
            .country_code
            .as_deref()
            .is_some_and(|code| code.eq_ignore_ascii_case("us"));
        if !domestic {
            parts.extend(self.country.as_deref());
        }

        let parts: Vec<&str> = parts.into_iter().filter(|p| !p.trim().is_empty()).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: Option<&str>, user_agent: &str) -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CacheError::Lookup(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, coordinate: Coordinate) -> Result<String, CacheError> {
        let url = format!("{}/reverse", self.endpoint);
        let lat = coordinate.lat.to_string();
        let lon = coordinate.lon.to_string();
        let zoom = ZOOM.to_string();

        tracing::debug!(url = %url, lat = %lat, lon = %lon, "Querying Nominatim");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2"),
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("zoom", zoom.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CacheError::Lookup(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CacheError::Lookup(format!("HTTP {}: {}", status.as_u16(), body.trim())));
        }

        let reply: ReverseResponse = response
            .json()
            .await
            .map_err(|e| CacheError::Lookup(format!("undecodable response: {}", e)))?;

        place_from_response(reply, coordinate)
    }
}

fn place_from_response(reply: ReverseResponse, coordinate: Coordinate) -> Result<String, CacheError> {
    let at = || format!("{}, {}", coordinate.lat, coordinate.lon);

    if let Some(error) = reply.error {
        tracing::debug!(error = %error, "Nominatim returned no result");
        return Err(CacheError::NoResult(at()));
    }

    reply
        .address
        .as_ref()
        .and_then(Address::place_name)
        .or(reply.display_name.filter(|name| !name.trim().is_empty()))
        .ok_or_else(|| CacheError::NoResult(at()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ReverseResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_us_place_omits_country() {
        let reply = parse(
            r#"{"display_name":"Austin, Travis County, Texas, United States",
                "address":{"city":"Austin","county":"Travis County","state":"Texas",
                           "country":"United States","country_code":"us"}}"#,
        );
        let place = place_from_response(reply, Coordinate::new(30.2672, -97.7431)).unwrap();
        assert_eq!(place, "Austin, Texas");
    }

    #[test]
    fn test_foreign_place_includes_country() {
        let reply = parse(
            r#"{"address":{"village":"Giverny","state":"Normandy","country":"France","country_code":"fr"}}"#,
        );
        let place = place_from_response(reply, Coordinate::new(49.07, 1.53)).unwrap();
        assert_eq!(place, "Giverny, Normandy, France");
    }

    #[test]
    fn test_error_body_is_no_result() {
        let reply = parse(r#"{"error":"Unable to geocode"}"#);
        assert!(matches!(
            place_from_response(reply, Coordinate::new(0.0, -140.0)),
            Err(CacheError::NoResult(_))
        ));
    }

    #[test]
    fn test_display_name_fallback() {
        let reply = parse(r#"{"display_name":"Pacific Ocean","address":{}}"#);
        assert_eq!(
            place_from_response(reply, Coordinate::new(0.0, -140.0)).unwrap(),
            "Pacific Ocean"
        );
    }
}
