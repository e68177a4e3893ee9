//! Header mapping between switchyard and NATS.

use async_nats::{HeaderMap, Message};
use switchyard::{AddressError, Delivery, Headers};

/// Encode headers for `publish_with_headers`.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.to_pairs() {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

/// Decode NATS headers. Only the first value of a repeated header is kept.
pub fn from_header_map(map: Option<&HeaderMap>) -> Result<Headers, AddressError> {
    let Some(map) = map else {
        return Ok(Headers::new());
    };
    let pairs = map.iter().filter_map(|(name, values)| {
        values
            .first()
            .map(|value| (name.to_string(), value.as_str().to_owned()))
    });
    Headers::from_pairs(pairs)
}

pub fn into_delivery(message: &Message) -> Result<Delivery, AddressError> {
    let headers = from_header_map(message.headers.as_ref())?;
    Ok(Delivery::new(headers, message.payload.clone()))
}
