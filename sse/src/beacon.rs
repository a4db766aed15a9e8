use crate::id::StreamId;

/// Query parameter carrying the stream id of a beacon request.
pub const BEACON_PARAM: &str = "x-sse-id";

/// Response header telling the client which id to beacon with.
pub const SSE_ID_HEADER: &str = "x-sse-id";

/// Extracts the beacon's stream id from a raw query string.
///
/// Returns `None` when the parameter is missing or empty; such a request is a
/// regular stream request, not a malformed beacon.
pub fn find_beacon(query: Option<&str>) -> Option<StreamId> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == BEACON_PARAM)
        .and_then(|(_, value)| {
            if value.is_empty() {
                None
            } else {
                Some(StreamId::from(value.into_owned()))
            }
        })
}
