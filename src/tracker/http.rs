//! HTTP tracker client (BEP 3) built on `reqwest` (spec.md §4.5).

use std::time::Duration;

use percent_encoding::NON_ALPHANUMERIC;
use serde::Deserialize;
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::announce_event::AnnounceEvent;
use tracing::debug;

use crate::dht::compact;

use super::{AnnounceOutcome, AnnounceParams};

pub const TRACKER_HTTP_LOG_TARGET: &str = "TRACKER HTTP";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpTrackerError {
    #[error("http request failed: {0}")]
    Request(String),
    #[error("bencode decode failed: {0}")]
    Decode(String),
    #[error("tracker rejected the announce: {0}")]
    Rejected(String),
}

/// Bencoded announce response (spec.md §4.5): `peers` is compact IPv4 (6
/// bytes each), `peers6` compact IPv6 (18 bytes each) when the tracker
/// supports BEP 7. A `failure reason` turns the whole response into an
/// error, no matter what else is present.
#[derive(Debug, Deserialize, Default)]
struct RawAnnounceResponse {
    #[serde(default)]
    interval: u32,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u32>,
    #[serde(default)]
    complete: u32,
    #[serde(default)]
    incomplete: u32,
    #[serde(default, with = "serde_bytes")]
    peers: Option<Vec<u8>>,
    #[serde(rename = "peers6", default, with = "serde_bytes")]
    peers6: Option<Vec<u8>>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

pub struct HttpTrackerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTrackerClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self { base_url, http: reqwest::Client::new() }
    }

    /// # Errors
    ///
    /// Returns [`HttpTrackerError`] if the request fails or times out, the
    /// body doesn't bencode-decode, or the tracker sent a `failure reason`.
    pub async fn announce(&self, params: &AnnounceParams) -> Result<AnnounceOutcome, HttpTrackerError> {
        let url = self.build_announce_url(params);
        debug!(target: TRACKER_HTTP_LOG_TARGET, %url, "announcing");

        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| HttpTrackerError::Request(e.to_string()))?;

        let bytes = response.bytes().await.map_err(|e| HttpTrackerError::Request(e.to_string()))?;

        let raw: RawAnnounceResponse =
            serde_bencode::from_bytes(&bytes).map_err(|e| HttpTrackerError::Decode(e.to_string()))?;

        if let Some(reason) = raw.failure_reason {
            return Err(HttpTrackerError::Rejected(reason));
        }

        let mut peers = Vec::new();
        if let Some(compact) = &raw.peers {
            peers.extend(compact.chunks_exact(6).filter_map(|chunk| compact::decode_peer(chunk).ok()));
        }
        if let Some(compact6) = &raw.peers6 {
            peers.extend(compact6.chunks_exact(18).filter_map(|chunk| compact::decode_peer(chunk).ok()));
        }

        debug!(target: TRACKER_HTTP_LOG_TARGET, peers = peers.len(), "announce succeeded");

        Ok(AnnounceOutcome {
            interval: Duration::from_secs(u64::from(raw.interval)),
            min_interval: raw.min_interval.map(|s| Duration::from_secs(u64::from(s))),
            peers,
            seeders: raw.complete,
            leechers: raw.incomplete,
        })
    }

    fn build_announce_url(&self, params: &AnnounceParams) -> String {
        let info_hash = percent_encoding::percent_encode(&params.info_hash.bytes(), NON_ALPHANUMERIC);
        let peer_id = percent_encoding::percent_encode(&params.peer_id.bytes(), NON_ALPHANUMERIC);
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}info_hash={info_hash}&peer_id={peer_id}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.base_url, params.port, params.uploaded, params.downloaded, params.left,
        );
        if let Some(event) = announce_event_param(params.event) {
            url.push_str("&event=");
            url.push_str(event);
        }
        if params.num_want >= 0 {
            url.push_str("&numwant=");
            url.push_str(&params.num_want.to_string());
        }
        url
    }
}

fn announce_event_param(event: AnnounceEvent) -> Option<&'static str> {
    match event {
        AnnounceEvent::Started => Some("started"),
        AnnounceEvent::Stopped => Some("stopped"),
        AnnounceEvent::Completed => Some("completed"),
        AnnounceEvent::None => None,
    }
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::info_hash::InfoHash;
    use torrentd_primitives::peer_id::PeerId;

    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash::from([7u8; 20]),
            peer_id: PeerId::generate(b"-TD0001-"),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: AnnounceEvent::Started,
            num_want: 50,
        }
    }

    #[test]
    fn should_build_an_announce_url_with_percent_encoded_binary_fields() {
        let client = HttpTrackerClient::new("http://tracker.example.com/announce".to_owned());
        let url = client.build_announce_url(&params());
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash=%07%07%07%07%07"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
    }

    #[test]
    fn should_omit_the_event_param_for_periodic_announces() {
        let client = HttpTrackerClient::new("http://tracker.example.com/announce".to_owned());
        let mut p = params();
        p.event = AnnounceEvent::None;
        let url = client.build_announce_url(&p);
        assert!(!url.contains("event="));
    }

    #[test]
    fn should_decode_a_compact_bencoded_response_into_peer_addresses() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peers18:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe1]);
        body.extend_from_slice(&[127, 0, 0, 3, 0x1a, 0xe1]);
        body.extend_from_slice(b"e");

        let raw: RawAnnounceResponse = serde_bencode::from_bytes(&body).unwrap();
        let peers: Vec<PeerAddress> = raw.peers.unwrap().chunks_exact(6).filter_map(|c| compact::decode_peer(c).ok()).collect();

        assert_eq!(peers.len(), 3);
        assert_eq!(raw.interval, 900);
    }

    #[test]
    fn should_surface_a_failure_reason_as_rejected() {
        let body = b"d14:failure reason17:torrent not founde";
        let raw: RawAnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(raw.failure_reason.as_deref(), Some("torrent not found"));
    }
}
