use serde::{Deserialize, Serialize};

/// `listenPort`, connection caps and rate limits (spec.md §6.7).
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Network {
    /// TCP and UDP bind port. The UDP socket on this port is also used for
    /// the DHT, per BEP 5.
    #[serde(default = "Network::default_listen_port")]
    pub listen_port: u16,

    /// Cap on the number of open peer connections across all torrents.
    #[serde(default = "Network::default_max_global_connections")]
    pub max_global_connections: u32,

    /// Soft cap on the number of open peer connections for a single torrent.
    #[serde(default = "Network::default_max_peers_per_torrent")]
    pub max_peers_per_torrent: u32,

    /// Number of peers we keep unchoked (uploading to) at once.
    #[serde(default = "Network::default_max_upload_slots")]
    pub max_upload_slots: u32,

    /// Token-bucket download rate limit in bytes/second. `0` means unlimited.
    #[serde(default = "Network::default_speed_limit")]
    pub download_speed_limit: u64,

    /// Token-bucket upload rate limit in bytes/second. `0` means unlimited.
    #[serde(default = "Network::default_speed_limit")]
    pub upload_speed_limit: u64,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen_port: Self::default_listen_port(),
            max_global_connections: Self::default_max_global_connections(),
            max_peers_per_torrent: Self::default_max_peers_per_torrent(),
            max_upload_slots: Self::default_max_upload_slots(),
            download_speed_limit: Self::default_speed_limit(),
            upload_speed_limit: Self::default_speed_limit(),
        }
    }
}

impl Network {
    fn default_listen_port() -> u16 {
        6881
    }

    fn default_max_global_connections() -> u32 {
        200
    }

    fn default_max_peers_per_torrent() -> u32 {
        50
    }

    fn default_max_upload_slots() -> u32 {
        4
    }

    fn default_speed_limit() -> u64 {
        0
    }
}
