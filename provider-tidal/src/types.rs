//! TIDAL API response types

use bridge_traits::CatalogTrack;
use serde::Deserialize;
use std::time::Duration;

/// `POST /login/username`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: u64,
    pub session_id: String,
    pub country_code: Option<String>,
}

/// One page of `GET /playlists/{uuid}/tracks`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPage {
    #[serde(default)]
    pub items: Vec<TidalTrack>,
    #[serde(default)]
    pub total_number_of_items: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TidalTrack {
    pub id: u64,
    pub title: String,
    /// Seconds
    pub duration: u64,
    pub audio_quality: Option<String>,
    pub artist: Option<TidalArtist>,
    #[serde(default = "default_true")]
    pub allow_streaming: bool,
    #[serde(default = "default_true")]
    pub stream_ready: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TidalArtist {
    pub name: String,
}

fn default_true() -> bool {
    true
}

impl TidalTrack {
    pub fn is_streamable(&self) -> bool {
        self.allow_streaming && self.stream_ready
    }
}

impl From<TidalTrack> for CatalogTrack {
    fn from(track: TidalTrack) -> Self {
        CatalogTrack {
            id: track.id.to_string(),
            title: track.title,
            artist: track.artist.map(|a| a.name),
            duration: Duration::from_secs(track.duration),
            quality: track.audio_quality.unwrap_or_else(|| "UNKNOWN".to_string()),
        }
    }
}

/// `GET /tracks/{id}/streamUrl`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUrlResponse {
    pub url: String,
    pub sound_quality: Option<String>,
}
