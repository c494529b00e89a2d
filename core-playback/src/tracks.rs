//! # Track Selection
//!
//! A run either plays the canonical list (count `0`) or `count` distinct
//! tracks taken from the service catalog.
//!
//! Queried lists are diversified across quality tiers: candidates are grouped
//! by tier in first-seen order and picked round-robin, so a run of ten tracks
//! against a mixed catalog does not end up exercising a single bitrate.

use crate::error::{PlaybackError, Result};
use crate::types::{Track, TrackList};
use async_trait::async_trait;
use bridge_traits::CatalogTrack;
use core_session::{Session, SessionError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Revision tag of [`canonical_tracks`].
pub const CANONICAL_VERSION: &str = "v1";

/// Distinct candidates gathered per wanted track, to leave room for tier
/// diversification.
const CANDIDATE_FACTOR: usize = 2;

/// Largest catalog page requested in one call
const CATALOG_PAGE_SIZE: usize = 100;

/// Full pages in a row that add no new track before the catalog is
/// considered exhausted
const MAX_STALE_PAGES: usize = 3;

/// id, title, artist, seconds, quality
const CANONICAL_TRACKS: [(&str, &str, &str, u64, &str); 20] = [
    ("58990486", "Angel", "Massive Attack", 379, "LOSSLESS"),
    ("1570311", "Teardrop", "Massive Attack", 330, "LOSSLESS"),
    ("3108405", "Roads", "Portishead", 305, "LOSSLESS"),
    ("7214573", "Glory Box", "Portishead", 301, "LOSSLESS"),
    ("2834227", "Windowlicker", "Aphex Twin", 367, "LOSSLESS"),
    ("15049843", "Svefn-g-englar", "Sigur Ros", 604, "LOSSLESS"),
    ("5085386", "Everything In Its Right Place", "Radiohead", 251, "LOSSLESS"),
    ("5085390", "Idioteque", "Radiohead", 309, "LOSSLESS"),
    ("14325071", "Hyperballad", "Bjork", 321, "HI_RES"),
    ("20125962", "Unfinished Sympathy", "Massive Attack", 308, "HI_RES"),
    ("35623405", "Midnight City", "M83", 243, "HI_RES"),
    ("4019768", "Porcelain", "Moby", 241, "HI_RES"),
    ("9186443", "Archangel", "Burial", 238, "HI_RES"),
    ("27213632", "Intro", "The xx", 127, "HIGH"),
    ("12541587", "Genesis", "Justice", 234, "HIGH"),
    ("40185012", "Retrograde", "James Blake", 223, "HIGH"),
    ("16983519", "Bloodflows", "SOHN", 260, "HIGH"),
    ("53281907", "Open Eye Signal", "Jon Hopkins", 468, "HIGH"),
    ("1874321", "Kid A", "Radiohead", 284, "LOW"),
    ("8234119", "Born Slippy .NUXX", "Underworld", 584, "LOW"),
];

/// The fixed, versioned list played when no track count is given.
pub fn canonical_tracks() -> TrackList {
    let tracks = CANONICAL_TRACKS
        .iter()
        .map(|(id, title, artist, secs, quality)| Track {
            id: id.to_string(),
            title: title.to_string(),
            artist: Some(artist.to_string()),
            duration: Duration::from_secs(*secs),
            quality: quality.to_string(),
        })
        .collect();

    TrackList::new(tracks, Some(CANONICAL_VERSION.to_string()))
        .unwrap_or_else(|_| unreachable!("canonical list is not empty"))
}

/// Where queried track lists come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// One page of the catalog, starting at `offset`.
    async fn list_catalog(
        &self,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Vec<CatalogTrack>, SessionError>;
}

#[async_trait]
impl CatalogSource for Session {
    async fn list_catalog(
        &self,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Vec<CatalogTrack>, SessionError> {
        Session::list_catalog(self, limit, offset).await
    }
}

pub struct TrackSelector {
    catalog: Arc<dyn CatalogSource>,
}

impl TrackSelector {
    pub fn new(catalog: Arc<dyn CatalogSource>) -> Self {
        Self { catalog }
    }

    /// # Errors
    ///
    /// - [`PlaybackError::InsufficientCatalog`] when fewer than `count`
    ///   distinct tracks are on offer
    /// - [`PlaybackError::Session`] when the catalog cannot be queried
    #[instrument(skip(self))]
    pub async fn select_tracks(&self, count: usize) -> Result<TrackList> {
        if count == 0 {
            let list = canonical_tracks();
            info!(version = CANONICAL_VERSION, tracks = list.len(), "Using canonical track list");
            return Ok(list);
        }

        let candidates = self.collect_candidates(count.saturating_mul(CANDIDATE_FACTOR)).await?;
        debug!(candidates = candidates.len(), "Catalog candidates collected");

        let selected = diversify(candidates, count);
        if selected.len() < count {
            return Err(PlaybackError::InsufficientCatalog {
                requested: count,
                available: selected.len(),
            });
        }

        info!(tracks = selected.len(), "Track list selected from catalog");
        TrackList::new(selected, None)
    }

    /// Page through the catalog until `wanted` distinct playable tracks are
    /// held or the catalog runs out.
    ///
    /// Repeated ids and tracks without a usable duration are skipped, keeping
    /// the first occurrence. A page shorter than requested ends the catalog.
    async fn collect_candidates(&self, wanted: usize) -> Result<Vec<Track>> {
        let mut seen = HashSet::new();
        let mut tracks = Vec::with_capacity(wanted.min(CATALOG_PAGE_SIZE));
        let mut offset = 0usize;
        let mut stale_pages = 0;

        while tracks.len() < wanted {
            let page = self.catalog.list_catalog(CATALOG_PAGE_SIZE, offset).await?;
            let received = page.len();
            let held = tracks.len();

            tracks.extend(
                page.into_iter()
                    .filter(|c| !c.duration.is_zero())
                    .filter(|c| seen.insert(c.id.clone()))
                    .map(Track::from),
            );

            if received < CATALOG_PAGE_SIZE {
                break;
            }
            offset = offset.saturating_add(received);

            stale_pages = if tracks.len() == held { stale_pages + 1 } else { 0 };
            if stale_pages == MAX_STALE_PAGES {
                debug!(offset, "Catalog keeps repeating itself, treating it as exhausted");
                break;
            }
        }

        tracks.truncate(wanted);
        Ok(tracks)
    }
}

/// Round-robin across quality tiers in first-seen tier order.
fn diversify(tracks: Vec<Track>, count: usize) -> Vec<Track> {
    let mut tiers: Vec<(String, std::collections::VecDeque<Track>)> = Vec::new();
    for track in tracks {
        match tiers.iter_mut().find(|(quality, _)| *quality == track.quality) {
            Some((_, bucket)) => bucket.push_back(track),
            None => tiers.push((track.quality.clone(), std::collections::VecDeque::from([track]))),
        }
    }

    let mut selected = Vec::new();
    while selected.len() < count {
        let mut progressed = false;
        for (_, bucket) in tiers.iter_mut() {
            if selected.len() == count {
                break;
            }
            if let Some(track) = bucket.pop_front() {
                selected.push(track);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    selected
}
