//! Identity resolution.
//!
//! Maps Confirmed stabilizer tracks onto persistent identities. A track
//! keeps the identity it was bound to while that identity is still
//! cached; unbound tracks are matched by visual signature first and by
//! distance to the Kalman-predicted center second, otherwise a new
//! identity is minted. Matching is 1:1 within a frame.

use chrono::{DateTime, Utc};
use percept_models::{BoundingBox, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::IdentityConfig;
use crate::motion::MotionFilter;
use crate::similarity::cosine_similarity;
use crate::stabilizer::StabilizedTrack;

/// A persistent identity, owned by the short-term cache while resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedIdentity {
    pub id: IdentityId,
    pub label: String,
    pub class_index: i32,
    pub bounding_box: BoundingBox,
    /// Running average of observed confidences
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observations: u32,
    /// Visual signature, when one has been extracted
    pub signature: Option<Vec<f32>>,
    pub motion: Option<MotionFilter>,
    /// Center displacement on the last update; `None` until seen twice
    pub last_displacement: Option<f64>,
    /// Known-object label from the recognizer
    pub recognized_as: Option<String>,
}

impl TrackedIdentity {
    /// Mint a new identity from a track.
    pub fn from_track(track: &StabilizedTrack, now: DateTime<Utc>, config: &IdentityConfig) -> Self {
        let (cx, cy) = track.bounding_box.center();
        Self {
            id: IdentityId::new(),
            label: track.label.clone(),
            class_index: track.class_index,
            bounding_box: track.bounding_box,
            confidence: track.confidence.clamp(0.0, 1.0),
            first_seen: now,
            last_seen: now,
            observations: 1,
            signature: None,
            motion: Some(MotionFilter::new(cx, cy, config)),
            last_displacement: None,
            recognized_as: None,
        }
    }

    /// Fold a new observation into the identity.
    pub fn observe(&mut self, track: &StabilizedTrack, now: DateTime<Utc>, config: &IdentityConfig) {
        self.observations = self.observations.saturating_add(1);
        let weight = 1.0 / self.observations as f64;
        self.confidence = (self.confidence + (track.confidence - self.confidence) * weight).clamp(0.0, 1.0);

        let (cx, cy) = track.bounding_box.center();
        self.last_displacement = Some(self.bounding_box.center_distance(&track.bounding_box));
        self.bounding_box = track.bounding_box;
        self.class_index = track.class_index;
        self.last_seen = now;

        match self.motion.as_mut() {
            Some(filter) => filter.step(cx, cy),
            None => self.motion = Some(MotionFilter::new(cx, cy, config)),
        }
    }

    /// Center where the identity is expected next.
    pub fn predicted_center(&self) -> (f64, f64) {
        self.motion
            .as_ref()
            .map(|m| m.predicted_position())
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .unwrap_or_else(|| self.bounding_box.center())
    }

    /// Distance from a box to this identity, taking the nearer of the last
    /// seen center and the predicted center.
    pub fn distance_to(&self, bbox: &BoundingBox) -> f64 {
        let (px, py) = self.predicted_center();
        let (cx, cy) = bbox.center();
        let predicted = ((px - cx).powi(2) + (py - cy).powi(2)).sqrt();
        let last = self.bounding_box.center_distance(bbox);
        if predicted.is_finite() {
            predicted.min(last)
        } else {
            last
        }
    }
}

/// How a track was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Track kept its existing binding
    Bound,
    /// Matched by visual signature
    Signature,
    /// Matched by proximity
    Spatial,
    /// No match; a new identity was minted
    Minted,
}

/// One resolved track.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub track_id: u64,
    pub identity: TrackedIdentity,
    pub kind: MatchKind,
}

/// Running resolver statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolverStats {
    pub bound: u64,
    pub signature_matches: u64,
    pub spatial_matches: u64,
    pub minted: u64,
}

/// Resolves tracks to persistent identities.
pub struct IdentityResolver {
    config: IdentityConfig,
    /// Stabilizer track id -> identity
    bindings: HashMap<u64, IdentityId>,
    stats: ResolverStats,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            bindings: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    /// Tracks without a binding to an identity in `known`.
    ///
    /// These are the tracks worth probing for a signature before
    /// resolving, so that re-identification can use appearance.
    pub fn unbound<'a>(
        &self,
        tracks: &'a [StabilizedTrack],
        known: &[TrackedIdentity],
    ) -> Vec<&'a StabilizedTrack> {
        let known_ids: HashSet<IdentityId> = known.iter().map(|i| i.id).collect();
        tracks
            .iter()
            .filter(|t| {
                self.bindings
                    .get(&t.id)
                    .map_or(true, |id| !known_ids.contains(id))
            })
            .collect()
    }

    /// Resolve this frame's tracks against the known identities.
    ///
    /// `known` is a snapshot of the cache; `queries` holds signatures
    /// extracted for unbound tracks. Returns one resolved identity per
    /// track, in track order. The caller commits them back to the cache.
    pub fn resolve(
        &mut self,
        tracks: &[StabilizedTrack],
        known: &[TrackedIdentity],
        queries: &HashMap<u64, Vec<f32>>,
        now: DateTime<Utc>,
    ) -> Vec<ResolvedTrack> {
        let by_id: HashMap<IdentityId, usize> =
            known.iter().enumerate().map(|(i, identity)| (identity.id, i)).collect();
        let mut claimed: HashSet<IdentityId> = HashSet::new();
        let mut assigned: Vec<Option<(usize, MatchKind)>> = vec![None; tracks.len()];

        // Existing bindings take priority
        for (slot, track) in tracks.iter().enumerate() {
            if let Some(index) = self.bindings.get(&track.id).and_then(|id| by_id.get(id)) {
                let identity = &known[*index];
                if identity.label == track.label && claimed.insert(identity.id) {
                    assigned[slot] = Some((*index, MatchKind::Bound));
                }
            }
        }

        // Unbound tracks: signature first, then proximity
        for (slot, track) in tracks.iter().enumerate() {
            if assigned[slot].is_some() {
                continue;
            }
            let query = queries.get(&track.id).map(Vec::as_slice);

            let found = query
                .and_then(|p| self.match_by_signature(track, p, known, &claimed))
                .map(|index| (index, MatchKind::Signature))
                .or_else(|| {
                    self.match_by_distance(track, query, known, &claimed)
                        .map(|index| (index, MatchKind::Spatial))
                });

            if let Some((index, kind)) = found {
                claimed.insert(known[index].id);
                assigned[slot] = Some((index, kind));
            }
        }

        let mut resolved = Vec::with_capacity(tracks.len());
        for (slot, track) in tracks.iter().enumerate() {
            let query = queries.get(&track.id);

            let (identity, kind) = match assigned[slot] {
                Some((index, kind)) => {
                    let mut identity = known[index].clone();
                    identity.observe(track, now, &self.config);
                    if let Some(signature) = query {
                        identity.signature = Some(signature.clone());
                    }
                    (identity, kind)
                }
                None => {
                    let mut identity = TrackedIdentity::from_track(track, now, &self.config);
                    identity.signature = query.cloned();
                    info!(
                        identity_id = %identity.id,
                        track_id = track.id,
                        label = %identity.label,
                        "New identity"
                    );
                    (identity, MatchKind::Minted)
                }
            };

            match kind {
                MatchKind::Bound => self.stats.bound += 1,
                MatchKind::Signature => self.stats.signature_matches += 1,
                MatchKind::Spatial => self.stats.spatial_matches += 1,
                MatchKind::Minted => self.stats.minted += 1,
            }

            if kind != MatchKind::Bound {
                // An identity is bound to one track at a time
                let id = identity.id;
                self.bindings.retain(|_, bound| *bound != id);
                debug!(track_id = track.id, identity_id = %id, kind = ?kind, "Track bound");
            }
            self.bindings.insert(track.id, identity.id);

            resolved.push(ResolvedTrack {
                track_id: track.id,
                identity,
                kind,
            });
        }

        resolved
    }

    fn match_by_signature(
        &self,
        track: &StabilizedTrack,
        query: &[f32],
        known: &[TrackedIdentity],
        claimed: &HashSet<IdentityId>,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, identity) in known.iter().enumerate() {
            if claimed.contains(&identity.id) || identity.label != track.label {
                continue;
            }
            let Some(signature) = identity.signature.as_deref() else {
                continue;
            };
            let similarity = cosine_similarity(query, signature);
            if similarity > self.config.signature_threshold
                && best.map_or(true, |(_, s)| similarity > s)
            {
                best = Some((index, similarity));
            }
        }
        best.map(|(index, _)| index)
    }

    fn match_by_distance(
        &self,
        track: &StabilizedTrack,
        query: Option<&[f32]>,
        known: &[TrackedIdentity],
        claimed: &HashSet<IdentityId>,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, identity) in known.iter().enumerate() {
            if claimed.contains(&identity.id) || identity.label != track.label {
                continue;
            }

            let distance = identity.distance_to(&track.bounding_box);
            if distance > self.config.match_radius {
                continue;
            }

            // With signatures on both sides, appearance must agree too
            if let (Some(p), Some(signature)) = (query, identity.signature.as_deref()) {
                if cosine_similarity(p, signature) <= self.config.signature_threshold {
                    continue;
                }
            }

            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Forget bindings of tracks the stabilizer no longer holds.
    pub fn retain_tracks(&mut self, live: &[u64]) {
        let live: HashSet<u64> = live.iter().copied().collect();
        self.bindings.retain(|track_id, _| live.contains(track_id));
    }

    /// Identity bound to a track, if any.
    pub fn binding(&self, track_id: u64) -> Option<IdentityId> {
        self.bindings.get(&track_id).copied()
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(IdentityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stabilizer::TrackState;
    use percept_models::Velocity;

    fn track(id: u64, label: &str, confidence: f64, bbox: BoundingBox) -> StabilizedTrack {
        StabilizedTrack {
            id,
            label: label.to_string(),
            class_index: 0,
            bounding_box: bbox,
            confidence,
            predicted_box: bbox,
            velocity: Velocity::default(),
            state: TrackState::Confirmed,
            streak: 2,
            misses: 0,
            observations: 2,
            created_frame: 1,
        }
    }

    fn boxed(cx: f64, cy: f64) -> BoundingBox {
        BoundingBox::from_center(cx, cy, 0.2, 0.2)
    }

    #[test]
    fn test_mints_identity_for_new_track() {
        let mut resolver = IdentityResolver::default();
        let now = Utc::now();
        let out = resolver.resolve(&[track(1, "person", 0.6, boxed(0.5, 0.5))], &[], &HashMap::new(), now);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MatchKind::Minted);
        assert_eq!(out[0].identity.first_seen, now);
        assert_eq!(out[0].identity.last_seen, now);
        assert_eq!(resolver.binding(1), Some(out[0].identity.id));
    }

    #[test]
    fn test_bound_track_keeps_identity() {
        let mut resolver = IdentityResolver::default();
        let t = track(1, "person", 0.6, boxed(0.5, 0.5));
        let first = resolver.resolve(&[t.clone()], &[], &HashMap::new(), Utc::now());
        let known = vec![first[0].identity.clone()];

        let second = resolver.resolve(&[t], &known, &HashMap::new(), Utc::now());
        assert_eq!(second[0].kind, MatchKind::Bound);
        assert_eq!(second[0].identity.id, known[0].id);
        assert_eq!(second[0].identity.observations, 2);
    }

    #[test]
    fn test_spatial_match_within_radius() {
        let mut resolver = IdentityResolver::default();
        let first = resolver.resolve(&[track(1, "cup", 0.6, boxed(0.5, 0.5))], &[], &HashMap::new(), Utc::now());
        let known = vec![first[0].identity.clone()];
        resolver.retain_tracks(&[]);

        let near = resolver.resolve(&[track(2, "cup", 0.6, boxed(0.55, 0.5))], &known, &HashMap::new(), Utc::now());
        assert_eq!(near[0].kind, MatchKind::Spatial);
        assert_eq!(near[0].identity.id, known[0].id);
        assert!((near[0].identity.last_displacement.unwrap() - 0.05).abs() < 1e-9);

        resolver.retain_tracks(&[]);
        let far = resolver.resolve(&[track(3, "cup", 0.6, boxed(0.9, 0.9))], &known, &HashMap::new(), Utc::now());
        assert_eq!(far[0].kind, MatchKind::Minted);
    }

    #[test]
    fn test_label_must_match() {
        let mut resolver = IdentityResolver::default();
        let first = resolver.resolve(&[track(1, "cup", 0.6, boxed(0.5, 0.5))], &[], &HashMap::new(), Utc::now());
        let known = vec![first[0].identity.clone()];

        let out = resolver.resolve(&[track(2, "bowl", 0.6, boxed(0.5, 0.5))], &known, &HashMap::new(), Utc::now());
        assert_eq!(out[0].kind, MatchKind::Minted);
    }

    #[test]
    fn test_identity_claimed_once_per_frame() {
        let mut resolver = IdentityResolver::default();
        let first = resolver.resolve(&[track(1, "cup", 0.6, boxed(0.5, 0.5))], &[], &HashMap::new(), Utc::now());
        let known = vec![first[0].identity.clone()];
        resolver.retain_tracks(&[]);

        let out = resolver.resolve(
            &[track(2, "cup", 0.6, boxed(0.52, 0.5)), track(3, "cup", 0.6, boxed(0.48, 0.5))],
            &known,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].identity.id, out[1].identity.id);
        assert_eq!(out.iter().filter(|r| r.identity.id == known[0].id).count(), 1);
    }

    #[test]
    fn test_signature_reidentifies_distant_track() {
        let mut resolver = IdentityResolver::default();
        let mut queries = HashMap::new();
        queries.insert(1, vec![1.0, 0.0, 0.0]);
        let first = resolver.resolve(&[track(1, "dog", 0.6, boxed(0.2, 0.2))], &[], &queries, Utc::now());
        let known = vec![first[0].identity.clone()];
        resolver.retain_tracks(&[]);

        let mut queries = HashMap::new();
        queries.insert(2, vec![0.99, 0.05, 0.0]);
        let out = resolver.resolve(&[track(2, "dog", 0.6, boxed(0.8, 0.8))], &known, &queries, Utc::now());
        assert_eq!(out[0].kind, MatchKind::Signature);
        assert_eq!(out[0].identity.id, known[0].id);
    }

    #[test]
    fn test_dissimilar_signature_blocks_spatial_match() {
        let mut resolver = IdentityResolver::default();
        let mut queries = HashMap::new();
        queries.insert(1, vec![1.0, 0.0]);
        let first = resolver.resolve(&[track(1, "dog", 0.6, boxed(0.5, 0.5))], &[], &queries, Utc::now());
        let known = vec![first[0].identity.clone()];
        resolver.retain_tracks(&[]);

        let mut queries = HashMap::new();
        queries.insert(2, vec![0.0, 1.0]);
        let out = resolver.resolve(&[track(2, "dog", 0.6, boxed(0.5, 0.5))], &known, &queries, Utc::now());
        assert_eq!(out[0].kind, MatchKind::Minted);
    }

    #[test]
    fn test_confidence_is_running_average() {
        let config = IdentityConfig::default();
        let now = Utc::now();
        let mut identity = TrackedIdentity::from_track(&track(1, "cup", 0.6, boxed(0.5, 0.5)), now, &config);
        identity.observe(&track(1, "cup", 0.9, boxed(0.5, 0.5)), now, &config);
        assert!((identity.confidence - 0.75).abs() < 1e-9);
        identity.observe(&track(1, "cup", 0.3, boxed(0.5, 0.5)), now, &config);
        assert!((identity.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unbound_lists_tracks_without_cached_identity() {
        let mut resolver = IdentityResolver::default();
        let t1 = track(1, "cup", 0.6, boxed(0.2, 0.2));
        let t2 = track(2, "cup", 0.6, boxed(0.8, 0.8));
        let first = resolver.resolve(&[t1.clone()], &[], &HashMap::new(), Utc::now());
        let known = vec![first[0].identity.clone()];

        let tracks = [t1, t2];
        let unbound = resolver.unbound(&tracks, &known);
        assert_eq!(unbound.len(), 1);
        assert_eq!(unbound[0].id, 2);

        // Binding to an identity no longer cached counts as unbound
        assert_eq!(resolver.unbound(&tracks, &[]).len(), 2);
    }
}
