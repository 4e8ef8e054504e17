//! Duplicate detection against the global lead set.
//!
//! Candidates run through four rules in order and the first one that fires
//! decides the outcome:
//!
//! 1. exact `place_id`
//! 2. normalized phone
//! 3. fuzzy name within the same postal-code/city block
//! 4. geo-proximity with a lower name bar, which is always sent to review
//!
//! The indices are shared by every job. Mutations are serialized per identity
//! key (place id, phone, block, geo-cell) so two tasks can never both insert
//! the same business. Changes to a stored lead additionally hold that lead's
//! own key, since two candidates can reach it through different rules.

pub mod normalize;
pub mod similarity;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::error::Result;
use crate::leads::{Lead, LeadFields, RawCandidate};
use crate::persistence::LeadStore;
use crate::types::{JobId, LeadId};

use normalize::{blocking_key, geo_cell, geo_cells_around, normalize_phone};
use similarity::{haversine_m, token_set_ratio};

/// Action taken when a rule matches. Fixed per job at submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Skip,
    Update,
    Merge,
    Flag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    PlaceId,
    Phone,
    FuzzyName,
    GeoProximity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "existing", rename_all = "snake_case")]
pub enum Classification {
    New,
    Skip(LeadId),
    Update(LeadId),
    Merge(LeadId),
    FlagReview(LeadId),
}

impl Classification {
    /// The stored lead this outcome writes to or files a review against.
    fn changes_lead(&self) -> Option<LeadId> {
        match self {
            Classification::Update(id)
            | Classification::Merge(id)
            | Classification::FlagReview(id) => Some(*id),
            Classification::New | Classification::Skip(_) => None,
        }
    }

    pub fn existing(&self) -> Option<LeadId> {
        match self {
            Classification::New => None,
            Classification::Skip(id)
            | Classification::Update(id)
            | Classification::Merge(id)
            | Classification::FlagReview(id) => Some(*id),
        }
    }
}

/// Which rule fired and the scores behind it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchEvidence {
    pub existing: LeadId,
    pub rule: MatchRule,
    pub name_similarity: Option<f64>,
    pub address_similarity: Option<f64>,
    pub distance_m: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub classification: Classification,
    pub evidence: Option<MatchEvidence>,
}

/// A candidate parked for manual review instead of being stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: Uuid,
    pub job_id: JobId,
    pub existing: LeadId,
    pub candidate: RawCandidate,
    pub rule: MatchRule,
    pub name_similarity: Option<f64>,
    pub address_similarity: Option<f64>,
    pub distance_m: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Result of committing one candidate.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub decision: DedupDecision,
    /// The inserted or modified lead. `None` for skips and reviews.
    pub lead: Option<Lead>,
    pub review: Option<ReviewItem>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub leads_indexed: usize,
    pub place_ids: usize,
    pub phones: usize,
    pub blocks: usize,
    pub geo_cells: usize,
    /// Identity keys currently locked or awaited by a commit.
    pub key_locks: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub updated: u64,
    pub merged: u64,
    pub flagged: u64,
}

/// Identity signals of a stored lead, kept in memory for matching.
#[derive(Clone, Debug)]
struct LeadProfile {
    name: String,
    address: Option<String>,
    coords: Option<(f64, f64)>,
    place_id: Option<String>,
    phone: Option<String>,
    block: Option<String>,
    cell: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    skipped: AtomicU64,
    updated: AtomicU64,
    merged: AtomicU64,
    flagged: AtomicU64,
}

/// Key locks held by one commit. Entries nobody else is waiting on are
/// dropped from the table on release.
struct HeldKeys<'a> {
    table: &'a DashMap<String, Arc<Mutex<()>>>,
    guards: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            self.table
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

pub struct DedupEngine<L> {
    config: DedupConfig,
    store: Arc<L>,
    profiles: DashMap<LeadId, LeadProfile>,
    by_place: DashMap<String, LeadId>,
    by_phone: DashMap<String, LeadId>,
    by_block: DashMap<String, Vec<LeadId>>,
    by_cell: DashMap<String, Vec<LeadId>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    counters: Counters,
}

impl<L> fmt::Debug for DedupEngine<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupEngine")
            .field("leads", &self.profiles.len())
            .field("place_ids", &self.by_place.len())
            .field("phones", &self.by_phone.len())
            .finish()
    }
}

impl<L: LeadStore> DedupEngine<L> {
    pub fn new(config: DedupConfig, store: Arc<L>) -> Self {
        Self {
            config,
            store,
            profiles: DashMap::new(),
            by_place: DashMap::new(),
            by_phone: DashMap::new(),
            by_block: DashMap::new(),
            by_cell: DashMap::new(),
            key_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<L> {
        &self.store
    }

    /// Rebuilds the indices from every lead in the store.
    pub async fn hydrate(&self) -> Result<usize> {
        let leads = self.store.list_leads().await?;
        for lead in &leads {
            self.index(lead.id, self.profile(&lead.fields));
        }
        info!(target: "mapleads::dedup", leads = leads.len(), "dedup indices hydrated");
        Ok(leads.len())
    }

    fn profile(&self, fields: &LeadFields) -> LeadProfile {
        let coords = fields.coordinates();
        LeadProfile {
            name: fields.business_name.clone(),
            address: fields.address.clone().filter(|a| !a.trim().is_empty()),
            coords,
            place_id: fields.place_id().map(str::to_string),
            phone: fields
                .phone
                .as_deref()
                .and_then(|p| normalize_phone(p, &self.config)),
            block: blocking_key(fields),
            cell: coords.and_then(|(lat, lng)| geo_cell(lat, lng, self.config.geohash_precision)),
        }
    }

    fn index(&self, id: LeadId, profile: LeadProfile) {
        if let Some(place) = &profile.place_id {
            self.by_place.insert(place.clone(), id);
        }
        if let Some(phone) = &profile.phone {
            self.by_phone.insert(phone.clone(), id);
        }
        if let Some(block) = &profile.block {
            let mut ids = self.by_block.entry(block.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if let Some(cell) = &profile.cell {
            let mut ids = self.by_cell.entry(cell.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.profiles.insert(id, profile);
    }

    fn unindex(&self, id: LeadId, profile: &LeadProfile) {
        if let Some(place) = &profile.place_id {
            self.by_place.remove_if(place, |_, owner| *owner == id);
        }
        if let Some(phone) = &profile.phone {
            self.by_phone.remove_if(phone, |_, owner| *owner == id);
        }
        if let Some(block) = &profile.block
            && let Some(mut ids) = self.by_block.get_mut(block)
        {
            ids.retain(|other| *other != id);
        }
        if let Some(cell) = &profile.cell
            && let Some(mut ids) = self.by_cell.get_mut(cell)
        {
            ids.retain(|other| *other != id);
        }
    }

    fn reindex(&self, id: LeadId, fields: &LeadFields) {
        if let Some((_, old)) = self.profiles.remove(&id) {
            self.unindex(id, &old);
        }
        self.index(id, self.profile(fields));
    }

    /// Identity keys a candidate touches; locked in sorted order on commit.
    fn lock_keys(&self, profile: &LeadProfile) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        if let Some(place) = &profile.place_id {
            keys.insert(format!("place:{place}"));
        }
        if let Some(phone) = &profile.phone {
            keys.insert(format!("phone:{phone}"));
        }
        if let Some(block) = &profile.block {
            keys.insert(format!("block:{block}"));
        }
        if let Some((lat, lng)) = profile.coords {
            for cell in geo_cells_around(lat, lng, self.config.geohash_precision) {
                keys.insert(format!("cell:{cell}"));
            }
        }
        keys
    }

    async fn lock(&self, keys: BTreeSet<String>) -> HeldKeys<'_> {
        let mut held = HeldKeys {
            table: &self.key_locks,
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let lock = self.key_locks.entry(key.clone()).or_default().clone();
            held.guards.push((key, lock.lock_owned().await));
        }
        held
    }

    fn address_similarity(&self, profile: &LeadProfile, existing: &LeadProfile) -> Option<f64> {
        match (&profile.address, &existing.address) {
            (Some(a), Some(b)) => Some(token_set_ratio(a, b)),
            _ => None,
        }
    }

    fn evidence(&self, profile: &LeadProfile, existing: LeadId, rule: MatchRule) -> MatchEvidence {
        let stored = self.profiles.get(&existing).map(|p| p.value().clone());
        let (name_similarity, address_similarity, distance_m) = match stored {
            Some(stored) => (
                Some(token_set_ratio(&profile.name, &stored.name)),
                self.address_similarity(profile, &stored),
                match (profile.coords, stored.coords) {
                    (Some(a), Some(b)) => Some(haversine_m(a, b)),
                    _ => None,
                },
            ),
            None => (None, None, None),
        };
        MatchEvidence {
            existing,
            rule,
            name_similarity,
            address_similarity,
            distance_m,
        }
    }

    fn fuzzy_match(&self, profile: &LeadProfile) -> Option<MatchEvidence> {
        let block = profile.block.as_ref()?;
        let ids = self.by_block.get(block).map(|ids| ids.value().clone())?;
        let mut best: Option<(f64, LeadId)> = None;
        for id in ids {
            let Some(stored) = self.profiles.get(&id) else {
                continue;
            };
            let score = token_set_ratio(&profile.name, &stored.name);
            if score >= self.config.name_similarity_threshold
                && best.is_none_or(|(top, _)| score > top)
            {
                best = Some((score, id));
            }
        }
        best.map(|(_, id)| self.evidence(profile, id, MatchRule::FuzzyName))
    }

    fn proximity_match(&self, profile: &LeadProfile) -> Option<MatchEvidence> {
        let (lat, lng) = profile.coords?;
        let mut best: Option<(f64, LeadId)> = None;
        for cell in geo_cells_around(lat, lng, self.config.geohash_precision) {
            let Some(ids) = self.by_cell.get(&cell).map(|ids| ids.value().clone()) else {
                continue;
            };
            for id in ids {
                let Some(stored) = self.profiles.get(&id) else {
                    continue;
                };
                let Some(coords) = stored.coords else {
                    continue;
                };
                let distance = haversine_m((lat, lng), coords);
                if distance > self.config.proximity_meters {
                    continue;
                }
                if token_set_ratio(&profile.name, &stored.name)
                    < self.config.proximity_name_threshold
                {
                    continue;
                }
                if best.is_none_or(|(closest, _)| distance < closest) {
                    best = Some((distance, id));
                }
            }
        }
        best.map(|(_, id)| self.evidence(profile, id, MatchRule::GeoProximity))
    }

    fn find_match(&self, profile: &LeadProfile) -> Option<MatchEvidence> {
        if let Some(place) = &profile.place_id
            && let Some(id) = self.by_place.get(place).map(|id| *id)
        {
            return Some(self.evidence(profile, id, MatchRule::PlaceId));
        }
        if let Some(phone) = &profile.phone
            && let Some(id) = self.by_phone.get(phone).map(|id| *id)
        {
            return Some(self.evidence(profile, id, MatchRule::Phone));
        }
        self.fuzzy_match(profile)
            .or_else(|| self.proximity_match(profile))
    }

    fn decide(&self, profile: &LeadProfile, policy: DuplicatePolicy) -> DedupDecision {
        let Some(evidence) = self.find_match(profile) else {
            return DedupDecision {
                classification: Classification::New,
                evidence: None,
            };
        };
        let existing = evidence.existing;
        let classification = if evidence.rule == MatchRule::GeoProximity {
            Classification::FlagReview(existing)
        } else {
            match policy {
                DuplicatePolicy::Skip => Classification::Skip(existing),
                DuplicatePolicy::Update => Classification::Update(existing),
                DuplicatePolicy::Merge => Classification::Merge(existing),
                DuplicatePolicy::Flag => Classification::FlagReview(existing),
            }
        };
        DedupDecision {
            classification,
            evidence: Some(evidence),
        }
    }

    /// Classifies without changing anything.
    pub fn classify(&self, candidate: &RawCandidate, policy: DuplicatePolicy) -> DedupDecision {
        self.decide(&self.profile(&candidate.fields), policy)
    }

    /// Classifies and applies the outcome while holding the candidate's identity keys.
    ///
    /// Store writes happen before index updates, so a failed write leaves the
    /// engine unchanged and the commit can be retried.
    pub async fn commit(
        &self,
        job_id: JobId,
        candidate: &RawCandidate,
        policy: DuplicatePolicy,
    ) -> Result<CommitOutcome> {
        let profile = self.profile(&candidate.fields);
        let _identity = self.lock(self.lock_keys(&profile)).await;

        // The lead key is always taken last and at most one is held, so a
        // holder never waits on another commit.
        let mut decision = self.decide(&profile, policy);
        let mut lead_lock: Option<(LeadId, HeldKeys<'_>)> = None;
        while let Some(existing) = decision.classification.changes_lead() {
            if lead_lock.as_ref().is_some_and(|(held, _)| *held == existing) {
                break;
            }
            drop(lead_lock.take());
            let key = BTreeSet::from([format!("lead:{existing}")]);
            lead_lock = Some((existing, self.lock(key).await));
            // Another commit may have moved the identity while we waited.
            decision = self.decide(&profile, policy);
        }
        debug!(
            target: "mapleads::dedup",
            %job_id,
            task_id = %candidate.source_task,
            classification = ?decision.classification,
            "candidate classified"
        );

        match decision.classification {
            Classification::New => {
                let lead = Lead::from_candidate(job_id, candidate);
                self.store.upsert_lead(&lead).await?;
                self.index(lead.id, profile);
                self.counters.inserted.fetch_add(1, Ordering::Relaxed);
                Ok(CommitOutcome {
                    decision,
                    lead: Some(lead),
                    review: None,
                })
            }
            Classification::Skip(_) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                Ok(CommitOutcome {
                    decision,
                    lead: None,
                    review: None,
                })
            }
            Classification::Update(existing) | Classification::Merge(existing) => {
                let merge = matches!(decision.classification, Classification::Merge(_));
                let lead = self.apply_change(existing, candidate, merge).await?;
                let counter = if merge {
                    &self.counters.merged
                } else {
                    &self.counters.updated
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(CommitOutcome {
                    decision,
                    lead,
                    review: None,
                })
            }
            Classification::FlagReview(existing) => {
                let evidence = decision.evidence.clone();
                let review = ReviewItem {
                    id: Uuid::now_v7(),
                    job_id,
                    existing,
                    candidate: candidate.clone(),
                    rule: evidence
                        .as_ref()
                        .map_or(MatchRule::GeoProximity, |e| e.rule),
                    name_similarity: evidence.as_ref().and_then(|e| e.name_similarity),
                    address_similarity: evidence.as_ref().and_then(|e| e.address_similarity),
                    distance_m: evidence.as_ref().and_then(|e| e.distance_m),
                    created_at: Utc::now(),
                };
                self.store.add_review(&review).await?;
                self.counters.flagged.fetch_add(1, Ordering::Relaxed);
                Ok(CommitOutcome {
                    decision,
                    lead: None,
                    review: Some(review),
                })
            }
        }
    }

    async fn apply_change(
        &self,
        existing: LeadId,
        candidate: &RawCandidate,
        merge: bool,
    ) -> Result<Option<Lead>> {
        let Some(mut lead) = self.store.get_lead(existing).await? else {
            // Index points at a lead the store no longer has; drop the stale entry.
            if let Some((_, stale)) = self.profiles.remove(&existing) {
                self.unindex(existing, &stale);
            }
            return Ok(None);
        };

        // A place id added by merge must not already belong to another lead.
        let incoming_place = candidate.fields.place_id();
        let place_taken = lead.fields.place_id().is_none()
            && incoming_place
                .and_then(|place| self.by_place.get(place).map(|id| *id))
                .is_some_and(|owner| owner != existing);

        let changed = if place_taken {
            let mut fields = candidate.fields.clone();
            fields.place_id = None;
            let candidate = RawCandidate::new(candidate.source_task, fields);
            if merge {
                lead.merge_from(&candidate)
            } else {
                lead.update_from(&candidate)
            }
        } else if merge {
            lead.merge_from(candidate)
        } else {
            lead.update_from(candidate)
        };

        if changed {
            self.store.upsert_lead(&lead).await?;
            self.reindex(lead.id, &lead.fields);
        }
        Ok(Some(lead))
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            leads_indexed: self.profiles.len(),
            place_ids: self.by_place.len(),
            phones: self.by_phone.len(),
            blocks: self.by_block.len(),
            geo_cells: self.by_cell.len(),
            key_locks: self.key_locks.len(),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            updated: self.counters.updated.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            flagged: self.counters.flagged.load(Ordering::Relaxed),
        }
    }
}
