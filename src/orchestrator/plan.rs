//! Planning-phase payloads and how they are mapped onto destinations.
//!
//! The service names instruments loosely ("Violins 1", "solo cello"), so
//! every plan entry is matched to a destination by an explicit score; the
//! highest score wins and ties keep the earlier destination.

use serde::{Deserialize, Serialize};

use crate::music::{QN_EPSILON, TimeSignature};
use crate::tempo::TempoPoint;
use crate::util::normalize_name;

pub const UNKNOWN_ROLE: &str = "unknown";

/// One role entry in a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    #[serde(default)]
    pub instrument: String,
    /// 1-based destination position, when the service echoes it back
    #[serde(default)]
    pub instrument_index: Option<usize>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMapEntry {
    /// 1-based bar
    pub bar: u32,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub time_sig: Option<String>,
}

/// Body returned by `/plan` and `/arrange_plan`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default, alias = "assignments")]
    pub role_guidance: Vec<RoleAssignment>,
    /// Instrument names in the order they should be generated
    #[serde(default)]
    pub generation_order: Vec<String>,
    #[serde(default)]
    pub plan_summary: String,
    #[serde(default)]
    pub initial_bpm: Option<f64>,
    #[serde(default)]
    pub time_sig: Option<String>,
    #[serde(default)]
    pub tempo_map: Vec<TempoMapEntry>,
}

impl PlanResponse {
    pub fn has_tempo(&self) -> bool {
        self.initial_bpm.is_some() || self.time_sig.is_some() || !self.tempo_map.is_empty()
    }

    /// Window-relative tempo points described by the plan.
    ///
    /// Bars are counted in the meter the plan has in effect at each point:
    /// its own `time_sig` and map changes, falling back to `session_sig`.
    pub fn tempo_points(&self, session_sig: TimeSignature) -> Vec<TempoPoint> {
        let mut points = Vec::new();
        let initial_sig: Option<TimeSignature> =
            self.time_sig.as_deref().and_then(|s| s.parse().ok());
        if self.initial_bpm.is_some() || initial_sig.is_some() {
            points.push(TempoPoint {
                time_q: 0.0,
                bpm: self.initial_bpm,
                time_sig: initial_sig,
                linear: false,
            });
        }

        let mut entries: Vec<&TempoMapEntry> = self.tempo_map.iter().collect();
        entries.sort_by_key(|e| e.bar);
        // Start of the current meter, as (bar, time_q)
        let mut meter = initial_sig.unwrap_or(session_sig);
        let mut meter_start = (1u32, 0.0);
        for entry in entries {
            let time_sig: Option<TimeSignature> =
                entry.time_sig.as_deref().and_then(|s| s.parse().ok());
            if entry.bpm.is_none() && time_sig.is_none() {
                continue;
            }
            let bar = entry.bar.max(1);
            let time_q =
                meter_start.1 + bar.saturating_sub(meter_start.0) as f64 * meter.quarters_per_bar();
            if let Some(sig) = time_sig {
                meter = sig;
                meter_start = (bar, time_q);
            }
            // Bar 1 of the map overrides the initial values
            if let Some(first) = points.first_mut()
                && (first.time_q - time_q).abs() < QN_EPSILON
            {
                first.bpm = entry.bpm.or(first.bpm);
                first.time_sig = time_sig.or(first.time_sig);
                continue;
            }
            points.push(TempoPoint {
                time_q,
                bpm: entry.bpm,
                time_sig,
                linear: false,
            });
        }
        points
    }
}

/// What the matcher knows about a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTarget {
    pub track_name: String,
    pub profile_name: String,
}

/// How well a plan's instrument label fits a destination.
///
/// 5: the entry echoes the destination's 1-based position;
/// 4: the label contains the track name;
/// 3: the track name contains the label;
/// 2: profile name and label contain one another;
/// 1: first words agree; 0: no match.
pub fn match_score(label: &str, index: Option<usize>, position: usize, target: &PlanTarget) -> u8 {
    if index == Some(position) {
        return 5;
    }
    let label = normalize_name(label);
    if label.is_empty() {
        return 0;
    }
    let track = normalize_name(&target.track_name);
    let profile = normalize_name(&target.profile_name);

    if !track.is_empty() && label.contains(&track) {
        return 4;
    }
    if !track.is_empty() && track.contains(&label) {
        return 3;
    }
    if !profile.is_empty() && (label.contains(&profile) || profile.contains(&label)) {
        return 2;
    }
    let first = |s: &str| s.split_whitespace().next().map(str::to_string);
    match (first(&label), first(&track)) {
        (Some(a), Some(b)) if a == b => 1,
        _ => 0,
    }
}

/// Best still-unclaimed destination for a label. Ties keep the earlier one.
fn best_match(
    label: &str,
    index: Option<usize>,
    targets: &[PlanTarget],
    claimed: &[bool],
) -> Option<usize> {
    let mut best: Option<(u8, usize)> = None;
    for (i, target) in targets.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let score = match_score(label, index, i + 1, target);
        if score > 0 && best.is_none_or(|(s, _)| score > s) {
            best = Some((score, i));
        }
    }
    best.map(|(_, i)| i)
}

/// A destination's slot in the planned order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSlot {
    /// Index into the original destination list
    pub target: usize,
    pub role: String,
    pub guidance: Option<String>,
}

/// Order destinations and give them roles.
///
/// The order follows `generation_order` when the plan has one, otherwise
/// the order of the role entries. Destinations nothing matched are appended
/// in their original order with role `unknown`.
pub fn assign_plan(targets: &[PlanTarget], plan: &PlanResponse) -> Vec<PlannedSlot> {
    // Roles first, each entry claiming one destination
    let mut roles: Vec<Option<&RoleAssignment>> = vec![None; targets.len()];
    let mut claimed = vec![false; targets.len()];
    let mut role_order = Vec::new();
    for entry in &plan.role_guidance {
        if let Some(i) = best_match(&entry.instrument, entry.instrument_index, targets, &claimed) {
            claimed[i] = true;
            roles[i] = Some(entry);
            role_order.push(i);
        }
    }

    let mut order = if plan.generation_order.is_empty() {
        role_order
    } else {
        let mut taken = vec![false; targets.len()];
        let mut order = Vec::new();
        for name in &plan.generation_order {
            if let Some(i) = best_match(name, None, targets, &taken) {
                taken[i] = true;
                order.push(i);
            }
        }
        order
    };
    for i in 0..targets.len() {
        if !order.contains(&i) {
            order.push(i);
        }
    }

    order
        .into_iter()
        .map(|i| PlannedSlot {
            target: i,
            role: roles[i]
                .map(|r| r.role.trim())
                .filter(|r| !r.is_empty())
                .unwrap_or(UNKNOWN_ROLE)
                .to_string(),
            guidance: roles[i].and_then(|r| r.guidance.clone()),
        })
        .collect()
}
