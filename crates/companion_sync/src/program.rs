//! Deterministic training program generation
//!
//! Both devices regenerate the same session collection from the same
//! `(level, frequency)` selection, so only the selection and the sessions
//! themselves travel over the link, never the generation rules. Any source of
//! nondeterminism here (randomness, clocks, hash map iteration) would break
//! cross-device consistency and surface as a generation inconsistency.

use crate::error::{SyncError, SyncResult};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

/// Number of weeks in a generated program
pub const PROGRAM_WEEKS: u8 = 12;

/// Maximum training days per week
pub const MAX_FREQUENCY: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingLevel {
    Beginner,
    Intermediate,
    Advanced,
    Elite,
}

impl TrainingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingLevel::Beginner => "beginner",
            TrainingLevel::Intermediate => "intermediate",
            TrainingLevel::Advanced => "advanced",
            TrainingLevel::Elite => "elite",
        }
    }

    fn base_reps(&self) -> u8 {
        match self {
            TrainingLevel::Beginner => 3,
            TrainingLevel::Intermediate => 4,
            TrainingLevel::Advanced => 5,
            TrainingLevel::Elite => 6,
        }
    }
}

impl fmt::Display for TrainingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingLevel {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "beginner" => Ok(TrainingLevel::Beginner),
            "intermediate" => Ok(TrainingLevel::Intermediate),
            "advanced" => Ok(TrainingLevel::Advanced),
            "elite" | "pro" => Ok(TrainingLevel::Elite),
            _ => Err(SyncError::InvalidSelection {
                reason: format!("unknown training level: {s}"),
            }),
        }
    }
}

/// A user's program choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub level: TrainingLevel,
    /// Sessions per week
    pub frequency: u8,
}

impl Selection {
    pub fn new(level: TrainingLevel, frequency: u8) -> SyncResult<Self> {
        if frequency == 0 || frequency > MAX_FREQUENCY {
            return Err(SyncError::InvalidSelection {
                reason: format!("frequency must be between 1 and {MAX_FREQUENCY}, got {frequency}"),
            });
        }
        Ok(Self { level, frequency })
    }

    pub fn compilation_id(&self) -> CompilationId {
        CompilationId::for_selection(self.level, self.frequency)
    }
}

/// Stable identifier correlating one program configuration across devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilationId(String);

impl CompilationId {
    pub fn for_selection(level: TrainingLevel, frequency: u8) -> Self {
        Self(format!("{}-{}d", level.as_str(), frequency))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompilationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintSet {
    pub distance_yards: u16,
    pub reps: u8,
    pub intensity_label: String,
}

/// One generated workout. Owned by the program generator; synchronized opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub week: u8,
    pub day: u8,
    #[serde(rename = "type")]
    pub session_type: String,
    pub focus: String,
    pub sprint_sets: Vec<SprintSet>,
    pub accessory_work: Vec<String>,
    pub notes: Option<String>,
}

impl SessionRecord {
    pub fn id_for(week: u8, day: u8) -> String {
        format!("w{week:02}d{day}")
    }

    /// Key under which the session is mirrored in the cache
    pub fn entity_key(&self) -> String {
        format!("session.{}", self.id)
    }
}

/// Pure session generation function
pub trait SessionGenerator: Send + Sync {
    fn generate(&self, level: TrainingLevel, frequency: u8, week: u8, day: u8) -> SessionRecord;
}

/// Reference sprint program generator
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramGenerator;

const DAY_TYPES: [&str; 7] = [
    "Acceleration",
    "Max Velocity",
    "Speed Endurance",
    "Acceleration",
    "Tempo",
    "Max Velocity",
    "Recovery",
];

impl ProgramGenerator {
    fn phase(week: u8) -> (&'static str, [u16; 2]) {
        match week {
            0..=4 => ("Foundation", [10, 20]),
            5..=8 => ("Development", [30, 40]),
            _ => ("Peak", [60, 80]),
        }
    }

    fn intensity(week: u8) -> &'static str {
        match week % 4 {
            1 => "Moderate 75%",
            2 => "High 85%",
            3 => "Max 95%",
            _ => "Deload 65%",
        }
    }

    fn accessories(session_type: &str) -> Vec<String> {
        let items: &[&str] = match session_type {
            "Acceleration" => &["Sled push 4x20yd", "A-skips 3x20yd"],
            "Max Velocity" => &["Wicket runs 4x", "Straight-leg bounds 3x20yd"],
            "Speed Endurance" => &["Split squats 3x8", "Core circuit"],
            "Tempo" => &["Mobility flow", "Hamstring bridges 3x12"],
            _ => &["Foam rolling", "Light stretching"],
        };
        items.iter().map(|s| (*s).to_string()).collect()
    }
}

impl SessionGenerator for ProgramGenerator {
    fn generate(&self, level: TrainingLevel, frequency: u8, week: u8, day: u8) -> SessionRecord {
        let (phase, distances) = Self::phase(week);
        // Spread low-frequency programs across the weekly pattern
        let slot = usize::from(day.saturating_sub(1)) * usize::from(MAX_FREQUENCY)
            / usize::from(frequency.max(1));
        let session_type = DAY_TYPES[slot % DAY_TYPES.len()];
        let deload = week % 4 == 0;
        let progression = week.saturating_sub(1) % 4 / 2;
        let reps = if deload {
            level.base_reps().saturating_sub(1).max(1)
        } else {
            level.base_reps() + progression
        };

        let sprint_sets = if session_type == "Recovery" {
            Vec::new()
        } else {
            distances
                .iter()
                .map(|distance| SprintSet {
                    distance_yards: *distance,
                    reps,
                    intensity_label: Self::intensity(week).to_string(),
                })
                .collect()
        };

        SessionRecord {
            id: SessionRecord::id_for(week, day),
            week,
            day,
            session_type: session_type.to_string(),
            focus: format!("{phase} {session_type}"),
            sprint_sets,
            accessory_work: Self::accessories(session_type),
            notes: deload.then(|| "Deload week: keep every rep crisp".to_string()),
        }
    }
}

/// Generate the full program for a selection, ordered by week then day
pub fn generate_program(generator: &dyn SessionGenerator, selection: Selection) -> Vec<SessionRecord> {
    (1..=PROGRAM_WEEKS)
        .flat_map(|week| (1..=selection.frequency).map(move |day| (week, day)))
        .map(|(week, day)| generator.generate(selection.level, selection.frequency, week, day))
        .collect()
}

/// Fingerprint of a generated program, exchanged to detect cross-device divergence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDigest {
    pub compilation_id: CompilationId,
    pub session_count: usize,
    pub digest: u64,
}

impl ProgramDigest {
    pub fn compute(compilation_id: CompilationId, sessions: &[SessionRecord]) -> SyncResult<Self> {
        let mut hasher = FnvHasher::default();
        for session in sessions {
            hasher.write(&serde_json::to_vec(session)?);
        }
        Ok(Self {
            compilation_id,
            session_count: sessions.len(),
            digest: hasher.finish(),
        })
    }
}
