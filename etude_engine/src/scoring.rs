//! Performance scoring. Pure and infallible: every input yields a finite
//! breakdown.

use etude_shared::{ExerciseDefinition, PlayedNoteEvent, ScoreBreakdown, SourceTable};

/// Weights of the five sub-scores in `overall`. They sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub accuracy: f64,
    pub timing: f64,
    pub completeness: f64,
    pub duration: f64,
    pub extra_notes: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { accuracy: 0.30, timing: 0.25, completeness: 0.30, duration: 0.10, extra_notes: 0.05 }
    }
}

impl ScoringWeights {
    fn total(&self) -> f64 {
        self.accuracy + self.timing + self.completeness + self.duration + self.extra_notes
    }
}

/// Credit for a matched note that carries no held duration.
const UNKNOWN_DURATION_CREDIT: f64 = 0.5;

/// One expected note paired with one played note.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteMatch {
    pub expected: usize,
    pub played: usize,
    pub offset_ms: f64,
}

/// Expected note indices in time order; ties keep authoring order.
fn time_order(exercise: &ExerciseDefinition) -> Vec<usize> {
    let mut order: Vec<usize> = (0..exercise.notes.len()).collect();
    order.sort_by(|&a, &b| exercise.notes[a].start_beat.total_cmp(&exercise.notes[b].start_beat));
    order
}

/// Greedy matching: each expected note, in time order, takes the nearest
/// unused played note of its pitch within its window. `window` returns the
/// half-width for a played note, `None` for unbounded.
fn assign(
    exercise: &ExerciseDefinition,
    played: &[PlayedNoteEvent],
    window: impl Fn(&PlayedNoteEvent) -> Option<f64>,
) -> Vec<NoteMatch> {
    let mut used = vec![false; played.len()];
    let mut matches = Vec::new();
    for expected in time_order(exercise) {
        let note = &exercise.notes[expected];
        let at = exercise.expected_time_ms(note);
        let best = played
            .iter()
            .enumerate()
            .filter(|(i, p)| !used[*i] && p.pitch == note.pitch && p.timestamp_ms.is_finite())
            .map(|(i, p)| (i, (p.timestamp_ms - at).abs(), window(p)))
            .filter(|(_, offset, limit)| limit.is_none_or(|w| *offset <= w))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        if let Some((played_idx, offset_ms, _)) = best {
            used[played_idx] = true;
            matches.push(NoteMatch { expected, played: played_idx, offset_ms });
        }
    }
    matches
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 { 0.0 } else { 100.0 * part as f64 / whole as f64 }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

pub struct ScoringEngine {
    table: SourceTable,
    weights: ScoringWeights,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(SourceTable::default())
    }
}

impl ScoringEngine {
    pub fn new(table: SourceTable) -> Self {
        Self { table, weights: ScoringWeights::default() }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        if weights.total() > 0.0 && weights.total().is_finite() {
            self.weights = weights;
        }
        self
    }

    /// Timed matches, widened per source by its tolerance multiplier.
    pub fn match_notes(&self, exercise: &ExerciseDefinition, played: &[PlayedNoteEvent]) -> Vec<NoteMatch> {
        let scoring = &exercise.scoring;
        let base = scoring.timing_tolerance_ms.max(0.0) + scoring.timing_grace_period_ms.max(0.0);
        assign(exercise, played, |p| Some(base * self.table.get(p.input_source).tolerance_multiplier))
    }

    fn timing_credit(&self, exercise: &ExerciseDefinition, played: &PlayedNoteEvent, offset_ms: f64) -> f64 {
        let mult = self.table.get(played.input_source).tolerance_multiplier;
        let tolerance = exercise.scoring.timing_tolerance_ms.max(0.0) * mult;
        let grace = exercise.scoring.timing_grace_period_ms.max(0.0) * mult;
        if offset_ms <= tolerance {
            1.0
        } else if grace > 0.0 && offset_ms <= tolerance + grace {
            1.0 - (offset_ms - tolerance) / grace
        } else {
            0.0
        }
    }

    fn duration_credit(expected_ms: f64, held_ms: Option<f64>) -> f64 {
        match held_ms {
            Some(held) if held.is_finite() && expected_ms > 0.0 => {
                (1.0 - (held - expected_ms).abs() / expected_ms).clamp(0.0, 1.0)
            }
            _ => UNKNOWN_DURATION_CREDIT,
        }
    }

    pub fn score(&self, exercise: &ExerciseDefinition, played: &[PlayedNoteEvent], previous_high_score: f64) -> ScoreBreakdown {
        let notes = &exercise.notes;
        let matches = self.match_notes(exercise, played);

        let pitch_matches = assign(exercise, played, |_| None).len();
        let accuracy = percent(pitch_matches, notes.len());

        let timing = 100.0
            * mean(matches.iter().map(|m| self.timing_credit(exercise, &played[m.played], m.offset_ms)));

        let required = exercise.required_note_count();
        let completeness = if required > 0 {
            let hit = matches.iter().filter(|m| !notes[m.expected].optional).count();
            percent(hit, required)
        } else {
            percent(matches.len(), notes.len())
        };

        let duration = 100.0
            * mean(matches.iter().map(|m| {
                let expected_ms = exercise.expected_duration_ms(&notes[m.expected]);
                Self::duration_credit(expected_ms, played[m.played].duration_ms)
            }));

        let extra_count = played.len() - matches.len();
        let extra_notes = (100.0 - percent(extra_count, notes.len().max(1))).max(0.0);

        let w = &self.weights;
        let weighted = (accuracy * w.accuracy
            + timing * w.timing
            + completeness * w.completeness
            + duration * w.duration
            + extra_notes * w.extra_notes)
            / w.total();
        let overall = if weighted.is_finite() { (weighted.clamp(0.0, 100.0) * 10.0).round() / 10.0 } else { 0.0 };

        let passing = exercise.scoring.passing_score;
        let is_passed = overall >= passing;
        let stars = if is_passed {
            exercise.scoring.star_thresholds.iter().filter(|t| **t <= overall).count() as u8
        } else {
            0
        };

        ScoreBreakdown {
            accuracy,
            timing,
            completeness,
            duration,
            extra_notes,
            overall,
            stars,
            is_passed,
            is_new_high_score: overall > previous_high_score,
            matched_count: matches.len(),
            missed_count: notes.len() - matches.len(),
            extra_count,
        }
    }
}

/// Score with the built-in source table and weights.
pub fn score(exercise: &ExerciseDefinition, played: &[PlayedNoteEvent], previous_high_score: f64) -> ScoreBreakdown {
    ScoringEngine::default().score(exercise, played, previous_high_score)
}
