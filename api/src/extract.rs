//! Wire → domain mapping: turn the flattened scoreboard state into the
//! normalized per-jam table and its side tables.
//!
//! The dump is schemaless: which fields exist per jam is inferred by counting
//! key occurrences against the total jam count, exactly as the scoreboard
//! writes them. The quirks handled here (duplicate jam-zero row, v4/v5 team
//! naming, apostrophe-stripped team names, variable-cardinality scoring
//! trips) are all load-bearing.

use crate::state::{
    as_bool, as_f64, as_i64, as_string, ExtractError, ExtractResult, FormatVersion, RawState,
    StateEntry,
};
use crate::{
    DerbyGame, GameMeta, JamRow, Penalty, RosterSkater, Team, TeamColors, TeamJamSide,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// The placeholder row the scoreboard records for an empty 0th jam in an
/// empty 0th period. Always dropped.
const ZERO_JAM: &str = "0:00";

/// Extract a full [`DerbyGame`] from a flat state map.
pub fn extract_game(state: BTreeMap<String, Value>) -> ExtractResult<DerbyGame> {
    let raw = RawState::from_state_map(state)?;
    extract_from_raw(&raw)
}

/// Extract a full [`DerbyGame`] from an already-normalized raw state.
pub fn extract_from_raw(raw: &RawState) -> ExtractResult<DerbyGame> {
    let meta = extract_meta(raw);
    let roster = extract_roster(raw, &meta);
    let jams = extract_jams(raw, &roster)?;
    let penalties = extract_penalties(raw, &roster);
    let colors = extract_team_colors(raw, &meta);
    Ok(DerbyGame { meta, jams, roster, penalties, colors })
}

/// Strip apostrophes from a team name. The scoreboard drops them in roster
/// keys but not elsewhere; every comparison and lookup must go through this
/// or team resolution silently fails.
pub fn cleanup_team_name(name: &str) -> String {
    name.replace('\'', "")
}

// ---------------------------------------------------------------------------
// Game metadata
// ---------------------------------------------------------------------------

fn extract_meta(raw: &RawState) -> GameMeta {
    let mut meta = GameMeta::new();
    for team in Team::BOTH {
        let n = team.number();
        let name = raw
            .get_str(&format!("ScoreBoard.Team({n}).Name"))
            .map(cleanup_team_name)
            .unwrap_or_else(|| format!("Team {n}"));
        meta.set(if n == 1 { GameMeta::TEAM_1 } else { GameMeta::TEAM_2 }, name);

        // Next-jam jammer slots: present only on live v5 feeds.
        if let Some(jammer) = raw.get_str(&format!("ScoreBoard.Team({n}).Position(Jammer).Name")) {
            let number = raw
                .get_str(&format!("ScoreBoard.Team({n}).Position(Jammer).RosterNumber"))
                .unwrap_or("");
            meta.set_upcoming_jammer(team, jammer, number);
        }
    }
    meta.set(GameMeta::SCOREBOARD_VERSION, raw.version_string());
    if let Some(status) = raw.get_str("ScoreBoard.State") {
        meta.set(GameMeta::GAME_STATUS, status);
    }
    if let Some(running) = raw.get("ScoreBoard.Clock(Jam).Running").and_then(as_bool) {
        meta.set(GameMeta::JAM_IS_RUNNING, running.to_string());
    }
    meta
}

// ---------------------------------------------------------------------------
// Jam table
// ---------------------------------------------------------------------------

struct JamEntry<'a> {
    prd_jam: String,
    entry: &'a StateEntry,
}

/// Decide whether a field at jam (or team-jam) depth is a one-per-jam
/// scalar. The dump schema is undocumented, so occurrence counting is the
/// inference; kept behind this seam so an allow/deny list can tighten it
/// without touching the pipeline.
fn is_per_jam_scalar_field(_field: &str, occurrences: usize, total_jams: usize) -> bool {
    occurrences == total_jams
}

fn prd_jam_key(period: u32, jam: u32) -> String {
    format!("{period}:{jam:02}")
}

/// Collect every key under `Period(p).Jam(j)`, tagged with its composite
/// jam key. Non-numeric period or jam ids are bookkeeping keys, not jams.
fn collect_jam_entries(raw: &RawState) -> Vec<JamEntry<'_>> {
    let mut jam_entries = Vec::new();
    for entry in raw.entries() {
        let Some(Ok(period)) = entry.path.entity(1, "Period").map(str::parse::<u32>) else {
            continue;
        };
        let Some(Ok(jam)) = entry.path.entity(2, "Jam").map(str::parse::<u32>) else {
            continue;
        };
        if entry.path.len() < 4 {
            continue;
        }
        jam_entries.push(JamEntry { prd_jam: prd_jam_key(period, jam), entry });
    }
    jam_entries
}

fn extract_jams(raw: &RawState, roster: &[RosterSkater]) -> ExtractResult<Vec<JamRow>> {
    let jam_entries = collect_jam_entries(raw);

    // Total distinct jams, jam zero included: the yardstick for the
    // one-per-jam occurrence heuristic on both the jam and team-jam levels.
    let total_jams = jam_entries
        .iter()
        .map(|je| je.prd_jam.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    log::debug!("found {total_jams} distinct jams ({} jam keys)", jam_entries.len());
    if total_jams == 0 {
        return Ok(Vec::new());
    }

    let base = pivot_simple_jam_fields(&jam_entries, total_jams);
    let team_sides = [
        build_team_jam_sides(&jam_entries, Team::One, total_jams, roster)?,
        build_team_jam_sides(&jam_entries, Team::Two, total_jams, roster)?,
    ];

    let mut rows = Vec::with_capacity(base.len());
    for (prd_jam, fields) in base {
        // Inner-join semantics: a jam missing either team's block is never
        // emitted half-augmented.
        let Some(side_1) = team_sides[0].get(&prd_jam) else {
            log::warn!("jam {prd_jam}: no team 1 block, dropping row");
            continue;
        };
        let Some(side_2) = team_sides[1].get(&prd_jam) else {
            log::warn!("jam {prd_jam}: no team 2 block, dropping row");
            continue;
        };

        let field_f64 = |name: &str| fields.get(name).copied().and_then(as_f64).unwrap_or(0.0);
        let field_u32 =
            |name: &str| fields.get(name).copied().and_then(as_i64).unwrap_or(0) as u32;

        let clock_start_ms = field_f64("PeriodClockElapsedStart");
        let clock_end_ms = field_f64("PeriodClockElapsedEnd");

        let mut row = JamRow {
            period: field_u32("PeriodNumber"),
            number: field_u32("Number"),
            duration_seconds: field_f64("Duration") / 1000.0,
            jam_duration_seconds: (clock_end_ms - clock_start_ms) / 1000.0,
            jam_starttime_seconds: clock_start_ms / 1000.0,
            jam_endtime_seconds: clock_end_ms / 1000.0,
            walltime_start: fields.get("WalltimeStart").copied().and_then(as_i64),
            sides: [side_1.clone(), side_2.clone()],
            prd_jam,
            ..JamRow::default()
        };
        compute_derived(&mut row);
        rows.push(row);
    }
    log::debug!("jam table rows: {}", rows.len());
    Ok(rows)
}

/// Pivot the one-per-jam scalar fields into `prd_jam → field → value`, with
/// the `0:00` placeholder dropped.
fn pivot_simple_jam_fields<'a>(
    jam_entries: &[JamEntry<'a>],
    total_jams: usize,
) -> BTreeMap<String, BTreeMap<&'a str, &'a Value>> {
    let mut field_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for je in jam_entries {
        if let Some(field) = je.entry.path.chunk(3) {
            *field_counts.entry(field).or_default() += 1;
        }
    }

    let mut pivot: BTreeMap<String, BTreeMap<&str, &Value>> = BTreeMap::new();
    for je in jam_entries {
        let Some(field) = je.entry.path.chunk(3) else {
            continue;
        };
        if je.entry.path.len() != 4 {
            continue;
        }
        if !is_per_jam_scalar_field(field, field_counts[field], total_jams) {
            continue;
        }
        pivot
            .entry(je.prd_jam.clone())
            .or_default()
            .insert(field, &je.entry.value);
    }
    pivot.remove(ZERO_JAM);
    pivot
}

// ---------------------------------------------------------------------------
// Team-jam table
// ---------------------------------------------------------------------------

struct TripSummary {
    n_scoring_trips: u32,
    first_pass_seconds: f64,
    pivot_points: i64,
}

fn build_team_jam_sides(
    jam_entries: &[JamEntry<'_>],
    team: Team,
    total_jams: usize,
    roster: &[RosterSkater],
) -> ExtractResult<BTreeMap<String, TeamJamSide>> {
    let team_prefix = team.number().to_string();
    let team_entries: Vec<&JamEntry<'_>> = jam_entries
        .iter()
        .filter(|je| {
            je.entry
                .path
                .entity(3, "TeamJam")
                .is_some_and(|id| id.starts_with(&team_prefix))
                && je.entry.path.len() >= 5
        })
        .collect();
    log::debug!("team {} jam keys: {}", team.number(), team_entries.len());

    // One-per-jam fields at team-jam depth, same occurrence heuristic.
    // ScoringTrip entries can coincidentally occur once per jam; they are
    // variable-cardinality and always handled by the trip aggregator.
    let mut field_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for je in &team_entries {
        if let Some(field) = je.entry.path.chunk(4) {
            *field_counts.entry(field).or_default() += 1;
        }
    }
    let mut pivot: BTreeMap<String, BTreeMap<&str, &Value>> = BTreeMap::new();
    for je in &team_entries {
        let Some(field) = je.entry.path.chunk(4) else {
            continue;
        };
        if je.entry.path.len() != 5
            || field.contains("ScoringTrip")
            || !is_per_jam_scalar_field(field, field_counts[field], total_jams)
        {
            continue;
        }
        pivot
            .entry(je.prd_jam.clone())
            .or_default()
            .insert(field, &je.entry.value);
    }

    let jammer_ids = collect_fielded_skater(&team_entries, "Jammer");
    let pivot_ids = collect_fielded_skater(&team_entries, "Pivot");
    let skater_lists = collect_jam_skaters(&team_entries, roster);
    let trips = collect_scoring_trips(&team_entries, team)?;

    let find_skater = |id: &str| roster.iter().find(|s| s.id == id);

    let mut sides = BTreeMap::new();
    for (prd_jam, fields) in pivot {
        let flag = |name: &str| fields.get(name).and_then(|v| as_bool(v)).unwrap_or(false);
        let number = |name: &str| fields.get(name).and_then(|v| as_i64(v)).unwrap_or(0);

        let mut side = TeamJamSide {
            calloff: flag("Calloff"),
            injury: flag("Injury"),
            jam_score: number("JamScore"),
            lead: flag("Lead"),
            lost: flag("Lost"),
            no_initial: flag("NoInitial"),
            star_pass: flag("StarPass"),
            total_score: number("TotalScore"),
            skaters: skater_lists.get(&prd_jam).cloned().unwrap_or_default(),
            ..TeamJamSide::default()
        };

        // Left joins: an id with no roster match leaves name/number empty
        // rather than dropping the jam.
        if let Some(skater) = jammer_ids.get(&prd_jam).and_then(|id| find_skater(id)) {
            side.jammer_name = Some(skater.name.clone());
            side.jammer_number = Some(skater.number.clone());
        }
        if let Some(skater) = pivot_ids.get(&prd_jam).and_then(|id| find_skater(id)) {
            side.pivot_name = Some(skater.name.clone());
            side.pivot_number = Some(skater.number.clone());
        }

        // Every started jam carries the synthetic initial trip; only the
        // 0:00 placeholder may lack one.
        match trips.get(&prd_jam) {
            Some(trip) => {
                side.n_scoring_trips = trip.n_scoring_trips;
                side.first_scoring_pass_seconds = trip.first_pass_seconds;
                side.pivot_points = if side.star_pass { trip.pivot_points } else { 0 };
            }
            None if prd_jam == ZERO_JAM => {}
            None => {
                return Err(ExtractError::MissingFirstTrip {
                    prd_jam,
                    team: team.number(),
                });
            }
        }
        side.jammer_points = side.jam_score - side.pivot_points;

        sides.insert(prd_jam, side);
    }
    Ok(sides)
}

/// Map `prd_jam` to the skater id fielded in the given position.
fn collect_fielded_skater(
    team_entries: &[&JamEntry<'_>],
    position: &str,
) -> BTreeMap<String, String> {
    let suffix = format!("Fielding({position}).Skater");
    team_entries
        .iter()
        .filter(|je| je.entry.key.ends_with(&suffix))
        .filter_map(|je| as_string(&je.entry.value).map(|id| (je.prd_jam.clone(), id)))
        .collect()
}

/// Names of every skater fielded per jam, via roster lookup. Ids without a
/// roster entry are skipped, matching the roster-join the report tables use.
fn collect_jam_skaters(
    team_entries: &[&JamEntry<'_>],
    roster: &[RosterSkater],
) -> BTreeMap<String, Vec<String>> {
    let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for je in team_entries {
        let is_fielding_skater = je.entry.path.segment(4).is_some_and(|s| s.name() == "Fielding")
            && je.entry.path.chunk(5) == Some("Skater");
        if !is_fielding_skater {
            continue;
        }
        let Some(id) = as_string(&je.entry.value) else {
            continue;
        };
        if let Some(skater) = roster.iter().find(|s| s.id == id) {
            lists.entry(je.prd_jam.clone()).or_default().push(skater.name.clone());
        }
    }
    for names in lists.values_mut() {
        names.sort();
    }
    lists
}

/// Per-jam scoring trip summary: trip count, the synthetic initial pass
/// duration, and post-star-pass points.
fn collect_scoring_trips(
    team_entries: &[&JamEntry<'_>],
    team: Team,
) -> ExtractResult<BTreeMap<String, TripSummary>> {
    struct TripAccum {
        max_trip: u32,
        first_duration_ms: Option<f64>,
        // trip index → (score, after star pass)
        scores: BTreeMap<u32, (i64, bool)>,
    }

    let mut per_jam: BTreeMap<String, TripAccum> = BTreeMap::new();
    for je in team_entries {
        let Some(trip_id) = je.entry.path.entity(4, "ScoringTrip") else {
            continue;
        };
        let Ok(trip_number) = trip_id.parse::<u32>() else {
            continue;
        };
        let accum = per_jam.entry(je.prd_jam.clone()).or_insert_with(|| TripAccum {
            max_trip: 0,
            first_duration_ms: None,
            scores: BTreeMap::new(),
        });
        accum.max_trip = accum.max_trip.max(trip_number);
        match je.entry.path.chunk(5) {
            Some("Duration") if trip_number == 1 => {
                accum.first_duration_ms = as_f64(&je.entry.value);
            }
            Some("Score") => {
                let score = as_i64(&je.entry.value).unwrap_or(0);
                accum.scores.entry(trip_number).or_insert((0, false)).0 = score;
            }
            Some("AfterSP") => {
                let after = as_bool(&je.entry.value).unwrap_or(false);
                accum.scores.entry(trip_number).or_insert((0, false)).1 = after;
            }
            _ => {}
        }
    }

    let mut summaries = BTreeMap::new();
    for (prd_jam, accum) in per_jam {
        // "Time to lead" lives in the synthetic first trip; a started jam
        // without it is structurally broken. The 0:00 placeholder never
        // started, and is dropped downstream anyway.
        let first_duration_ms = match accum.first_duration_ms {
            Some(ms) => ms,
            None if prd_jam == ZERO_JAM => continue,
            None => {
                return Err(ExtractError::MissingFirstTrip {
                    prd_jam,
                    team: team.number(),
                });
            }
        };
        let pivot_points = accum
            .scores
            .values()
            .filter(|(_, after_sp)| *after_sp)
            .map(|(score, _)| score)
            .sum();
        summaries.insert(
            prd_jam,
            TripSummary {
                n_scoring_trips: accum.max_trip,
                first_pass_seconds: first_duration_ms / 1000.0,
                pivot_points,
            },
        );
    }
    Ok(summaries)
}

// ---------------------------------------------------------------------------
// Derived fields
// ---------------------------------------------------------------------------

fn compute_derived(row: &mut JamRow) {
    let [side_1, side_2] = &row.sides;
    row.net_points = side_1.jam_score - side_2.jam_score;
    row.calloff_any = side_1.calloff || side_2.calloff;

    if side_1.lead && side_2.lead {
        // Impossible by derby rules; team 1 wins the tie, loudly.
        log::warn!("jam {}: both teams flagged Lead, crediting team 1", row.prd_jam);
    }
    row.team_with_lead = if side_1.lead {
        Some(Team::One)
    } else if side_2.lead {
        Some(Team::Two)
    } else {
        None
    };
    row.time_to_lead = row
        .team_with_lead
        .map(|team| row.side(team).first_scoring_pass_seconds);
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

fn extract_roster(raw: &RawState, meta: &GameMeta) -> Vec<RosterSkater> {
    let team_names = [
        cleanup_team_name(meta.team_name(Team::One)),
        cleanup_team_name(meta.team_name(Team::Two)),
    ];

    // skater id → (raw team id, attribute → value)
    let mut skaters: BTreeMap<String, (String, BTreeMap<String, String>)> = BTreeMap::new();
    for entry in raw.entries() {
        if entry.path.chunk(0) != Some("ScoreBoard") || entry.path.len() < 4 {
            continue;
        }
        let team_id = match raw.version() {
            FormatVersion::V5 => entry.path.entity(1, "Team"),
            // v4 dumps carry a whole library of prepared teams; only the
            // two playing in this game belong on the roster.
            FormatVersion::V4 => entry.path.entity(1, "PreparedTeam").filter(|id| {
                let cleaned = cleanup_team_name(id);
                cleaned == team_names[0] || cleaned == team_names[1]
            }),
        };
        let (Some(team_id), Some(skater_id)) = (team_id, entry.path.entity(2, "Skater")) else {
            continue;
        };
        let Some(attr) = entry.path.chunk(3) else {
            continue;
        };
        if !matches!(attr, "Id" | "Name" | "RosterNumber" | "Pronouns") {
            continue;
        }
        let Some(value) = as_string(&entry.value) else {
            continue;
        };
        let slot = skaters
            .entry(skater_id.to_string())
            .or_insert_with(|| (team_id.to_string(), BTreeMap::new()));
        slot.1.insert(attr.to_string(), value);
    }

    let mut roster: Vec<RosterSkater> = skaters
        .into_iter()
        .map(|(skater_id, (team_id, attrs))| {
            let team = match raw.version() {
                // v5 stores the slot number; translate to the display name.
                FormatVersion::V5 => match team_id.as_str() {
                    "1" => team_names[0].clone(),
                    "2" => team_names[1].clone(),
                    _ => "????".to_string(),
                },
                FormatVersion::V4 => cleanup_team_name(&team_id),
            };
            RosterSkater {
                id: attrs.get("Id").cloned().unwrap_or(skater_id),
                name: attrs.get("Name").cloned().unwrap_or_default(),
                number: attrs.get("RosterNumber").cloned().unwrap_or_default(),
                team,
                pronouns: attrs.get("Pronouns").cloned(),
            }
        })
        .collect();
    roster.sort_by(|a, b| (&a.team, &a.number, &a.name).cmp(&(&b.team, &b.number, &b.name)));
    log::debug!("roster: {} skaters", roster.len());
    roster
}

// ---------------------------------------------------------------------------
// Penalties
// ---------------------------------------------------------------------------

fn extract_penalties(raw: &RawState, roster: &[RosterSkater]) -> Vec<Penalty> {
    let code_names = build_penalty_code_map(raw);

    // (skater id, penalty index) → attribute → value
    let mut grouped: BTreeMap<(String, String), BTreeMap<String, Value>> = BTreeMap::new();
    for entry in raw.entries() {
        if entry.path.len() != 5 {
            continue;
        }
        let (Some(skater_id), Some(penalty_id)) =
            (entry.path.entity(2, "Skater"), entry.path.entity(3, "Penalty"))
        else {
            continue;
        };
        let Some(attr) = entry.path.chunk(4) else {
            continue;
        };
        grouped
            .entry((skater_id.to_string(), penalty_id.to_string()))
            .or_default()
            .insert(attr.to_string(), entry.value.clone());
    }

    let mut penalties = Vec::new();
    for ((skater_id, _), attrs) in grouped {
        let Some(code) = attrs.get("Code").and_then(as_string) else {
            continue;
        };
        // Inner join on the roster: a penalty for an unknown skater is
        // unreportable anyway.
        let Some(skater) = roster.iter().find(|s| s.id == skater_id) else {
            continue;
        };
        penalties.push(Penalty {
            skater_name: skater.name.clone(),
            skater_number: skater.number.clone(),
            team: skater.team.clone(),
            name: code_names.get(&code).cloned().unwrap_or_default(),
            code,
            time_ms: attrs.get("Time").and_then(as_i64),
            period: attrs.get("PeriodNumber").and_then(as_i64).map(|p| p as u32),
            jam: attrs.get("JamNumber").and_then(as_i64).map(|j| j as u32),
            serving: attrs.get("Serving").and_then(as_bool).unwrap_or(false),
            served: attrs.get("Served").and_then(as_bool).unwrap_or(false),
        });
    }
    penalties.sort_by(|a, b| {
        (&a.team, &a.skater_name, a.time_ms).cmp(&(&b.team, &b.skater_name, b.time_ms))
    });
    log::debug!("penalties: {} rows", penalties.len());
    penalties
}

/// The code→name table repeated verbatim in every game file. Long
/// descriptions embed alternates after a comma; keep the first clause.
fn build_penalty_code_map(raw: &RawState) -> BTreeMap<String, String> {
    let mut codes = BTreeMap::new();
    for entry in raw.entries() {
        let matches = match raw.version() {
            FormatVersion::V5 => entry.key.contains("PenaltyCode"),
            FormatVersion::V4 => entry.key.starts_with("ScoreBoard.PenaltyCodes.Code"),
        };
        if !matches {
            continue;
        }
        // The code letter sits just before the closing paren: ...Code(X).
        let mut tail = entry.key.chars().rev();
        let (Some(')'), Some(code)) = (tail.next(), tail.next()) else {
            continue;
        };
        let Some(name) = as_string(&entry.value) else {
            continue;
        };
        let first_clause = name.split(',').next().unwrap_or_default().to_string();
        codes.insert(code.to_string(), first_clause);
    }
    if codes.is_empty() {
        log::warn!("no penalty codes in dump; penalty names will be empty");
    }
    codes
}

// ---------------------------------------------------------------------------
// Team colors
// ---------------------------------------------------------------------------

fn extract_team_colors(raw: &RawState, meta: &GameMeta) -> TeamColors {
    let mut by_team: BTreeMap<String, String> = BTreeMap::new();
    for entry in raw.entries() {
        if entry.path.len() != 3 || entry.path.chunk(2) != Some("Color(scoreboard_bg)") {
            continue;
        }
        let Some(team) = entry.path.entity(1, "PreparedTeam") else {
            continue;
        };
        if let Some(color) = as_string(&entry.value) {
            by_team.insert(cleanup_team_name(team), color);
        }
    }

    // Any resolution failure falls back to the default palette.
    let mut colors = TeamColors::default();
    if let Some(c) = by_team.get(&cleanup_team_name(meta.team_name(Team::One))) {
        colors.team_1 = c.clone();
    }
    if let Some(c) = by_team.get(&cleanup_team_name(meta.team_name(Team::Two))) {
        colors.team_2 = c.clone();
    }
    colors
}
