pub mod extract;
pub mod state;
pub mod tsv;

pub use extract::{extract_from_raw, extract_game};
pub use state::{
    read_game_file, state_map_from_json_str, ExtractError, ExtractResult, FormatVersion, KeyPath,
    RawState, Segment, StateCache, VERSION_KEY,
};
pub use tsv::{read_tsv_file, read_tsv_str, write_tsv_file, write_tsv_string};

use serde::Serialize;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Domain types — clean model, independent of the CRG wire format
// ---------------------------------------------------------------------------

/// Fallback scoreboard colors when the dump carries none.
pub const DEFAULT_TEAM_COLORS: [&str; 2] = ["#0066cc", "#cc0000"];

/// Team slot within a game. The dump numbers teams 1 and 2; display names
/// live in [`GameMeta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Team {
    One,
    Two,
}

impl Team {
    pub const BOTH: [Team; 2] = [Team::One, Team::Two];

    pub fn number(self) -> u8 {
        match self {
            Team::One => 1,
            Team::Two => 2,
        }
    }

    pub fn index(self) -> usize {
        (self.number() - 1) as usize
    }

    pub fn from_number(n: u8) -> Option<Team> {
        match n {
            1 => Some(Team::One),
            2 => Some(Team::Two),
            _ => None,
        }
    }
}

/// Flat game-level metadata: team names, scoreboard version, game status,
/// next-jam jammers. Serialized verbatim as `# key=value` lines in the TSV
/// format, so it stays a plain string map with typed accessors on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GameMeta {
    entries: BTreeMap<String, String>,
}

impl GameMeta {
    pub const TEAM_1: &'static str = "team_1";
    pub const TEAM_2: &'static str = "team_2";
    pub const SCOREBOARD_VERSION: &'static str = "scoreboard_version";
    pub const GAME_STATUS: &'static str = "game_status";
    pub const JAM_IS_RUNNING: &'static str = "jam_is_running";
    pub const SOURCE_FILEPATH: &'static str = "source_filepath";

    pub fn new() -> GameMeta {
        GameMeta::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn team_name(&self, team: Team) -> &str {
        let key = match team {
            Team::One => Self::TEAM_1,
            Team::Two => Self::TEAM_2,
        };
        match self.get(key) {
            Some(name) => name,
            None => match team {
                Team::One => "Team 1",
                Team::Two => "Team 2",
            },
        }
    }

    pub fn jam_is_running(&self) -> bool {
        self.get(Self::JAM_IS_RUNNING) == Some("true")
    }

    /// Next-jam jammer name/number for a team, when the feed carries them.
    pub fn upcoming_jammer(&self, team: Team) -> Option<(&str, &str)> {
        let n = team.number();
        let name = self.get(&format!("team_{n}_jammer_name"))?;
        let number = self.get(&format!("team_{n}_jammer_number")).unwrap_or("");
        Some((name, number))
    }

    pub fn set_upcoming_jammer(&mut self, team: Team, name: &str, number: &str) {
        let n = team.number();
        self.set(&format!("team_{n}_jammer_name"), name);
        self.set(&format!("team_{n}_jammer_number"), number);
    }
}

/// One team's slice of a jam.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TeamJamSide {
    pub calloff: bool,
    pub injury: bool,
    /// Points this team scored in this jam.
    pub jam_score: i64,
    /// Portion of `jam_score` earned before any star pass.
    pub jammer_points: i64,
    /// Portion of `jam_score` earned by the pivot after a star pass.
    pub pivot_points: i64,
    pub lead: bool,
    pub lost: bool,
    pub no_initial: bool,
    pub star_pass: bool,
    /// Running game total as of this jam.
    pub total_score: i64,
    pub jammer_name: Option<String>,
    pub jammer_number: Option<String>,
    pub pivot_name: Option<String>,
    pub pivot_number: Option<String>,
    /// Names of skaters fielded this jam.
    pub skaters: Vec<String>,
    pub n_scoring_trips: u32,
    /// Duration of the synthetic initial pass, seconds. "Time to lead" when
    /// this team earned lead.
    pub first_scoring_pass_seconds: f64,
}

/// One row per jam: the normalized unit every report consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JamRow {
    /// Composite key `"{period}:{jam:02}"`.
    pub prd_jam: String,
    pub period: u32,
    pub number: u32,
    pub duration_seconds: f64,
    pub jam_duration_seconds: f64,
    pub jam_starttime_seconds: f64,
    pub jam_endtime_seconds: f64,
    pub walltime_start: Option<i64>,
    pub sides: [TeamJamSide; 2],
    /// Team 1's score minus team 2's; negate for team 2.
    pub net_points: i64,
    pub calloff_any: bool,
    pub team_with_lead: Option<Team>,
    pub time_to_lead: Option<f64>,
}

impl JamRow {
    pub fn side(&self, team: Team) -> &TeamJamSide {
        &self.sides[team.index()]
    }

    pub fn side_mut(&mut self, team: Team) -> &mut TeamJamSide {
        &mut self.sides[team.index()]
    }

    pub fn net_points(&self, team: Team) -> i64 {
        match team {
            Team::One => self.net_points,
            Team::Two => -self.net_points,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterSkater {
    pub id: String,
    pub name: String,
    pub number: String,
    /// Display name of the skater's team, resolved regardless of dump version.
    pub team: String,
    pub pronouns: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Penalty {
    pub skater_name: String,
    pub skater_number: String,
    pub team: String,
    pub code: String,
    /// Resolved description; empty when the dump carries no code table.
    pub name: String,
    pub time_ms: Option<i64>,
    pub period: Option<u32>,
    pub jam: Option<u32>,
    pub serving: bool,
    pub served: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamColors {
    pub team_1: String,
    pub team_2: String,
}

impl Default for TeamColors {
    fn default() -> Self {
        TeamColors {
            team_1: DEFAULT_TEAM_COLORS[0].to_string(),
            team_2: DEFAULT_TEAM_COLORS[1].to_string(),
        }
    }
}

/// Everything extracted from one scoreboard dump: the per-jam table plus the
/// roster, penalty, and color side tables, and flat game metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DerbyGame {
    pub meta: GameMeta,
    pub jams: Vec<JamRow>,
    pub roster: Vec<RosterSkater>,
    pub penalties: Vec<Penalty>,
    pub colors: TeamColors,
}

// ---------------------------------------------------------------------------
// Summary views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GameSummary {
    pub n_periods: usize,
    pub n_jams: usize,
    pub duration_minutes: f64,
    pub final_score_1: i64,
    pub final_score_2: i64,
}

/// Per-team totals across the whole game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeamTotals {
    pub team: String,
    pub calloffs: i64,
    pub injuries: i64,
    pub jam_points: i64,
    pub leads: i64,
    pub losts: i64,
    pub no_initials: i64,
    pub star_passes: i64,
    pub scoring_trips: i64,
}

/// Aggregate line for one skater who jammed (or took the star) for a team.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JammerStats {
    pub name: String,
    pub number: String,
    pub jams: usize,
    pub total_score: i64,
    pub net_points: i64,
    pub lead_count: usize,
    pub lost_count: usize,
}

impl JammerStats {
    pub fn mean_net_points(&self) -> f64 {
        if self.jams == 0 {
            0.0
        } else {
            self.net_points as f64 / self.jams as f64
        }
    }

    pub fn proportion_lead(&self) -> f64 {
        if self.jams == 0 {
            0.0
        } else {
            self.lead_count as f64 / self.jams as f64
        }
    }
}

/// One row per (jam, team): the long-format view some consumers prefer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamJamLongRow {
    pub prd_jam: String,
    pub team: String,
    pub net_points: i64,
    pub side: TeamJamSide,
}

impl DerbyGame {
    /// Gross game summary. Degrades to zeros for a game with no jams rather
    /// than failing on an empty maximum.
    pub fn game_summary(&self) -> GameSummary {
        let n_periods = {
            let mut periods: Vec<u32> =
                self.jams.iter().map(|j| j.period).filter(|&p| p > 0).collect();
            periods.sort_unstable();
            periods.dedup();
            periods.len()
        };
        let duration_minutes = self
            .jams
            .iter()
            .map(|j| j.jam_endtime_seconds)
            .fold(0.0_f64, f64::max)
            / 60.0;
        let final_score = |team: Team| {
            self.jams
                .iter()
                .map(|j| j.side(team).total_score)
                .max()
                .unwrap_or(0)
        };
        GameSummary {
            n_periods,
            n_jams: self.jams.len(),
            duration_minutes,
            final_score_1: final_score(Team::One),
            final_score_2: final_score(Team::Two),
        }
    }

    pub fn teams_summary(&self) -> [TeamTotals; 2] {
        Team::BOTH.map(|team| {
            let mut totals = TeamTotals {
                team: self.meta.team_name(team).to_string(),
                ..TeamTotals::default()
            };
            for jam in &self.jams {
                let side = jam.side(team);
                totals.calloffs += side.calloff as i64;
                totals.injuries += side.injury as i64;
                totals.jam_points += side.jam_score;
                totals.leads += side.lead as i64;
                totals.losts += side.lost as i64;
                totals.no_initials += side.no_initial as i64;
                totals.star_passes += side.star_pass as i64;
                totals.scoring_trips += side.n_scoring_trips as i64;
            }
            totals
        })
    }

    /// Per-jammer aggregates for one team, as a two-pass fold.
    ///
    /// Pass one groups jams by the primary jammer. Pass two walks star-pass
    /// jams and credits the pivot with the jam and the post-pass points,
    /// synthesizing a zero row for pivots who never jammed as primary —
    /// without this, points scored after a star pass vanish from every
    /// jammer total.
    pub fn jammer_summary(&self, team: Team) -> Vec<JammerStats> {
        let mut by_name: BTreeMap<String, JammerStats> = BTreeMap::new();

        for jam in &self.jams {
            let side = jam.side(team);
            let Some(name) = &side.jammer_name else {
                continue;
            };
            let entry = by_name.entry(name.clone()).or_insert_with(|| JammerStats {
                name: name.clone(),
                number: side.jammer_number.clone().unwrap_or_default(),
                ..JammerStats::default()
            });
            entry.jams += 1;
            entry.total_score += side.jammer_points;
            entry.net_points += jam.net_points(team);
            entry.lead_count += side.lead as usize;
            entry.lost_count += side.lost as usize;
        }

        for jam in &self.jams {
            let side = jam.side(team);
            if !side.star_pass {
                continue;
            }
            let Some(pivot) = &side.pivot_name else {
                continue;
            };
            let entry = by_name.entry(pivot.clone()).or_insert_with(|| JammerStats {
                name: pivot.clone(),
                number: side.pivot_number.clone().unwrap_or_default(),
                ..JammerStats::default()
            });
            entry.jams += 1;
            entry.total_score += side.pivot_points;
        }

        by_name.into_values().collect()
    }

    pub fn jams_long(&self) -> Vec<TeamJamLongRow> {
        let mut rows = Vec::with_capacity(self.jams.len() * 2);
        for jam in &self.jams {
            for team in Team::BOTH {
                rows.push(TeamJamLongRow {
                    prd_jam: jam.prd_jam.clone(),
                    team: self.meta.team_name(team).to_string(),
                    net_points: jam.net_points(team),
                    side: jam.side(team).clone(),
                });
            }
        }
        rows
    }

    /// Replace every skater name with a random pseudonym and team names with
    /// neutral slot labels, consistently across all tables and the metadata.
    pub fn anonymize_names(&mut self) {
        let mut names: Vec<String> = Vec::new();
        names.extend(self.roster.iter().map(|s| s.name.clone()));
        names.extend(self.penalties.iter().map(|p| p.skater_name.clone()));
        for jam in &self.jams {
            for side in &jam.sides {
                names.extend(side.jammer_name.clone());
                names.extend(side.pivot_name.clone());
                names.extend(side.skaters.iter().cloned());
            }
        }
        let name_map = build_anonymizer_map(names);
        let anon = |name: &str| name_map.get(name).cloned().unwrap_or_else(|| name.to_string());

        for skater in &mut self.roster {
            skater.name = anon(&skater.name);
        }
        for penalty in &mut self.penalties {
            penalty.skater_name = anon(&penalty.skater_name);
        }
        for jam in &mut self.jams {
            for side in &mut jam.sides {
                side.jammer_name = side.jammer_name.as_deref().map(anon);
                side.pivot_name = side.pivot_name.as_deref().map(anon);
                for skater in &mut side.skaters {
                    *skater = anon(skater);
                }
            }
        }

        let old_teams = [
            self.meta.team_name(Team::One).to_string(),
            self.meta.team_name(Team::Two).to_string(),
        ];
        for team in Team::BOTH {
            let label = format!("Team {}", team.number());
            for skater in &mut self.roster {
                if skater.team == old_teams[team.index()] {
                    skater.team = label.clone();
                }
            }
            for penalty in &mut self.penalties {
                if penalty.team == old_teams[team.index()] {
                    penalty.team = label.clone();
                }
            }
        }
        self.meta.set(GameMeta::TEAM_1, "Team 1");
        self.meta.set(GameMeta::TEAM_2, "Team 2");
    }
}

/// Map each distinct input name to a random 8-character pseudonym.
pub fn build_anonymizer_map(names: impl IntoIterator<Item = String>) -> BTreeMap<String, String> {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let mut map = BTreeMap::new();
    for name in names {
        map.entry(name).or_insert_with(|| {
            (0..8)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect()
        });
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jam(prd_jam: &str, period: u32, number: u32) -> JamRow {
        JamRow {
            prd_jam: prd_jam.to_string(),
            period,
            number,
            ..JamRow::default()
        }
    }

    fn side(jammer: Option<&str>, points: i64, lead: bool) -> TeamJamSide {
        TeamJamSide {
            jammer_name: jammer.map(str::to_string),
            jam_score: points,
            jammer_points: points,
            lead,
            ..TeamJamSide::default()
        }
    }

    #[test]
    fn game_summary_is_zero_safe_on_empty_game() {
        let game = DerbyGame::default();
        let summary = game.game_summary();
        assert_eq!(summary.n_jams, 0);
        assert_eq!(summary.n_periods, 0);
        assert_eq!(summary.final_score_1, 0);
        assert_eq!(summary.duration_minutes, 0.0);
    }

    #[test]
    fn game_summary_counts_periods_and_scores() {
        let mut game = DerbyGame::default();
        let mut j1 = jam("1:01", 1, 1);
        j1.side_mut(Team::One).total_score = 4;
        j1.side_mut(Team::Two).total_score = 0;
        j1.jam_endtime_seconds = 120.0;
        let mut j2 = jam("2:01", 2, 1);
        j2.side_mut(Team::One).total_score = 9;
        j2.side_mut(Team::Two).total_score = 8;
        j2.jam_endtime_seconds = 1800.0;
        game.jams = vec![j1, j2];

        let summary = game.game_summary();
        assert_eq!(summary.n_periods, 2);
        assert_eq!(summary.n_jams, 2);
        assert_eq!(summary.final_score_1, 9);
        assert_eq!(summary.final_score_2, 8);
        assert_eq!(summary.duration_minutes, 30.0);
    }

    #[test]
    fn jammer_summary_groups_primary_jammers() {
        let mut game = DerbyGame::default();
        for (i, (jammer, pts, lead)) in
            [("Ada", 4, true), ("Grace", 0, false), ("Ada", 8, true)].into_iter().enumerate()
        {
            let mut j = jam(&format!("1:{:02}", i + 1), 1, (i + 1) as u32);
            j.sides[0] = side(Some(jammer), pts, lead);
            j.net_points = pts;
            game.jams.push(j);
        }

        let stats = game.jammer_summary(Team::One);
        assert_eq!(stats.len(), 2);
        let ada = stats.iter().find(|s| s.name == "Ada").unwrap();
        assert_eq!(ada.jams, 2);
        assert_eq!(ada.total_score, 12);
        assert_eq!(ada.lead_count, 2);
        assert_eq!(ada.proportion_lead(), 1.0);
        assert_eq!(ada.mean_net_points(), 6.0);
    }

    #[test]
    fn star_pass_only_pivot_gets_synthesized_jammer_row() {
        let mut game = DerbyGame::default();
        let mut j = jam("1:01", 1, 1);
        j.sides[0] = TeamJamSide {
            jammer_name: Some("Ada".into()),
            star_pass: true,
            jam_score: 7,
            jammer_points: 3,
            pivot_points: 4,
            pivot_name: Some("Hedy".into()),
            pivot_number: Some("42".into()),
            ..TeamJamSide::default()
        };
        game.jams.push(j);

        let stats = game.jammer_summary(Team::One);
        let hedy = stats.iter().find(|s| s.name == "Hedy").unwrap();
        assert_eq!(hedy.jams, 1);
        assert_eq!(hedy.total_score, 4);
        assert_eq!(hedy.number, "42");
        let ada = stats.iter().find(|s| s.name == "Ada").unwrap();
        assert_eq!(ada.total_score, 3);
    }

    #[test]
    fn jams_long_has_one_row_per_jam_and_team() {
        let mut game = DerbyGame::default();
        game.meta.set(GameMeta::TEAM_1, "Reds");
        game.meta.set(GameMeta::TEAM_2, "Blues");
        let mut j = jam("1:01", 1, 1);
        j.net_points = 3;
        game.jams.push(j);

        let long = game.jams_long();
        assert_eq!(long.len(), 2);
        assert_eq!(long[0].team, "Reds");
        assert_eq!(long[0].net_points, 3);
        assert_eq!(long[1].team, "Blues");
        assert_eq!(long[1].net_points, -3);
    }

    #[test]
    fn anonymize_replaces_names_consistently() {
        let mut game = DerbyGame::default();
        game.meta.set(GameMeta::TEAM_1, "Reds");
        game.meta.set(GameMeta::TEAM_2, "Blues");
        game.roster.push(RosterSkater {
            id: "s1".into(),
            name: "Ada".into(),
            number: "1".into(),
            team: "Reds".into(),
            pronouns: None,
        });
        game.penalties.push(Penalty {
            skater_name: "Ada".into(),
            team: "Reds".into(),
            code: "B".into(),
            ..Penalty::default()
        });
        let mut j = jam("1:01", 1, 1);
        j.sides[0].jammer_name = Some("Ada".into());
        j.sides[0].skaters = vec!["Ada".into()];
        game.jams.push(j);

        game.anonymize_names();

        let anon = game.roster[0].name.clone();
        assert_ne!(anon, "Ada");
        assert_eq!(anon.len(), 8);
        assert_eq!(game.penalties[0].skater_name, anon);
        assert_eq!(game.jams[0].sides[0].jammer_name.as_deref(), Some(anon.as_str()));
        assert_eq!(game.jams[0].sides[0].skaters[0], anon);
        assert_eq!(game.meta.team_name(Team::One), "Team 1");
        assert_eq!(game.roster[0].team, "Team 1");
    }

    #[test]
    fn upcoming_jammer_round_trips_through_meta() {
        let mut meta = GameMeta::new();
        assert!(meta.upcoming_jammer(Team::One).is_none());
        meta.set_upcoming_jammer(Team::Two, "Hedy", "42");
        assert_eq!(meta.upcoming_jammer(Team::Two), Some(("Hedy", "42")));
    }
}
