//! Tab-separated export of the per-jam table.
//!
//! The file is `# key=value` metadata comment lines followed by a TSV header
//! and one line per jam. Writing then reading reproduces the metadata exactly
//! and the jam rows up to string/number normalization; the roster, penalty,
//! and color tables are not carried, by contract.

use crate::state::{ExtractError, ExtractResult};
use crate::{DerbyGame, GameMeta, JamRow, Team, TeamJamSide};
use std::fmt::Write as _;
use std::path::Path;

const JAM_COLUMNS: [&str; 8] = [
    "prd_jam",
    "period",
    "number",
    "duration_seconds",
    "jam_duration_seconds",
    "jam_starttime_seconds",
    "jam_endtime_seconds",
    "walltime_start",
];

/// Per-team columns, written once per team with a `_1` / `_2` suffix.
const SIDE_COLUMNS: [&str; 17] = [
    "calloff",
    "injury",
    "jam_score",
    "jammer_points",
    "pivot_points",
    "lead",
    "lost",
    "no_initial",
    "star_pass",
    "total_score",
    "jammer_name",
    "jammer_number",
    "pivot_name",
    "pivot_number",
    "skaters",
    "n_scoring_trips",
    "first_scoring_pass_seconds",
];

const DERIVED_COLUMNS: [&str; 4] =
    ["net_points", "calloff_any", "team_with_lead", "time_to_lead"];

fn header() -> Vec<String> {
    let mut columns: Vec<String> = JAM_COLUMNS.iter().map(|c| c.to_string()).collect();
    for team in Team::BOTH {
        let n = team.number();
        columns.extend(SIDE_COLUMNS.iter().map(|c| format!("{c}_{n}")));
    }
    columns.extend(DERIVED_COLUMNS.iter().map(|c| c.to_string()));
    columns
}

fn column_count() -> usize {
    JAM_COLUMNS.len() + 2 * SIDE_COLUMNS.len() + DERIVED_COLUMNS.len()
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub fn write_tsv_string(game: &DerbyGame) -> String {
    let mut out = String::new();
    for (key, value) in game.meta.iter() {
        let _ = writeln!(out, "# {key}={value}");
    }
    let _ = writeln!(out, "{}", header().join("\t"));
    for jam in &game.jams {
        let _ = writeln!(out, "{}", row_cells(jam).join("\t"));
    }
    out
}

pub fn write_tsv_file(game: &DerbyGame, path: &Path) -> ExtractResult<()> {
    std::fs::write(path, write_tsv_string(game))?;
    Ok(())
}

fn row_cells(jam: &JamRow) -> Vec<String> {
    let mut cells = vec![
        jam.prd_jam.clone(),
        jam.period.to_string(),
        jam.number.to_string(),
        jam.duration_seconds.to_string(),
        jam.jam_duration_seconds.to_string(),
        jam.jam_starttime_seconds.to_string(),
        jam.jam_endtime_seconds.to_string(),
        jam.walltime_start.map(|v| v.to_string()).unwrap_or_default(),
    ];
    for team in Team::BOTH {
        let side = jam.side(team);
        cells.extend([
            side.calloff.to_string(),
            side.injury.to_string(),
            side.jam_score.to_string(),
            side.jammer_points.to_string(),
            side.pivot_points.to_string(),
            side.lead.to_string(),
            side.lost.to_string(),
            side.no_initial.to_string(),
            side.star_pass.to_string(),
            side.total_score.to_string(),
            side.jammer_name.clone().unwrap_or_default(),
            side.jammer_number.clone().unwrap_or_default(),
            side.pivot_name.clone().unwrap_or_default(),
            side.pivot_number.clone().unwrap_or_default(),
            side.skaters.join(";"),
            side.n_scoring_trips.to_string(),
            side.first_scoring_pass_seconds.to_string(),
        ]);
    }
    cells.extend([
        jam.net_points.to_string(),
        jam.calloff_any.to_string(),
        jam.team_with_lead
            .map(|t| t.number().to_string())
            .unwrap_or_default(),
        jam.time_to_lead.map(|v| v.to_string()).unwrap_or_default(),
    ]);
    cells
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub fn read_tsv_file(path: &Path) -> ExtractResult<DerbyGame> {
    let text = std::fs::read_to_string(path)?;
    read_tsv_str(&text)
}

pub fn read_tsv_str(text: &str) -> ExtractResult<DerbyGame> {
    let mut meta = GameMeta::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.peek() {
        let Some(rest) = line.strip_prefix("# ") else {
            break;
        };
        if let Some((key, value)) = rest.split_once('=') {
            meta.set(key, value);
        }
        lines.next();
    }

    let header_line = lines
        .next()
        .ok_or_else(|| ExtractError::Tsv("missing header line".to_string()))?;
    let expected = header();
    if header_line.split('\t').ne(expected.iter().map(String::as_str)) {
        return Err(ExtractError::Tsv("unexpected column set".to_string()));
    }

    let mut jams = Vec::new();
    for (i, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let jam = parse_row(line)
            .map_err(|msg| ExtractError::Tsv(format!("data line {}: {msg}", i + 1)))?;
        jams.push(jam);
    }
    Ok(DerbyGame { meta, jams, ..DerbyGame::default() })
}

/// Cursor over one data line's cells, consumed strictly in column order.
struct Cells<'a> {
    iter: std::vec::IntoIter<&'a str>,
    column: usize,
}

impl<'a> Cells<'a> {
    fn next(&mut self) -> Result<&'a str, String> {
        self.column += 1;
        self.iter
            .next()
            .ok_or_else(|| format!("missing cell at column {}", self.column))
    }

    fn parse<T: std::str::FromStr>(&mut self) -> Result<T, String> {
        let cell = self.next()?;
        cell.parse()
            .map_err(|_| format!("column {}: unparseable value {:?}", self.column, cell))
    }

    fn opt<T: std::str::FromStr>(&mut self) -> Result<Option<T>, String> {
        let cell = self.next()?;
        if cell.is_empty() {
            return Ok(None);
        }
        cell.parse()
            .map(Some)
            .map_err(|_| format!("column {}: unparseable value {:?}", self.column, cell))
    }

    fn opt_string(&mut self) -> Result<Option<String>, String> {
        let cell = self.next()?;
        Ok(if cell.is_empty() { None } else { Some(cell.to_string()) })
    }
}

fn parse_row(line: &str) -> Result<JamRow, String> {
    let cells: Vec<&str> = line.split('\t').collect();
    if cells.len() != column_count() {
        return Err(format!(
            "expected {} cells, found {}",
            column_count(),
            cells.len()
        ));
    }
    let mut cells = Cells { iter: cells.into_iter(), column: 0 };

    let mut jam = JamRow {
        prd_jam: cells.next()?.to_string(),
        period: cells.parse()?,
        number: cells.parse()?,
        duration_seconds: cells.parse()?,
        jam_duration_seconds: cells.parse()?,
        jam_starttime_seconds: cells.parse()?,
        jam_endtime_seconds: cells.parse()?,
        walltime_start: cells.opt()?,
        ..JamRow::default()
    };
    for team in Team::BOTH {
        *jam.side_mut(team) = parse_side(&mut cells)?;
    }
    jam.net_points = cells.parse()?;
    jam.calloff_any = cells.parse()?;
    jam.team_with_lead = match cells.next()? {
        "" => None,
        cell => match cell.parse::<u8>().ok().and_then(Team::from_number) {
            Some(team) => Some(team),
            None => return Err(format!("bad team_with_lead value {cell:?}")),
        },
    };
    jam.time_to_lead = cells.opt()?;
    Ok(jam)
}

fn parse_side(cells: &mut Cells<'_>) -> Result<TeamJamSide, String> {
    Ok(TeamJamSide {
        calloff: cells.parse()?,
        injury: cells.parse()?,
        jam_score: cells.parse()?,
        jammer_points: cells.parse()?,
        pivot_points: cells.parse()?,
        lead: cells.parse()?,
        lost: cells.parse()?,
        no_initial: cells.parse()?,
        star_pass: cells.parse()?,
        total_score: cells.parse()?,
        jammer_name: cells.opt_string()?,
        jammer_number: cells.opt_string()?,
        pivot_name: cells.opt_string()?,
        pivot_number: cells.opt_string()?,
        skaters: {
            let cell = cells.next()?;
            if cell.is_empty() {
                Vec::new()
            } else {
                cell.split(';').map(str::to_string).collect()
            }
        },
        n_scoring_trips: cells.parse()?,
        first_scoring_pass_seconds: cells.parse()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Penalty, RosterSkater};

    fn sample_game() -> DerbyGame {
        let mut game = DerbyGame::default();
        game.meta.set(GameMeta::TEAM_1, "All Stars");
        game.meta.set(GameMeta::TEAM_2, "B Team");
        game.meta.set(GameMeta::SCOREBOARD_VERSION, "v5.0.2");

        let mut full = JamRow {
            prd_jam: "1:01".to_string(),
            period: 1,
            number: 1,
            duration_seconds: 90.0,
            jam_duration_seconds: 88.5,
            jam_starttime_seconds: 120.0,
            jam_endtime_seconds: 208.5,
            walltime_start: Some(1_700_000_000_000),
            net_points: 3,
            calloff_any: true,
            team_with_lead: Some(Team::Two),
            time_to_lead: Some(4.2),
            ..JamRow::default()
        };
        full.sides[0] = TeamJamSide {
            jam_score: 4,
            jammer_points: 4,
            total_score: 4,
            jammer_name: Some("Ada".to_string()),
            jammer_number: Some("101".to_string()),
            skaters: vec!["Ada".to_string(), "Hedy".to_string()],
            n_scoring_trips: 2,
            first_scoring_pass_seconds: 10.0,
            ..TeamJamSide::default()
        };
        full.sides[1] = TeamJamSide {
            jam_score: 1,
            jammer_points: 1,
            total_score: 1,
            lead: true,
            calloff: true,
            n_scoring_trips: 1,
            first_scoring_pass_seconds: 4.2,
            ..TeamJamSide::default()
        };

        let sparse = JamRow {
            prd_jam: "1:02".to_string(),
            period: 1,
            number: 2,
            ..JamRow::default()
        };

        game.jams = vec![full, sparse];
        game
    }

    #[test]
    fn round_trip_preserves_metadata_and_jams() {
        let game = sample_game();
        let text = write_tsv_string(&game);
        let back = read_tsv_str(&text).unwrap();
        assert_eq!(back.meta, game.meta);
        assert_eq!(back.jams, game.jams);
    }

    #[test]
    fn side_tables_are_not_carried() {
        let mut game = sample_game();
        game.roster.push(RosterSkater {
            name: "Ada".to_string(),
            ..RosterSkater::default()
        });
        game.penalties.push(Penalty::default());
        let back = read_tsv_str(&write_tsv_string(&game)).unwrap();
        assert!(back.roster.is_empty());
        assert!(back.penalties.is_empty());
    }

    #[test]
    fn empty_jam_table_round_trips() {
        let mut game = DerbyGame::default();
        game.meta.set(GameMeta::TEAM_1, "A");
        let back = read_tsv_str(&write_tsv_string(&game)).unwrap();
        assert_eq!(back.meta.team_name(Team::One), "A");
        assert!(back.jams.is_empty());
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(
            read_tsv_str("# team_1=A\n"),
            Err(ExtractError::Tsv(_))
        ));
    }

    #[test]
    fn rejects_unexpected_column_set() {
        let err = read_tsv_str("prd_jam\tperiod\n1:01\t1\n").unwrap_err();
        assert!(matches!(err, ExtractError::Tsv(_)));
    }

    #[test]
    fn rejects_short_data_line() {
        let game = sample_game();
        let mut text = write_tsv_string(&game);
        text.push_str("1:03\t1\n");
        let err = read_tsv_str(&text).unwrap_err();
        assert!(matches!(err, ExtractError::Tsv(_)));
    }

    #[test]
    fn rejects_unparseable_cell() {
        let game = sample_game();
        let text = write_tsv_string(&game).replace("88.5", "not-a-number");
        assert!(matches!(read_tsv_str(&text), Err(ExtractError::Tsv(_))));
    }
}
