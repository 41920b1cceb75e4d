//! QoE Engine Configuration
//!
//! Two layers:
//! - [`QoeConfig`]: per-game thresholds and calendar constants, read from an
//!   optional TOML file. Games without an override fall back to `[defaults]`.
//! - [`EngineSettings`]: process-level knobs (database, worker pools, loop
//!   ceiling) read from the environment.
//!
//! ```toml
//! reference_date = "2021-05-01T00:00:00Z"
//! excluded_games = ["273195", "267128"]
//!
//! [defaults]
//! qoe_band = 15
//!
//! [games."295590"]
//! latency_offset = { until = "2022-07-14T00:00:00Z", subtract = 7 }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::Sample;

pub const DEFAULT_QOE_BAND: u32 = 15;
/// Games whose OCR output is not usable for QoE
pub const DEFAULT_EXCLUDED_GAMES: [&str; 2] = ["273195", "267128"];
pub const DEFAULT_STABLE_LENGTH_MINUTES: i64 = 30;
pub const DEFAULT_STABLE_SHARE: f64 = 0.15;
pub const DEFAULT_MAX_SPIKE_PROPORTION: f64 = 0.5;
/// One week
pub const MAX_STABLE_LENGTH_MINUTES: i64 = 7 * 24 * 60;

/// Thresholds and input corrections for one game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Latency tolerance within which samples share a period
    pub qoe_band: u32,
    /// Minimum period duration to be considered stable
    pub stable_length_minutes: i64,
    /// Minimum share of accumulated points in the period's digit-length class
    pub stable_share: f64,
    /// Spike fraction at or above which a processed batch is discarded
    pub max_spike_proportion: f64,
    /// Constant bias reported by the game client before a fix date
    pub latency_offset: Option<LatencyOffset>,
    /// Windows whose samples are known to be corrupt
    pub blackouts: Vec<TimeWindow>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            qoe_band: DEFAULT_QOE_BAND,
            stable_length_minutes: DEFAULT_STABLE_LENGTH_MINUTES,
            stable_share: DEFAULT_STABLE_SHARE,
            max_spike_proportion: DEFAULT_MAX_SPIKE_PROPORTION,
            latency_offset: None,
            blackouts: Vec::new(),
        }
    }
}

impl GameConfig {
    pub fn stable_length(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stable_length_minutes)
    }

    pub fn with_qoe_band(mut self, qoe_band: u32) -> Self {
        self.qoe_band = qoe_band;
        self
    }

    pub fn with_stable_length_minutes(mut self, minutes: i64) -> Self {
        self.stable_length_minutes = minutes;
        self
    }

    pub fn with_stable_share(mut self, share: f64) -> Self {
        self.stable_share = share;
        self
    }

    pub fn with_max_spike_proportion(mut self, proportion: f64) -> Self {
        self.max_spike_proportion = proportion;
        self
    }

    /// Apply the game's known input corrections. `None` drops the sample.
    pub fn correct(&self, mut sample: Sample) -> Option<Sample> {
        if self.blackouts.iter().any(|w| w.contains(sample.timestamp)) {
            return None;
        }

        if let Some(offset) = &self.latency_offset {
            if sample.timestamp < offset.until && sample.latency > offset.subtract {
                sample.latency -= offset.subtract;
            }
        }

        Some(sample)
    }

    fn validate(&self, game: &str) -> Result<()> {
        if self.qoe_band == 0 {
            bail!("game {}: qoe_band must be positive", game);
        }
        if !(0..=MAX_STABLE_LENGTH_MINUTES).contains(&self.stable_length_minutes) {
            bail!(
                "game {}: stable_length_minutes {} outside [0, {}]",
                game,
                self.stable_length_minutes,
                MAX_STABLE_LENGTH_MINUTES
            );
        }
        if !(0.0..=1.0).contains(&self.stable_share) {
            bail!("game {}: stable_share {} outside [0, 1]", game, self.stable_share);
        }
        if !(0.0..=1.0).contains(&self.max_spike_proportion) {
            bail!(
                "game {}: max_spike_proportion {} outside [0, 1]",
                game,
                self.max_spike_proportion
            );
        }
        Ok(())
    }
}

/// Subtract `subtract` from readings taken before `until`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyOffset {
    pub until: DateTime<Utc>,
    pub subtract: u32,
}

/// Open interval `(start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    #[inline]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start < t && t < self.end
    }
}

/// Partial per-game override as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GameOverride {
    pub qoe_band: Option<u32>,
    pub stable_length_minutes: Option<i64>,
    pub stable_share: Option<f64>,
    pub max_spike_proportion: Option<f64>,
    pub latency_offset: Option<LatencyOffset>,
    pub blackouts: Option<Vec<TimeWindow>>,
}

impl GameOverride {
    fn apply(&self, base: &GameConfig) -> GameConfig {
        let mut config = base
            .clone()
            .with_qoe_band(self.qoe_band.unwrap_or(base.qoe_band))
            .with_stable_length_minutes(self.stable_length_minutes.unwrap_or(base.stable_length_minutes))
            .with_stable_share(self.stable_share.unwrap_or(base.stable_share))
            .with_max_spike_proportion(self.max_spike_proportion.unwrap_or(base.max_spike_proportion));

        if let Some(offset) = &self.latency_offset {
            config.latency_offset = Some(offset.clone());
        }
        if let Some(blackouts) = &self.blackouts {
            config.blackouts = blackouts.clone();
        }
        config
    }
}

/// Immutable per-game lookup with a single default fallback
#[derive(Debug, Clone, Default)]
pub struct GameConfigTable {
    default: GameConfig,
    games: HashMap<String, GameConfig>,
}

impl GameConfigTable {
    pub fn new(default: GameConfig) -> Self {
        Self {
            default,
            games: HashMap::new(),
        }
    }

    pub fn with_game(mut self, game_id: impl Into<String>, config: GameConfig) -> Self {
        self.games.insert(game_id.into(), config);
        self
    }

    #[inline]
    pub fn for_game(&self, game_id: &str) -> &GameConfig {
        self.games.get(game_id).unwrap_or(&self.default)
    }

    pub fn default_config(&self) -> &GameConfig {
        &self.default
    }

    pub fn overridden_games(&self) -> usize {
        self.games.len()
    }
}

/// On-disk layout of the TOML config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QoeConfigFile {
    reference_date: Option<DateTime<Utc>>,
    history_start: Option<DateTime<Utc>>,
    excluded_games: Option<Vec<String>>,
    #[serde(default)]
    defaults: GameOverride,
    #[serde(default)]
    games: HashMap<String, GameOverride>,
}

/// Resolved engine configuration
#[derive(Debug, Clone)]
pub struct QoeConfig {
    pub games: GameConfigTable,
    /// Origin of the active-day offsets
    pub reference_date: DateTime<Utc>,
    /// Earliest sample considered when no processed state exists
    pub history_start: DateTime<Utc>,
    /// Games never processed
    pub excluded_games: HashSet<String>,
}

impl Default for QoeConfig {
    fn default() -> Self {
        Self {
            games: GameConfigTable::default(),
            reference_date: midnight_utc(2021, 5, 1),
            history_start: midnight_utc(2021, 5, 24),
            excluded_games: DEFAULT_EXCLUDED_GAMES.iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl QoeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: QoeConfigFile = toml::from_str(content).context("Invalid QoE config file")?;
        let base = Self::default();

        let default = file.defaults.apply(base.games.default_config());
        default.validate("<defaults>")?;

        let mut games = GameConfigTable::new(default.clone());
        for (game_id, over) in &file.games {
            let resolved = over.apply(&default);
            resolved.validate(game_id)?;
            games = games.with_game(game_id.clone(), resolved);
        }

        Ok(Self {
            games,
            reference_date: file.reference_date.unwrap_or(base.reference_date),
            history_start: file.history_start.unwrap_or(base.history_start),
            excluded_games: file
                .excluded_games
                .map(|g| g.into_iter().collect())
                .unwrap_or(base.excluded_games),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;

        info!(
            "Loaded QoE config from {} ({} game overrides, {} excluded games)",
            path.display(),
            config.games.overridden_games(),
            config.excluded_games.len()
        );
        Ok(config)
    }

    /// Load from `path` when given, otherwise use built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                info!("No QoE config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    #[inline]
    pub fn is_excluded(&self, game_id: &str) -> bool {
        self.excluded_games.contains(game_id)
    }
}

fn midnight_utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Process-level settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub database_path: String,
    pub config_path: Option<PathBuf>,
    /// Worker pool size for full-history runs
    pub batch_workers: usize,
    /// Worker pool size for backlog runs
    pub online_workers: usize,
    /// Units per chunk handed to one worker
    pub chunk_size: usize,
    /// Ceiling for every fixed-point loop of the engine
    pub max_iterations: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: "./pingscope.db".to_string(),
            config_path: None,
            batch_workers: 30,
            online_workers: 16,
            chunk_size: 100,
            max_iterations: 64,
        }
    }
}

impl EngineSettings {
    /// Read the process environment. Loading `.env` is left to the binary.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_path: std::env::var("PINGSCOPE_DATABASE_PATH")
                .unwrap_or(defaults.database_path),
            config_path: std::env::var("PINGSCOPE_CONFIG_PATH").ok().map(PathBuf::from),
            batch_workers: env_usize("PINGSCOPE_BATCH_WORKERS", defaults.batch_workers),
            online_workers: env_usize("PINGSCOPE_ONLINE_WORKERS", defaults.online_workers),
            chunk_size: env_usize("PINGSCOPE_CHUNK_SIZE", defaults.chunk_size),
            max_iterations: env_usize("PINGSCOPE_MAX_ITERATIONS", defaults.max_iterations),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_game_falls_back_to_defaults() {
        let config = QoeConfig::default();
        let game = config.games.for_game("nope");
        assert_eq!(game.qoe_band, 15);
        assert_eq!(game.stable_length_minutes, 30);
        assert!((game.stable_share - 0.15).abs() < f64::EPSILON);
        assert!((game.max_spike_proportion - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_toml_overrides_merge_onto_defaults() {
        let config = QoeConfig::from_toml_str(
            r#"
            excluded_games = ["273195"]

            [defaults]
            qoe_band = 20

            [games."295590"]
            stable_length_minutes = 45
            latency_offset = { until = "2022-07-14T00:00:00Z", subtract = 7 }
            "#,
        )
        .unwrap();

        let lol = config.games.for_game("295590");
        assert_eq!(lol.qoe_band, 20);
        assert_eq!(lol.stable_length_minutes, 45);
        assert!(lol.latency_offset.is_some());

        assert_eq!(config.games.for_game("other").qoe_band, 20);
        assert!(config.is_excluded("273195"));
        assert!(!config.is_excluded("267128"));
        assert!(!config.is_excluded("295590"));
    }

    #[test]
    fn test_default_exclusions_and_calendar() {
        let config = QoeConfig::default();
        assert!(config.is_excluded("273195"));
        assert!(config.is_excluded("267128"));
        assert_eq!(config.reference_date.to_rfc3339(), "2021-05-01T00:00:00+00:00");
        assert!(config.history_start > config.reference_date);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(QoeConfig::from_toml_str("[defaults]\nqoe_band = 0\n").is_err());
        assert!(QoeConfig::from_toml_str("[games.\"1\"]\nstable_share = 1.5\n").is_err());
        assert!(QoeConfig::from_toml_str("unknown_key = 3\n").is_err());
    }

    #[test]
    fn test_stable_length_ceiling() {
        let week = QoeConfig::from_toml_str("[defaults]\nstable_length_minutes = 10080\n").unwrap();
        assert_eq!(week.games.for_game("g").stable_length(), chrono::Duration::weeks(1));

        let err = QoeConfig::from_toml_str("[games.\"1\"]\nstable_length_minutes = 9223372036854775807\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("stable_length_minutes"));
        assert!(QoeConfig::from_toml_str("[defaults]\nstable_length_minutes = -1\n").is_err());
    }

    #[test]
    fn test_override_keeps_unset_fields() {
        let base = GameConfig::default()
            .with_qoe_band(20)
            .with_max_spike_proportion(0.4);
        let over = GameOverride {
            stable_share: Some(0.3),
            ..GameOverride::default()
        };
        let resolved = over.apply(&base);
        assert_eq!(resolved.qoe_band, 20);
        assert_eq!(resolved.stable_length_minutes, DEFAULT_STABLE_LENGTH_MINUTES);
        assert!((resolved.stable_share - 0.3).abs() < f64::EPSILON);
        assert!((resolved.max_spike_proportion - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_corrections() {
        let until = Utc.with_ymd_and_hms(2022, 7, 14, 0, 0, 0).unwrap();
        let config = GameConfig {
            latency_offset: Some(LatencyOffset { until, subtract: 7 }),
            blackouts: vec![TimeWindow {
                start: until + chrono::Duration::days(10),
                end: until + chrono::Duration::days(11),
            }],
            ..GameConfig::default()
        };

        let before = until - chrono::Duration::hours(1);
        let s = config.correct(Sample::new("u", "g", "s", before, 50)).unwrap();
        assert_eq!(s.latency, 43);

        let low = config.correct(Sample::new("u", "g", "s", before, 7)).unwrap();
        assert_eq!(low.latency, 7);

        let after = config.correct(Sample::new("u", "g", "s", until, 50)).unwrap();
        assert_eq!(after.latency, 50);

        let inside = until + chrono::Duration::days(10) + chrono::Duration::hours(2);
        assert!(config.correct(Sample::new("u", "g", "s", inside, 50)).is_none());
    }
}
