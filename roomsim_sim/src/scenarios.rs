//! Named simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Cast, resolve, slow and cooldown a single target
    SlowAura,

    /// Many casts completing in the same tick
    CastStorm,

    /// One walker crossing a row of zones
    ZoneMarch,

    /// Invocation flood against the rate limiter
    SpamGuard,

    /// Chat flood past the event log cap
    EventFlood,

    /// Two rooms on one clock
    MultiRoom,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SlowAura,
            ScenarioId::CastStorm,
            ScenarioId::ZoneMarch,
            ScenarioId::SpamGuard,
            ScenarioId::EventFlood,
            ScenarioId::MultiRoom,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SlowAura => "slow_aura",
            ScenarioId::CastStorm => "cast_storm",
            ScenarioId::ZoneMarch => "zone_march",
            ScenarioId::SpamGuard => "spam_guard",
            ScenarioId::EventFlood => "event_flood",
            ScenarioId::MultiRoom => "multi_room",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SlowAura => "1s cast, 3s slow at 0.5x speed, 5s cooldown",
            ScenarioId::CastStorm => "50 casts resolve in one tick, identical order across two seeded runs",
            ScenarioId::ZoneMarch => "walker crosses three zones and two gaps, exit/enter pairing holds",
            ScenarioId::SpamGuard => "8 invocations in 1ms, 5 accepted, window reopens after 1s",
            ScenarioId::EventFlood => "250 chat lines into a 100-entry log, stale poller sees cursorExpired",
            ScenarioId::MultiRoom => "activity in one room never reaches another",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "slow_aura" | "slowaura" => Ok(ScenarioId::SlowAura),
            "cast_storm" | "caststorm" => Ok(ScenarioId::CastStorm),
            "zone_march" | "zonemarch" => Ok(ScenarioId::ZoneMarch),
            "spam_guard" | "spamguard" => Ok(ScenarioId::SpamGuard),
            "event_flood" | "eventflood" => Ok(ScenarioId::EventFlood),
            "multi_room" | "multiroom" => Ok(ScenarioId::MultiRoom),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
