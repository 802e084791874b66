//! Built-in scenarios exercising the scheduler.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// A (step 1) -> B (step 3), immediate edge
    MixedRates,

    /// A (step 1) -> B (step 3), time-shifted edge
    TimeShifted,

    /// A -> B immediate, B -> A weak, both step 1
    WeakCycle,

    /// B pushes into A with `set_data` while stepping
    AsyncPush,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::MixedRates,
            ScenarioId::TimeShifted,
            ScenarioId::WeakCycle,
            ScenarioId::AsyncPush,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::MixedRates => "mixed_rates",
            ScenarioId::TimeShifted => "time_shifted",
            ScenarioId::WeakCycle => "weak_cycle",
            ScenarioId::AsyncPush => "async_push",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::MixedRates => "B steps every 3rd tick and sees A's same-instant output",
            ScenarioId::TimeShifted => "B steps every 3rd tick and only sees A's earlier output",
            ScenarioId::WeakCycle => "Mutual dependency resolved by a weak back edge",
            ScenarioId::AsyncPush => "set_data reaches the target's next step only",
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
        match s.to_lowercase().as_str() {
            "mixed_rates" | "mixedrates" => Ok(ScenarioId::MixedRates),
            "time_shifted" | "timeshifted" => Ok(ScenarioId::TimeShifted),
            "weak_cycle" | "weakcycle" => Ok(ScenarioId::WeakCycle),
            "async_push" | "asyncpush" => Ok(ScenarioId::AsyncPush),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>(), Ok(id));
        }
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
