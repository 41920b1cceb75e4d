//! Engine failures that abort a single unit of work

/// Fixed-point loop of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GlitchRepair,
    SpikeDetection,
    Reprocess,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlitchRepair => write!(f, "glitch repair"),
            Self::SpikeDetection => write!(f, "spike detection"),
            Self::Reprocess => write!(f, "alternative reprocessing"),
        }
    }
}

/// Recoverable engine error: the unit yields nothing and is retried on the next run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NonConvergence { stage: Stage, limit: usize },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonConvergence { stage, limit } => {
                write!(f, "{} did not converge within {} iterations", stage, limit)
            }
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
