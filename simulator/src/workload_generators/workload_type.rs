//! Trace source selection.

use crate::{config::sim_config::TraceConfig, error::SimulationError};

use super::{
    csv_trace::CsvTraceReader,
    filters::{FilteredTrace, IgnoreFilter, RunningAt},
    generator::TraceGenerator,
    random::RepetitiveRandomTraceGenerator,
};

/// Builds the trace source described by `config`, filters included.
/// A file trace takes precedence over a random one.
pub fn trace_resolver(config: &TraceConfig) -> Result<Box<dyn TraceGenerator>, SimulationError> {
    let source: Box<dyn TraceGenerator> = match (&config.path, &config.random) {
        (Some(path), _) => Box::new(
            CsvTraceReader::new(path).with_range(config.from.unwrap_or(0), config.to),
        ),
        (None, Some(random)) => {
            let mut random = random.clone();
            if let Some(to) = config.to {
                random.jobs = to.saturating_sub(config.from.unwrap_or(0));
            }
            Box::new(RepetitiveRandomTraceGenerator::from_options(&random)?)
        }
        (None, None) => {
            return Err(SimulationError::Trace(
                "either a trace path or random trace options are required".to_string(),
            ))
        }
    };

    if config.running_at.is_none() && config.ignore_list.is_none() {
        return Ok(source);
    }

    let mut trace = FilteredTrace::new(source);
    if let Some(instant) = config.running_at {
        trace = trace.with_filter(Box::new(RunningAt { instant }));
    }
    if let Some(path) = &config.ignore_list {
        trace = trace.with_filter(Box::new(IgnoreFilter::from_file(path)?));
    }
    Ok(Box::new(trace))
}
