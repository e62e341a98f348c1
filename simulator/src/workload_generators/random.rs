use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{config::sim_config::RandomTraceConfig, error::SimulationError, job::Job};

use super::generator::TraceGenerator;

/// Synthetic trace made of repeated batches of parallel jobs.
///
/// Within a batch up to `parallel` jobs are submitted, spread uniformly over
/// `max_start_spread` seconds, as long as their units fit in
/// `max_total_units`. The next batch starts `[min_gap, max_gap]` seconds after
/// the last submission of the previous one.
pub struct RepetitiveRandomTraceGenerator {
    options: RandomTraceConfig,
    rng: StdRng,
}

impl RepetitiveRandomTraceGenerator {
    pub fn from_options(options: &RandomTraceConfig) -> Result<Self, SimulationError> {
        if options.parallel == 0 {
            return Err(SimulationError::Trace("parallel must be positive".to_string()));
        }
        if options.exec_min > options.exec_max
            || options.min_gap > options.max_gap
            || options.min_units > options.max_units
        {
            return Err(SimulationError::Trace(
                "random trace ranges must have min <= max".to_string(),
            ));
        }
        if options.max_units.max(1) > options.max_total_units {
            return Err(SimulationError::Trace(
                "a single job may not exceed the batch unit budget".to_string(),
            ));
        }

        Ok(Self {
            options: options.clone(),
            rng: StdRng::seed_from_u64(options.seed),
        })
    }
}

impl TraceGenerator for RepetitiveRandomTraceGenerator {
    fn get_jobs(&mut self) -> Result<Vec<Job>, SimulationError> {
        let options = &self.options;
        let mut jobs = Vec::with_capacity(options.jobs);
        let mut batch_start = 0;

        while jobs.len() < options.jobs {
            let mut budget = options.max_total_units;
            let mut last_submit = batch_start;
            for _ in 0..options.parallel {
                if jobs.len() == options.jobs {
                    break;
                }
                let units = self.rng.gen_range(options.min_units..=options.max_units).max(1);
                if units > budget {
                    break;
                }
                budget -= units;

                let submit = batch_start + self.rng.gen_range(0..=options.max_start_spread);
                let exec = self.rng.gen_range(options.exec_min..=options.exec_max);
                last_submit = last_submit.max(submit);
                jobs.push(Job::new((jobs.len() + 1).to_string(), submit, 0, exec, units));
            }
            batch_start = last_submit + self.rng.gen_range(options.min_gap..=options.max_gap);
        }

        jobs.sort_by_key(|job| job.submit_time);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RandomTraceConfig {
        RandomTraceConfig {
            jobs: 50,
            parallel: 4,
            max_start_spread: 10,
            exec_min: 10,
            exec_max: 90,
            min_gap: 200,
            max_gap: 200,
            min_units: 1,
            max_units: 2,
            max_total_units: 4,
            seed: 7,
        }
    }

    #[test]
    fn test_batches_respect_limits() {
        let jobs = RepetitiveRandomTraceGenerator::from_options(&options())
            .unwrap()
            .get_jobs()
            .unwrap();
        assert_eq!(jobs.len(), 50);
        assert!(jobs.windows(2).all(|w| w[0].submit_time <= w[1].submit_time));
        for job in jobs.iter() {
            assert!((10..=90).contains(&job.exec_time));
            assert!((1..=2).contains(&job.requested_units));
        }
    }

    #[test]
    fn test_same_seed_same_trace() {
        let first = RepetitiveRandomTraceGenerator::from_options(&options())
            .unwrap()
            .get_jobs()
            .unwrap();
        let second = RepetitiveRandomTraceGenerator::from_options(&options())
            .unwrap()
            .get_jobs()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let mut bad = options();
        bad.exec_min = 100;
        assert!(RepetitiveRandomTraceGenerator::from_options(&bad).is_err());
    }
}
