use std::io::Write;

use env_logger::Builder;

use trace_dispatch::{
    config::sim_config::SimulationConfig, workload_generators::trace_resolver,
    DispatchSimulation, SimulationError, TraceGenerator,
};

fn main() -> Result<(), SimulationError> {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/config.yaml".to_string());
    let config = SimulationConfig::from_file(&path)?;

    let jobs = trace_resolver(&config.trace)?.get_jobs()?;
    log::info!("{} jobs loaded", jobs.len());

    let mut simulation = DispatchSimulation::new(&config, jobs)?;
    let summary = simulation.run()?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    if let Some(report) = config.report_path() {
        println!("report written to {}", report);
    }
    Ok(())
}
