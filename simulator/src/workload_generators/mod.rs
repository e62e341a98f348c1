pub mod csv_trace;
pub mod filters;
pub mod generator;
pub mod random;
pub mod workload_type;

pub use csv_trace::CsvTraceReader;
pub use generator::TraceGenerator;
pub use random::RepetitiveRandomTraceGenerator;
pub use workload_type::trace_resolver;
