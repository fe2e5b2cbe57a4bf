pub mod sinks;

pub use sinks::{build_sink, Ack, FileSink, HttpSink, SinkRow, TelemetrySink};
