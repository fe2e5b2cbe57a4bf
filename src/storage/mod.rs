pub mod migrations;
pub mod models;
pub mod sample_buffer;

pub use models::{BufferStats, BufferedBatch, BufferedSample, QualityFlag, Sample, SampleClock, SampleTime};
pub use sample_buffer::SampleBuffer;
