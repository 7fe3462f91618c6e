mod range_reader;

pub use range_reader::{FileRangeReader, MemoryRangeReader, RangeReader};
