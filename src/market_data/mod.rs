pub mod aggregator;
pub mod trade_stream;

pub use aggregator::CandleAggregator;
