mod accumulator;
mod aggregator;

#[cfg(test)]
mod tests;

pub use accumulator::WindowAccumulator;
pub use aggregator::{
    spawn_flush_loop, AggregateResult, FlushReport, ResultFilter, WindowAggregator,
};
