pub mod completion;
pub mod error;
mod queue;
pub mod writable;

pub use completion::{OperationFuture, SignalFuture};
pub use error::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, StreamError>;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk.
    ///
    /// An `Err`, or a size that is negative or not finite, errors the whole
    /// stream rather than just the write that produced it.
    fn size(&self, chunk: &T) -> StreamResult<f64>;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> f64;
}

/// Count-based strategy
#[derive(Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&[u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&[u8]) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Validates a high water mark the same way for every strategy.
pub(crate) fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::InvalidHighWaterMark(high_water_mark));
    }
    Ok(high_water_mark)
}
