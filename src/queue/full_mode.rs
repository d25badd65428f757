/// Policy applied when an item is offered to a full [`Buffer`](crate::Buffer).
///
/// Determines how producers are treated when a bounded buffer has no free
/// slot left.
///
/// # Choosing a Strategy
///
/// - **Use [`Wait`](`FullMode::Wait`)** when delivery is more important than latency
/// - **Use [`DropWrite`](`FullMode::DropWrite`)** or [`DropOldest`](`FullMode::DropOldest`) when freshness is more
///   important than delivery
///
/// The duplex channel always uses [`Wait`](`FullMode::Wait`) unless told otherwise.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FullMode {
    /// Wait for space to become available.
    ///
    /// **This is the default strategy.** The producer is suspended until a
    /// consumer frees a slot or the buffer is closed. Items are never dropped,
    /// and backpressure propagates to the producer.
    #[default]
    Wait = 0,

    /// Drop the item being offered.
    ///
    /// The offer succeeds immediately but the item is discarded. Already
    /// buffered items are preserved.
    DropWrite = 1,

    /// Evict the oldest buffered item to make room for the new one.
    ///
    /// Useful when only the most recent data has value, e.g. periodic state
    /// updates.
    DropOldest = 2,
}

impl FullMode {
    /// Returns `true` if producers are suspended when the buffer is full.
    pub const fn is_blocking(&self) -> bool {
        matches!(self, FullMode::Wait)
    }
}
