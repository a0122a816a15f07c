use crate::model::MinuteRange;

/// Slot Grid Generator.
///
/// Yields every minute-of-day start `s, s + step, …` of each open interval whose
/// `[start, start + duration)` fits inside that interval, in interval order.
/// The iterator is lazy and `Clone`; a clone restarts from the same position and
/// two grids built from the same inputs yield the same sequence.
#[derive(Debug, Clone)]
pub struct SlotGrid<'a> {
    intervals: &'a [MinuteRange],
    granularity: u32,
    duration: u32,
    idx: usize,
    next: Option<u32>,
}

impl<'a> SlotGrid<'a> {
    pub fn new(intervals: &'a [MinuteRange], granularity: u32, duration: u32) -> Self {
        Self {
            intervals,
            granularity: granularity.max(1),
            duration,
            idx: 0,
            next: intervals.first().map(|i| i.start),
        }
    }
}

impl Iterator for SlotGrid<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            let interval = self.intervals.get(self.idx)?;
            match self.next {
                Some(start) if interval.fits(start, self.duration) => {
                    self.next = Some(start + self.granularity);
                    return Some(start);
                }
                _ => {
                    self.idx += 1;
                    self.next = self.intervals.get(self.idx).map(|i| i.start);
                }
            }
        }
    }
}
