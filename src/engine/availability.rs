use crate::limits::SLOT_GRANULARITY_MINUTES;
use crate::model::*;

// ── Slot grid ─────────────────────────────────────────────────────

/// Candidate start times `open, open+step, …` strictly before `close`.
///
/// Pure value: iterating twice yields the same sequence, and nothing is
/// computed until the iterator is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    open: Minute,
    close: Minute,
    step: Minute,
}

impl SlotGrid {
    pub fn new(hours: &BusinessHours) -> Self {
        Self::with_step(hours.span(), SLOT_GRANULARITY_MINUTES)
    }

    pub fn with_step(window: Span, step: Minute) -> Self {
        Self {
            open: window.start,
            close: window.end,
            step: step.max(1),
        }
    }

    pub fn close(&self) -> Minute {
        self.close
    }

    pub fn starts(&self) -> impl Iterator<Item = Minute> + Clone + use<> {
        (self.open..self.close).step_by(self.step as usize)
    }

    /// Every grid slot, marked available when `[t, t + duration)` ends by
    /// close and is clear of `busy`. A zero duration checks one grid step.
    ///
    /// `busy` must be sorted and merged (see `merge_overlapping`).
    pub fn slots(self, busy: &[Span], duration: Minute) -> impl Iterator<Item = Slot> + '_ {
        let close = self.close;
        let needed = if duration == 0 { self.step } else { duration };
        self.starts().filter_map(move |start| {
            let time = ClockTime::from_minutes(start)?;
            Some(Slot {
                time,
                available: fits(start, needed, close, busy),
            })
        })
    }
}

/// `[start, start + duration)` ends by `close` and is clear of every busy span.
pub fn fits(start: Minute, duration: Minute, close: Minute, busy: &[Span]) -> bool {
    let end = start + duration;
    if end > close {
        return false;
    }
    // Busy spans are disjoint and sorted, so their ends ascend too: only the
    // last span starting before `end` can reach past `start`.
    let candidates = busy.partition_point(|b| b.start < end);
    candidates == 0 || busy[candidates - 1].end <= start
}

/// Outcome of the pure availability computation for one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub slots: Vec<Slot>,
    pub closed_reason: Option<String>,
}

/// Slots for one day given its business hours and the busy spans of the
/// targeted resource(s). `None` or non-open hours mean the day is closed.
pub fn availability(
    hours: Option<&BusinessHours>,
    busy: &[Span],
    service_duration: Option<Minute>,
) -> DayAvailability {
    match hours {
        Some(h) if h.is_open() => DayAvailability {
            slots: SlotGrid::new(h)
                .slots(busy, service_duration.unwrap_or(0))
                .collect(),
            closed_reason: None,
        },
        _ => DayAvailability {
            slots: Vec::new(),
            closed_reason: Some("closed".to_string()),
        },
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}
