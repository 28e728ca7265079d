//! Rebuilds a chart-ready, gap-filled timeline from persisted track
//! items: clamp every intersecting item into the query window, then walk
//! them in order emitting transparent filler segments for uncovered time.

use crate::errors::EngineError;
use crate::models::{QueryWindow, Segment, TrackItem, TRANSPARENT};

const MINUTE_MS: i64 = 60_000;

fn whole_minutes(begin: i64, end: i64) -> i64 {
    (end - begin) / MINUTE_MS
}

struct ClampedItem {
    begin_date: i64,
    end_date: i64,
    color: Option<String>,
}

fn clamp_item(window: QueryWindow, item: &TrackItem) -> ClampedItem {
    ClampedItem {
        begin_date: window.from.max(item.begin_date),
        end_date: window.to.min(item.end_date),
        color: item.color.clone(),
    }
}

/// Reconstruct the timeline for `window` over `items`, which must be of
/// one kind and ordered by beginDate ascending. Returns an ordinal-ordered
/// segment sequence; an empty result for an uncovered window is a valid
/// terminal state, not an error.
pub fn reconstruct(window: QueryWindow, items: &[TrackItem]) -> Result<Vec<Segment>, EngineError> {
    window.validate()?;

    let clamped: Vec<ClampedItem> = items
        .iter()
        .filter(|item| item.intersects(window.from, window.to))
        .map(|item| clamp_item(window, item))
        .collect();

    if clamped.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut nr: u32 = 0;

    let push_gap = |segments: &mut Vec<Segment>, nr: &mut u32, begin: i64, end: i64| {
        let diff = whole_minutes(begin, end);
        // Sub-minute gaps are suppressed outright; a zero-diff gap would
        // render as a zero-width chart artifact.
        if diff > 0 {
            segments.push(Segment {
                begin_date: begin,
                end_date: end,
                diff,
                color: Some(TRANSPARENT.to_string()),
                x: *nr,
            });
            *nr += 1;
        }
    };

    for (idx, item) in clamped.iter().enumerate() {
        if idx == 0 {
            push_gap(&mut segments, &mut nr, window.from, item.begin_date);
        }

        segments.push(Segment {
            begin_date: item.begin_date,
            end_date: item.end_date,
            diff: whole_minutes(item.begin_date, item.end_date),
            color: item.color.clone(),
            x: nr,
        });
        nr += 1;

        match clamped.get(idx + 1) {
            Some(next) => push_gap(&mut segments, &mut nr, item.end_date, next.begin_date),
            None => push_gap(&mut segments, &mut nr, item.end_date, window.to),
        }
    }

    Ok(segments)
}
