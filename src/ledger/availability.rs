use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_window;
use super::{Ledger, LedgerError};

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

/// `base` minus `to_remove`; both sorted by start, `to_remove` may overlap itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Free sub-windows of `query` on one spot, given its active reservations.
pub(super) fn free_within(ss: &SpotState, query: &Span) -> Vec<Span> {
    let taken: Vec<Span> = ss
        .overlapping(query)
        .map(|slot| Span::new(slot.span.start.max(query.start), slot.span.end.min(query.end)))
        .collect();
    subtract_intervals(&[*query], &merge_overlapping(&taken))
}

impl Ledger {
    /// Spots from `spot_ids` with no active reservation overlapping `[start, end)`,
    /// in request order. Advisory: a later `reserve` may still conflict.
    pub async fn find_available(
        &self,
        spot_ids: &[SpotId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Spot>, LedgerError> {
        let span = validate_window(start, end)?;
        if spot_ids.len() > MAX_QUERY_IDS {
            return Err(LedgerError::LimitExceeded("too many spot ids in query"));
        }

        // Resolve everything up front so an unknown id fails the whole query.
        let mut seen = HashSet::with_capacity(spot_ids.len());
        let handles = spot_ids
            .iter()
            .filter(|id| seen.insert(**id))
            .map(|id| self.spot_handle(id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut free = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            if !guard.retired && guard.overlapping(&span).next().is_none() {
                free.push(guard.spot.clone());
            }
        }
        Ok(free)
    }

    /// Every spot in the zone free for `[start, end)`, ordered by label.
    pub async fn find_available_in_zone(
        &self,
        zone_id: ZoneId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Spot>, LedgerError> {
        let ids = self
            .zones
            .get(&zone_id)
            .map(|zs| zs.spots.clone())
            .ok_or_else(|| LedgerError::zone_not_found(zone_id))?;
        let mut free = self.find_available(&ids, start, end).await?;
        free.sort_by_key(|s| s.label);
        Ok(free)
    }

    /// Free sub-windows of `[start, end)` on one spot.
    pub async fn free_windows(
        &self,
        spot_id: SpotId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Span>, LedgerError> {
        let span = validate_window(start, end)?;
        let handle = self.spot_handle(&spot_id)?;
        let guard = handle.read().await;
        Ok(free_within(&guard, &span))
    }

    /// Current occupied flags across a zone.
    pub async fn zone_occupancy(&self, zone_id: ZoneId) -> Result<ZoneOccupancy, LedgerError> {
        let ids = self
            .zones
            .get(&zone_id)
            .map(|zs| zs.spots.clone())
            .ok_or_else(|| LedgerError::zone_not_found(zone_id))?;

        let mut spots = 0;
        let mut occupied = 0;
        for id in &ids {
            let Ok(handle) = self.spot_handle(id) else { continue };
            let guard = handle.read().await;
            spots += 1;
            if guard.occupied {
                occupied += 1;
            }
        }
        Ok(ZoneOccupancy {
            zone_id,
            spots,
            occupied,
            available: spots - occupied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn spot_state(spans: &[(Ms, Ms)]) -> SpotState {
        let mut ss = SpotState::new(Spot {
            id: Ulid::new(),
            zone_id: Ulid::new(),
            label: 7,
            accessible: true,
            location: None,
            landmark_hint: Some("next to the pharmacy".into()),
        });
        for &(s, e) in spans {
            ss.insert_slot(Slot {
                reservation_id: Ulid::new(),
                span: Span::new(s, e),
            });
        }
        ss
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(200, 300)]);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        assert!(subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[Span::new(100, 300)], &[Span::new(150, 200)]);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_edges() {
        let base = [Span::new(100, 200)];
        assert_eq!(subtract_intervals(&base, &[Span::new(50, 150)]), vec![Span::new(150, 200)]);
        assert_eq!(subtract_intervals(&base, &[Span::new(150, 250)]), vec![Span::new(100, 150)]);
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(400, 450),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 450), Span::new(500, 600)]
        );
    }

    #[test]
    fn free_within_empty_spot_is_whole_query() {
        let ss = spot_state(&[]);
        let q = Span::new(9 * H, 17 * H);
        assert_eq!(free_within(&ss, &q), vec![q]);
    }

    #[test]
    fn free_within_clamps_reservations_to_query() {
        let ss = spot_state(&[(8 * H, 10 * H), (12 * H, 13 * H), (16 * H, 20 * H)]);
        let free = free_within(&ss, &Span::new(9 * H, 17 * H));
        assert_eq!(
            free,
            vec![Span::new(10 * H, 12 * H), Span::new(13 * H, 16 * H)]
        );
    }

    #[test]
    fn free_within_fully_booked() {
        let ss = spot_state(&[(9 * H, 12 * H), (12 * H, 17 * H)]);
        assert!(free_within(&ss, &Span::new(10 * H, 15 * H)).is_empty());
    }
}
