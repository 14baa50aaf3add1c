use crate::model::*;

// ── Availability Index ────────────────────────────────────────────

/// Windows claimed by blocking reservations that intersect `query`, sorted and merged.
///
/// Rejected, expired and cancelled reservations never appear. Neither does an
/// awaiting-owner reservation past its deadline, even before the sweep persists it.
pub fn blocked_windows(vs: &VehicleState, query: &Window, now: Ms, payment_grace: Ms) -> Vec<Window> {
    let mut blocked: Vec<Window> = vs
        .overlapping(query)
        .filter(|r| r.status.blocks(now, payment_grace))
        .map(|r| r.window)
        .collect();
    blocked.sort_by_key(|w| w.start);
    merge_overlapping(&blocked)
}

/// Every blocking window of the vehicle, unclamped and unmerged. One entry per
/// reservation, in start order.
pub fn blocking_reservation_windows(vs: &VehicleState, now: Ms, payment_grace: Ms) -> Vec<Window> {
    vs.reservations
        .iter()
        .filter(|r| r.status.blocks(now, payment_grace))
        .map(|r| r.window)
        .collect()
}

/// Free sub-windows of `query`, optionally keeping only those at least `min_days` long.
pub fn free_windows(
    vs: &VehicleState,
    query: &Window,
    min_days: Option<i64>,
    now: Ms,
    payment_grace: Ms,
) -> Vec<Window> {
    let blocked = blocked_windows(vs, query, now, payment_grace);
    let mut free = subtract_intervals(&[*query], &blocked);
    if let Some(min) = min_days {
        free.retain(|w| w.days() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[Window]) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::new();
    for &w in sorted {
        if let Some(last) = merged.last_mut()
            && w.start <= last.end {
                last.end = last.end.max(w.end);
                continue;
            }
        merged.push(w);
    }
    merged
}

pub fn subtract_intervals(base: &[Window], to_remove: &[Window]) -> Vec<Window> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Window { start: current_start, end: r.start });
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Window { start: current_start, end: current_end });
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Status;
    use crate::limits::DEFAULT_PAYMENT_GRACE_MS as GRACE;
    use crate::model::fixtures::*;

    fn state_with(entries: &[(&str, &str, Status)]) -> VehicleState {
        let mut vs = VehicleState::new(vehicle(ConfirmationMode::Manual));
        let vid = vs.id();
        for (s, e, status) in entries {
            vs.insert_reservation(reservation(vid, window(s, e), *status));
        }
        vs
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![window("2024-05-01", "2024-05-05"), window("2024-05-10", "2024-05-15")];
        let remove = vec![window("2024-05-05", "2024-05-10")];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![window("2024-05-10", "2024-05-12")];
        let remove = vec![window("2024-05-01", "2024-05-31")];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![window("2024-05-01", "2024-05-31")];
        let remove = vec![window("2024-05-10", "2024-05-13")];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![window("2024-05-01", "2024-05-10"), window("2024-05-13", "2024-05-31")]
        );
    }

    #[test]
    fn subtract_multiple_removals() {
        let base = vec![window("2024-05-01", "2024-05-31")];
        let remove = vec![
            window("2024-04-25", "2024-05-03"),
            window("2024-05-10", "2024-05-12"),
            window("2024-05-29", "2024-06-05"),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![window("2024-05-03", "2024-05-10"), window("2024-05-12", "2024-05-29")]
        );
    }

    // ── merge_overlapping ─────────────────────────────────

    #[test]
    fn merge_adjacent_and_overlapping() {
        let sorted = vec![
            window("2024-05-01", "2024-05-03"),
            window("2024-05-03", "2024-05-05"),
            window("2024-05-04", "2024-05-08"),
            window("2024-05-10", "2024-05-11"),
        ];
        assert_eq!(
            merge_overlapping(&sorted),
            vec![window("2024-05-01", "2024-05-08"), window("2024-05-10", "2024-05-11")]
        );
    }

    #[test]
    fn merge_empty() {
        assert!(merge_overlapping(&[]).is_empty());
    }

    // ── Availability Index ────────────────────────────────

    #[test]
    fn only_blocking_statuses_appear() {
        let vs = state_with(&[
            ("2024-05-01", "2024-05-03", Status::Confirmed),
            ("2024-05-04", "2024-05-06", Status::Rejected),
            ("2024-05-07", "2024-05-09", Status::Expired),
            ("2024-05-10", "2024-05-12", Status::Cancelled { by: Party::Renter }),
            ("2024-05-13", "2024-05-15", Status::PendingPayment { failed_at: None }),
            ("2024-05-16", "2024-05-18", Status::AwaitingOwner { deadline: 1_000 }),
        ]);
        let blocked = blocking_reservation_windows(&vs, 0, GRACE);
        assert_eq!(
            blocked,
            vec![
                window("2024-05-01", "2024-05-03"),
                window("2024-05-13", "2024-05-15"),
                window("2024-05-16", "2024-05-18"),
            ]
        );
    }

    #[test]
    fn lapsed_owner_deadline_drops_out() {
        let vs = state_with(&[("2024-05-10", "2024-05-13", Status::AwaitingOwner { deadline: 1_000 })]);
        let q = window("2024-05-01", "2024-06-01");
        assert_eq!(blocked_windows(&vs, &q, 1_000, GRACE).len(), 1);
        assert!(blocked_windows(&vs, &q, 1_001, GRACE).is_empty());
    }

    #[test]
    fn failed_payment_blocks_until_grace() {
        let vs = state_with(&[(
            "2024-05-10",
            "2024-05-13",
            Status::PendingPayment { failed_at: Some(0) },
        )]);
        assert_eq!(blocking_reservation_windows(&vs, GRACE, GRACE).len(), 1);
        assert!(blocking_reservation_windows(&vs, GRACE + 1, GRACE).is_empty());
    }

    #[test]
    fn blocked_is_merged_for_calendar() {
        let vs = state_with(&[
            ("2024-05-10", "2024-05-12", Status::Confirmed),
            ("2024-05-12", "2024-05-14", Status::Confirmed),
        ]);
        let q = window("2024-05-01", "2024-06-01");
        assert_eq!(blocked_windows(&vs, &q, 0, GRACE), vec![window("2024-05-10", "2024-05-14")]);
    }

    #[test]
    fn free_windows_complement_blocked() {
        let vs = state_with(&[
            ("2024-05-05", "2024-05-07", Status::Confirmed),
            ("2024-05-20", "2024-05-21", Status::PendingPayment { failed_at: None }),
        ]);
        let q = window("2024-05-01", "2024-06-01");
        assert_eq!(
            free_windows(&vs, &q, None, 0, GRACE),
            vec![
                window("2024-05-01", "2024-05-05"),
                window("2024-05-07", "2024-05-20"),
                window("2024-05-21", "2024-06-01"),
            ]
        );
    }

    #[test]
    fn free_windows_min_days_filter() {
        let vs = state_with(&[
            ("2024-05-03", "2024-05-04", Status::Confirmed),
            ("2024-05-06", "2024-05-07", Status::Confirmed),
        ]);
        let q = window("2024-05-01", "2024-05-10");
        // Free: [1,3) 2d, [4,6) 2d, [7,10) 3d
        assert_eq!(free_windows(&vs, &q, None, 0, GRACE).len(), 3);
        assert_eq!(
            free_windows(&vs, &q, Some(3), 0, GRACE),
            vec![window("2024-05-07", "2024-05-10")]
        );
    }

    #[test]
    fn free_window_for_empty_vehicle_is_whole_query() {
        let vs = state_with(&[]);
        let q = window("2024-05-01", "2024-05-10");
        assert_eq!(free_windows(&vs, &q, None, 0, GRACE), vec![q]);
    }
}
