use crate::models::QueueEntry;

/// Restores `1..=n` positions across the remaining entries of one (campus, lane),
/// preserving their current relative order. Returns how many entries moved.
pub fn reconcile_positions(entries: &mut [QueueEntry]) -> usize {
    entries.sort_by(|a, b| a.position.cmp(&b.position).then(a.queued_at.cmp(&b.queued_at)));
    let mut moved = 0;
    for (index, entry) in entries.iter_mut().enumerate() {
        let position = index as i32 + 1;
        if entry.position != position {
            entry.position = position;
            moved += 1;
        }
    }
    moved
}

/// True when positions are exactly `1..=n` with no gaps or repeats.
pub fn is_contiguous(entries: &[QueueEntry]) -> bool {
    let mut positions: Vec<i32> = entries.iter().map(|entry| entry.position).collect();
    positions.sort_unstable();
    positions
        .iter()
        .enumerate()
        .all(|(index, position)| *position == index as i32 + 1)
}
