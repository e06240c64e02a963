/// Contiguous slice of the flattened (group × row) work space assigned
/// to one worker.
///
/// `row_begin` applies inside `group_begin` only and `row_end` inside
/// `group_end - 1` only; groups strictly between them are covered in
/// full. An empty slice has `flat_begin == flat_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSlice {
    pub flat_begin: usize,
    pub flat_end: usize,
    pub group_begin: usize,
    pub group_end: usize,
    pub row_begin: usize,
    pub row_end: usize,
}

impl WorkSlice {
    pub fn is_empty(&self) -> bool {
        self.flat_begin == self.flat_end
    }

    /// Iterate the (group, row) pairs of this slice in flat order.
    pub fn iter(&self, rows_per_group: usize) -> impl Iterator<Item = (usize, usize)> {
        let rows = rows_per_group.max(1);
        (self.flat_begin..self.flat_end).map(move |flat| (flat / rows, flat % rows))
    }
}

/// Split `groups * rows_per_group` work units into `nthreads` contiguous
/// chunks; the last chunk absorbs the remainder.
///
/// Pure function of its arguments: every worker derives its own disjoint
/// slice with no shared counter, and the union over `0..nthreads`
/// covers the flat space exactly once.
pub fn partition_grouped(
    groups: usize,
    rows_per_group: usize,
    nthreads: usize,
    thread_id: usize,
) -> WorkSlice {
    debug_assert!(nthreads > 0);
    debug_assert!(thread_id < nthreads);

    let total = groups * rows_per_group;
    let per_thread = total / nthreads;
    let flat_begin = (thread_id * per_thread).min(total);
    let flat_end = if thread_id == nthreads - 1 {
        total
    } else {
        (flat_begin + per_thread).min(total)
    };

    if flat_begin >= flat_end {
        return WorkSlice {
            flat_begin,
            flat_end: flat_begin,
            group_begin: 0,
            group_end: 0,
            row_begin: 0,
            row_end: 0,
        };
    }

    let group_begin = flat_begin / rows_per_group;
    let row_begin = flat_begin % rows_per_group;
    let last = flat_end - 1;
    let group_end = last / rows_per_group + 1;
    let row_end = last % rows_per_group + 1;

    WorkSlice {
        flat_begin,
        flat_end,
        group_begin,
        group_end,
        row_begin,
        row_end,
    }
}
