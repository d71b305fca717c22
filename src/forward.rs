//! The Forwarding Descriptor (spec §3) and the span computation that
//! underlies the Forwarding Tree (spec §4.7).

use std::time::Duration;

use smallvec::SmallVec;

/// Sentinel-initialized forwarding descriptor embedded in the header.
///
/// `init_marker` is what lets "unset" (no forwarding has been configured
/// for this message at all) and "empty" (forwarding was configured with an
/// explicit zero-length hostlist) be told apart — both would otherwise
/// present as `count == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Forward {
    pub count: u32,
    pub hostlist: String,
    pub tree_width: u16,
    pub timeout: Option<Duration>,
    init_marker: bool,
}

impl Forward {
    /// The sentinel "no forwarding configured" value.
    pub fn none() -> Self {
        Self {
            count: 0,
            hostlist: String::new(),
            tree_width: 0,
            timeout: None,
            init_marker: false,
        }
    }

    /// Initializes an explicit forwarding descriptor for `hostlist`,
    /// defaulting `tree_width` from the configuration when the caller
    /// doesn't override it (spec §4.6 step 2).
    pub fn new(hostlist: impl Into<String>, tree_width: u16, timeout: Option<Duration>) -> Self {
        let hostlist = hostlist.into();
        let count = if hostlist.is_empty() {
            0
        } else {
            hostlist.split(',').filter(|s| !s.is_empty()).count() as u32
        };
        Self {
            count,
            hostlist,
            tree_width,
            timeout,
            init_marker: true,
        }
    }

    /// True for the sentinel "caller never touched this" value — distinct
    /// from an explicit forwarding descriptor whose hostlist happens to be
    /// empty.
    pub fn is_unset(&self) -> bool {
        !self.init_marker
    }

    /// Splits `hostlist` into its node names, in order.
    pub fn nodes(&self) -> Vec<&str> {
        if self.hostlist.is_empty() {
            Vec::new()
        } else {
            self.hostlist.split(',').collect()
        }
    }
}

/// Computes the per-bucket fan-out ("span") of `n` children across at most
/// `width` buckets (spec §4.7).
///
/// Buckets are filled left to right, repeatedly, following the fill rule
/// verbatim: at bucket `i`, if the number of buckets remaining (`width -
/// i`) is enough to absorb everything that's left, the whole remainder
/// goes into bucket `i` and the pass stops; otherwise, if what's left
/// still fits one-per-bucket across the rest of the row, bucket `i` takes
/// one and the pass continues to `i + 1`; otherwise bucket `i` takes a
/// full `width` and the pass continues. Passes repeat until nothing is
/// left. This is what produces the lopsided-looking but deterministic
/// split in spec §4.7's worked example (5 nodes, width 3 -> `[3, 2, 0]`):
/// bucket 0 can't take the whole remainder and doesn't fit the "one each"
/// case either, so it absorbs a full `width`, leaving bucket 1 to absorb
/// the rest outright.
pub fn span(n: usize, width: u16) -> SmallVec<[usize; 8]> {
    let width = width.max(1) as usize;
    let mut buckets: SmallVec<[usize; 8]> = SmallVec::from_elem(0, width);

    let mut left = n;
    while left > 0 {
        for i in 0..width {
            let remaining_buckets = width - i;
            if remaining_buckets >= left {
                buckets[i] += left;
                left = 0;
                break;
            } else if left <= width {
                buckets[i] += 1;
                left -= 1;
            } else {
                buckets[i] += width;
                left -= width;
            }
        }
    }

    buckets
}

/// Partitions `nodes` into the per-bucket sub-hostlists matching
/// [`span`], preserving input order within each bucket.
pub fn partition<'a>(nodes: &[&'a str], width: u16) -> Vec<Vec<&'a str>> {
    let buckets = span(nodes.len(), width);
    let mut out = Vec::with_capacity(buckets.len());
    let mut idx = 0;
    for size in buckets {
        out.push(nodes[idx..idx + size].to_vec());
        idx += size;
    }
    out
}
