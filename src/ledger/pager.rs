//! Paging of confirmed history by block-height range.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PagerError;
use crate::types::LedgerEntry;

/// One contiguous height range of the history, `bottom..=top`.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub bottom: u32,
    pub top: u32,
    /// Txio events falling in the range when the pager was mapped.
    pub count: u32,
    cached: Option<(u64, Arc<Vec<LedgerEntry>>)>,
}

impl HistoryPage {
    fn new(count: u32, bottom: u32, top: u32) -> Self {
        Self {
            bottom,
            top,
            count,
            cached: None,
        }
    }

    pub fn contains(&self, height: u32) -> bool {
        height >= self.bottom && height <= self.top
    }
}

/// Splits a height -> txio count summary into pages, newest first.
///
/// Pages cover `0..=u32::MAX` without gaps: the newest page is open at the
/// top and the oldest one extends down to genesis.
#[derive(Debug, Clone)]
pub struct HistoryPager {
    threshold: u32,
    summary: BTreeMap<u32, u32>,
    pages: Vec<HistoryPage>,
    mapped: bool,
}

impl HistoryPager {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            summary: BTreeMap::new(),
            pages: Vec::new(),
            mapped: false,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Rebuilds the pages from `summary`. Cached page content is dropped.
    pub fn map_history(&mut self, summary: BTreeMap<u32, u32>) {
        self.pages.clear();
        self.summary = summary;
        self.mapped = true;

        if self.summary.is_empty() {
            self.pages.push(HistoryPage::new(0, 0, u32::MAX));
            return;
        }

        let mut count = 0u32;
        let mut top = u32::MAX;
        for (&height, &n) in self.summary.iter().rev() {
            count += n;
            if count >= self.threshold {
                self.pages.push(HistoryPage::new(count, height, top));
                count = 0;
                top = height.saturating_sub(1);
            }
        }

        if count != 0 {
            self.pages.push(HistoryPage::new(count, 0, top));
        } else if let Some(oldest) = self.pages.last_mut() {
            // No remainder: the oldest sealed page reaches down to genesis.
            oldest.bottom = 0;
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn total_count(&self) -> u64 {
        self.pages.iter().map(|p| p.count as u64).sum()
    }

    pub fn pages(&self) -> &[HistoryPage] {
        &self.pages
    }

    pub fn page(&self, id: usize) -> Result<&HistoryPage, PagerError> {
        if !self.mapped {
            return Err(PagerError::Unmapped);
        }
        self.pages
            .get(id)
            .ok_or(PagerError::OutOfRange(id, self.pages.len()))
    }

    /// `(bottom, top)` heights of page `id`.
    pub fn page_range(&self, id: usize) -> Result<(u32, u32), PagerError> {
        self.page(id).map(|p| (p.bottom, p.top))
    }

    pub fn page_for_height(&self, height: u32) -> Result<usize, PagerError> {
        if !self.mapped {
            return Err(PagerError::Unmapped);
        }
        Ok(self
            .pages
            .iter()
            .position(|p| p.contains(height))
            .unwrap_or(0))
    }

    /// Height with history closest to `height`; the lower one on a tie.
    pub fn nearest_height(&self, height: u32) -> Option<u32> {
        let below = self.summary.range(..=height).next_back().map(|(h, _)| *h);
        let above = self.summary.range(height..).next().map(|(h, _)| *h);
        match (below, above) {
            (Some(b), Some(a)) if a - height < height - b => Some(a),
            (Some(b), _) => Some(b),
            (None, a) => a,
        }
    }

    /// Lowest height `bottom` such that `bottom..=height` holds at least
    /// `count` txio events, or 0 when the history runs out first.
    pub fn range_for_height_and_count(&self, height: u32, count: u32) -> (u32, u32) {
        let mut total = 0u32;
        for (&h, &n) in self.summary.range(..=height).rev() {
            total += n;
            if total >= count {
                return (h, height);
            }
        }
        (0, height)
    }

    /// Ledger entries of page `id`, computed by `load` unless cached for `update_id`.
    pub fn page_entries<E, F>(
        &mut self,
        id: usize,
        update_id: u64,
        load: F,
    ) -> Result<Arc<Vec<LedgerEntry>>, E>
    where
        E: From<PagerError>,
        F: FnOnce(u32, u32) -> Result<Vec<LedgerEntry>, E>,
    {
        if !self.mapped {
            return Err(PagerError::Unmapped.into());
        }
        let pages = self.pages.len();
        let page = self
            .pages
            .get_mut(id)
            .ok_or(PagerError::OutOfRange(id, pages))?;

        if let Some((cached_for, entries)) = &page.cached {
            if *cached_for == update_id {
                return Ok(entries.clone());
            }
        }

        let entries = Arc::new(load(page.bottom, page.top)?);
        page.cached = Some((update_id, entries.clone()));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spread(pairs: &[(u32, u32)]) -> BTreeMap<u32, u32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn empty_history_is_one_open_page() {
        let mut pager = HistoryPager::new(100);
        assert_eq!(pager.page(0).unwrap_err(), PagerError::Unmapped);

        pager.map_history(BTreeMap::new());
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.page_range(0).unwrap(), (0, u32::MAX));
        assert_eq!(pager.total_count(), 0);
        assert_eq!(pager.nearest_height(10), None);
    }

    #[test]
    fn hundred_fifty_txs_make_two_pages() {
        // 150 events spread across heights 100..=500, one per block.
        let summary: BTreeMap<u32, u32> = (0..150).map(|i| (100 + i * 400 / 149, 1)).collect();
        assert_eq!(summary.len(), 150);
        assert_eq!(summary.keys().next_back(), Some(&500));

        let mut pager = HistoryPager::new(100);
        pager.map_history(summary);

        assert_eq!(pager.page_count(), 2);
        let newest = pager.page(0).unwrap();
        assert_eq!(newest.top, u32::MAX);
        assert_eq!(newest.count, 100);
        let oldest = pager.page(1).unwrap();
        assert_eq!(oldest.bottom, 0);
        assert_eq!(oldest.top + 1, newest.bottom);
        assert_eq!(oldest.count, 50);
    }

    #[test]
    fn jump_navigation() {
        let mut pager = HistoryPager::new(2);
        pager.map_history(spread(&[(10, 1), (20, 1), (30, 1), (40, 1)]));

        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.page_for_height(35).unwrap(), 0);
        assert_eq!(pager.page_for_height(12).unwrap(), 1);
        assert_eq!(pager.nearest_height(24), Some(20));
        assert_eq!(pager.nearest_height(26), Some(30));
        assert_eq!(pager.nearest_height(25), Some(20));
        assert_eq!(pager.nearest_height(1), Some(10));
        assert_eq!(pager.range_for_height_and_count(35, 2), (20, 35));
        assert_eq!(pager.range_for_height_and_count(35, 10), (0, 35));
        assert_eq!(pager.page(5).unwrap_err(), PagerError::OutOfRange(5, 2));
    }

    #[test]
    fn page_entries_are_cached_per_update() {
        let mut pager = HistoryPager::new(100);
        pager.map_history(spread(&[(5, 3)]));
        let mut loads = 0;

        for update in [1, 1, 2] {
            pager
                .page_entries::<PagerError, _>(0, update, |_, _| {
                    loads += 1;
                    Ok(Vec::new())
                })
                .unwrap();
        }
        assert_eq!(loads, 2);
    }

    proptest! {
        #[test]
        fn pages_are_contiguous_and_sum_to_total(
            summary in prop::collection::btree_map(0u32..10_000, 1u32..50, 0..200),
            threshold in 1u32..300,
        ) {
            let total: u64 = summary.values().map(|n| *n as u64).sum();
            let mut pager = HistoryPager::new(threshold);
            pager.map_history(summary);

            prop_assert_eq!(pager.total_count(), total);
            let pages = pager.pages();
            prop_assert_eq!(pages[0].top, u32::MAX);
            prop_assert_eq!(pages[pages.len() - 1].bottom, 0);
            for pair in pages.windows(2) {
                prop_assert!(pair[0].bottom > pair[1].top);
                prop_assert_eq!(pair[1].top + 1, pair[0].bottom);
            }
        }
    }
}
