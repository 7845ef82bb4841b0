use crate::crs::CrsDescriptor;

use super::node_codec::max_entries_per_page;
use super::persistence::TreeHeader;
use super::rtree_constants::{
    CHECKSUM_SIZE, DEFAULT_CACHE_PAGES, DEFAULT_MAX_ELEMENTS, DEFAULT_MIN_FILL,
    DEFAULT_PAGE_SIZE, DEFAULT_REINSERT_FRACTION, MAX_PAGE_SIZE, MIN_MAX_ELEMENTS, MIN_PAGE_SIZE,
};
use super::rtree_split::SplitPolicy;
use super::rtree_types::{SpatialError, SpatialResult};

/// Validated tree configuration.
///
/// Instances are produced by [`RTreeConfigBuilder::build`], which fills in
/// derived defaults and rejects inconsistent combinations.
///
/// # Examples
///
/// ```rust
/// use spatial_index::{CrsDescriptor, RTreeConfig, SplitPolicy};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RTreeConfig::builder()
///     .split_policy(SplitPolicy::RStar)
///     .max_elements(16)
///     .crs(CrsDescriptor::wgs84())
///     .build()?;
///
/// assert_eq!(config.min_elements(), 6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RTreeConfig {
    page_size: usize,
    max_elements: usize,
    min_elements: usize,
    split_policy: SplitPolicy,
    cache_pages: usize,
    crs: CrsDescriptor,
    reinsert_fraction: f64,
}

impl RTreeConfig {
    /// Creates a new builder with default settings.
    #[inline]
    pub fn builder() -> RTreeConfigBuilder {
        RTreeConfigBuilder::new()
    }

    /// Rebuilds the configuration an existing store was created with.
    pub(crate) fn from_header(header: &TreeHeader, cache_pages: usize) -> Self {
        RTreeConfig {
            page_size: header.page_size as usize,
            max_elements: header.max_elements as usize,
            min_elements: header.min_elements as usize,
            split_policy: header.split_policy,
            cache_pages: cache_pages.max(1),
            crs: header.crs.clone(),
            reinsert_fraction: f64::from(header.reinsert_percent) / 100.0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn min_elements(&self) -> usize {
        self.min_elements
    }

    pub fn split_policy(&self) -> SplitPolicy {
        self.split_policy
    }

    pub fn cache_pages(&self) -> usize {
        self.cache_pages
    }

    pub fn crs(&self) -> &CrsDescriptor {
        &self.crs
    }

    pub fn dimension(&self) -> usize {
        self.crs.dimension()
    }

    pub fn reinsert_fraction(&self) -> f64 {
        self.reinsert_fraction
    }

    /// Reinsert share as stored in the header
    pub(crate) fn reinsert_percent(&self) -> u8 {
        (self.reinsert_fraction * 100.0).round() as u8
    }

    /// Number of entries evicted by an R* forced reinsert of a full node.
    pub fn reinsert_count(&self) -> usize {
        let wanted = (self.reinsert_fraction * self.max_elements as f64).round() as usize;
        wanted.clamp(1, self.max_elements + 1 - self.min_elements)
    }

    /// Bytes of a page available to node data
    pub fn usable_page_size(&self) -> usize {
        self.page_size - CHECKSUM_SIZE
    }
}

impl Default for RTreeConfig {
    fn default() -> Self {
        let crs = CrsDescriptor::default();
        let capacity = max_entries_per_page(DEFAULT_PAGE_SIZE - CHECKSUM_SIZE, crs.dimension());
        let max_elements = capacity.min(DEFAULT_MAX_ELEMENTS);
        RTreeConfig {
            page_size: DEFAULT_PAGE_SIZE,
            max_elements,
            min_elements: default_min(max_elements),
            split_policy: SplitPolicy::Quadratic,
            cache_pages: DEFAULT_CACHE_PAGES,
            crs,
            reinsert_fraction: DEFAULT_REINSERT_FRACTION,
        }
    }
}

fn default_min(max_elements: usize) -> usize {
    ((max_elements as f64 * DEFAULT_MIN_FILL) as usize).clamp(1, max_elements / 2)
}

/// Builder for [`RTreeConfig`].
pub struct RTreeConfigBuilder {
    page_size: usize,
    max_elements: Option<usize>,
    min_elements: Option<usize>,
    split_policy: SplitPolicy,
    cache_pages: usize,
    crs: CrsDescriptor,
    reinsert_fraction: f64,
}

impl RTreeConfigBuilder {
    #[inline]
    pub fn new() -> RTreeConfigBuilder {
        RTreeConfigBuilder {
            page_size: DEFAULT_PAGE_SIZE,
            max_elements: None,
            min_elements: None,
            split_policy: SplitPolicy::Quadratic,
            cache_pages: DEFAULT_CACHE_PAGES,
            crs: CrsDescriptor::default(),
            reinsert_fraction: DEFAULT_REINSERT_FRACTION,
        }
    }

    /// Applies settings suited to small machines: small pages, small cache.
    #[inline]
    pub fn low_memory_preset(self) -> Self {
        self.page_size(1024).cache_pages(32)
    }

    #[inline]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[inline]
    pub fn max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = Some(max_elements);
        self
    }

    #[inline]
    pub fn min_elements(mut self, min_elements: usize) -> Self {
        self.min_elements = Some(min_elements);
        self
    }

    #[inline]
    pub fn split_policy(mut self, split_policy: SplitPolicy) -> Self {
        self.split_policy = split_policy;
        self
    }

    #[inline]
    pub fn cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    #[inline]
    pub fn crs(mut self, crs: CrsDescriptor) -> Self {
        self.crs = crs;
        self
    }

    #[inline]
    pub fn reinsert_fraction(mut self, reinsert_fraction: f64) -> Self {
        self.reinsert_fraction = reinsert_fraction;
        self
    }

    pub fn build(self) -> SpatialResult<RTreeConfig> {
        self.crs.validate()?;
        let dimension = self.crs.dimension();

        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(SpatialError::InvalidConfig(format!(
                "page size must be between {} and {}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }

        let capacity = max_entries_per_page(self.page_size - CHECKSUM_SIZE, dimension);
        let max_elements = self
            .max_elements
            .unwrap_or_else(|| capacity.min(DEFAULT_MAX_ELEMENTS));
        if max_elements < MIN_MAX_ELEMENTS {
            return Err(SpatialError::InvalidConfig(format!(
                "max elements must be at least {}, got {}",
                MIN_MAX_ELEMENTS, max_elements
            )));
        }
        if max_elements > capacity {
            return Err(SpatialError::InvalidConfig(format!(
                "a {} byte page holds at most {} entries of dimension {}, {} requested",
                self.page_size, capacity, dimension, max_elements
            )));
        }

        let min_elements = self
            .min_elements
            .unwrap_or_else(|| default_min(max_elements));
        if min_elements < 1 || min_elements > max_elements / 2 {
            return Err(SpatialError::InvalidConfig(format!(
                "min elements must be between 1 and {}, got {}",
                max_elements / 2,
                min_elements
            )));
        }

        if !(self.reinsert_fraction > 0.0 && self.reinsert_fraction <= 0.5) {
            return Err(SpatialError::InvalidConfig(format!(
                "reinsert fraction must be in (0, 0.5], got {}",
                self.reinsert_fraction
            )));
        }

        if self.cache_pages == 0 {
            return Err(SpatialError::InvalidConfig(
                "cache must hold at least one page".to_string(),
            ));
        }

        if self.split_policy == SplitPolicy::Hilbert {
            match &self.crs.domain {
                Some(domain) if (0..dimension)
                    .all(|a| domain.min(a).is_finite() && domain.max(a).is_finite()) => {}
                _ => {
                    return Err(SpatialError::InvalidConfig(
                        "Hilbert trees need a CRS with a finite domain".to_string(),
                    ))
                }
            }
        }

        Ok(RTreeConfig {
            page_size: self.page_size,
            max_elements,
            min_elements,
            split_policy: self.split_policy,
            cache_pages: self.cache_pages,
            crs: self.crs,
            reinsert_fraction: self.reinsert_fraction,
        })
    }
}

impl Default for RTreeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[test]
    fn test_defaults() {
        let config = RTreeConfig::builder().build().unwrap();
        assert_eq!(config.page_size(), 4096);
        assert_eq!(config.max_elements(), 64);
        assert_eq!(config.min_elements(), 25);
        assert_eq!(config.cache_pages(), 256);
        assert_eq!(config.dimension(), 2);
        assert_eq!(config, RTreeConfig::default());
    }

    #[test]
    fn test_default_max_follows_page_capacity() {
        let config = RTreeConfig::builder().page_size(1024).build().unwrap();
        // (1020 - 13) / 48
        assert_eq!(config.max_elements(), 20);
        assert_eq!(config.min_elements(), 8);
    }

    #[test]
    fn test_min_is_capped_at_half() {
        let config = RTreeConfig::builder().max_elements(4).build().unwrap();
        assert_eq!(config.min_elements(), 1);
        let config = RTreeConfig::builder().max_elements(5).build().unwrap();
        assert_eq!(config.min_elements(), 2);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let cases = vec![
            RTreeConfig::builder().max_elements(2),
            RTreeConfig::builder().max_elements(1000),
            RTreeConfig::builder().max_elements(10).min_elements(6),
            RTreeConfig::builder().max_elements(10).min_elements(0),
            RTreeConfig::builder().page_size(100),
            RTreeConfig::builder().reinsert_fraction(0.0),
            RTreeConfig::builder().reinsert_fraction(0.8),
            RTreeConfig::builder().cache_pages(0),
            RTreeConfig::builder().crs(CrsDescriptor::cartesian(7)),
            RTreeConfig::builder().split_policy(SplitPolicy::Hilbert),
        ];
        for builder in cases {
            assert!(matches!(builder.build(), Err(SpatialError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_hilbert_needs_domain() {
        let config = RTreeConfig::builder()
            .split_policy(SplitPolicy::Hilbert)
            .crs(CrsDescriptor::cartesian(2).with_domain(Envelope::rect(0.0, 0.0, 1.0, 1.0)))
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_reinsert_count() {
        let config = RTreeConfig::builder().max_elements(10).build().unwrap();
        assert_eq!(config.reinsert_count(), 3);
        let config = RTreeConfig::builder().max_elements(3).build().unwrap();
        assert_eq!(config.reinsert_count(), 1);
    }

    #[test]
    fn test_low_memory_preset() {
        let config = RTreeConfig::builder().low_memory_preset().build().unwrap();
        assert_eq!(config.page_size(), 1024);
        assert_eq!(config.cache_pages(), 32);
    }
}
