//! Coordinate reference system descriptor.
//!
//! The index never transforms coordinates. A CRS is an opaque descriptor that
//! fixes the number of dimensions and, optionally, the domain of valid
//! coordinates (needed by Hilbert trees to normalise keys).

use crate::envelope::Envelope;
use crate::rtree::rtree_constants::{HEADER_PAGE, MAX_CRS_IDENTIFIER_LEN, MAX_DIMENSION};
use crate::rtree::rtree_types::{SpatialError, SpatialResult};

#[derive(Clone, PartialEq, Debug, serde::Deserialize, serde::Serialize)]
pub struct CrsDescriptor {
    /// Free-form identifier such as `EPSG:4326`
    pub identifier: String,
    pub dimension: u8,
    /// Bounds of valid coordinates, if known
    pub domain: Option<Envelope>,
}

impl CrsDescriptor {
    pub fn new(identifier: impl Into<String>, dimension: u8) -> Self {
        CrsDescriptor {
            identifier: identifier.into(),
            dimension,
            domain: None,
        }
    }

    /// Geographic longitude/latitude in degrees.
    pub fn wgs84() -> Self {
        CrsDescriptor {
            identifier: "EPSG:4326".to_string(),
            dimension: 2,
            domain: Some(Envelope::rect(-180.0, -90.0, 180.0, 90.0)),
        }
    }

    /// Unbounded engineering coordinates with the given dimension.
    pub fn cartesian(dimension: u8) -> Self {
        CrsDescriptor::new(format!("cartesian-{}d", dimension), dimension)
    }

    pub fn with_domain(mut self, domain: Envelope) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    pub fn validate(&self) -> SpatialResult<()> {
        let dimension = self.dimension();
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(SpatialError::InvalidConfig(format!(
                "CRS dimension must be between 1 and {}, got {}",
                MAX_DIMENSION, dimension
            )));
        }
        if self.identifier.len() > MAX_CRS_IDENTIFIER_LEN {
            return Err(SpatialError::InvalidConfig(format!(
                "CRS identifier longer than {} bytes",
                MAX_CRS_IDENTIFIER_LEN
            )));
        }
        if let Some(domain) = &self.domain {
            domain
                .validate(dimension)
                .map_err(|e| SpatialError::InvalidConfig(format!("CRS domain: {}", e)))?;
        }
        Ok(())
    }

    pub(crate) fn to_bytes(&self) -> SpatialResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| SpatialError::InvalidConfig(format!("cannot encode CRS: {}", e)))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> SpatialResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(crs, _)| crs)
            .map_err(|e| SpatialError::corruption(HEADER_PAGE, format!("bad CRS record: {}", e)))
    }
}

impl Default for CrsDescriptor {
    fn default() -> Self {
        CrsDescriptor::cartesian(2)
    }
}

impl std::fmt::Display for CrsDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}D)", self.identifier, self.dimension)
    }
}
