use loadprobe_common::{Endpoint, LoadProbeError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedEndpoint {
    pub endpoint: Endpoint,
    pub weight: u32,
}

/// The endpoints a virtual user picks from, with relative weights.
///
/// A browsing user, for example:
///
/// | Endpoint                 | Weight |
/// |--------------------------|--------|
/// | `GET /`                  |   10   |
/// | `GET /products`          |    8   |
/// | `GET /products/{id}`     |    6   |
/// | `GET /products?search=…` |    4   |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadMix {
    entries: Vec<WeightedEndpoint>,
}

impl WorkloadMix {
    /// A mix that always calls `endpoint`.
    pub fn single(endpoint: Endpoint) -> Self {
        Self { entries: vec![WeightedEndpoint { endpoint, weight: 1 }] }
    }

    pub fn weighted(entries: Vec<(Endpoint, u32)>) -> Result<Self> {
        let mix = Self {
            entries: entries
                .into_iter()
                .map(|(endpoint, weight)| WeightedEndpoint { endpoint, weight })
                .collect(),
        };
        mix.validate()?;
        Ok(mix)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_weight() == 0 {
            return Err(LoadProbeError::InvalidConfig(
                "workload mix needs at least one endpoint with a non-zero weight".to_string(),
            ));
        }
        for entry in &self.entries {
            entry.endpoint.validate()?;
        }
        Ok(())
    }

    /// Summed in `u64` so no combination of `u32` weights can overflow.
    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.weight)).sum()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.iter().map(|e| &e.endpoint)
    }

    /// Draw an endpoint using `rng`.
    pub fn sample(&self, rng: &mut impl Rng) -> &Endpoint {
        let roll = rng.gen_range(0..self.total_weight().max(1));
        self.endpoint_for_roll(roll)
    }

    /// Map a roll in `0..total_weight` to an endpoint; each entry owns a
    /// contiguous band as wide as its weight. Exposed for deterministic testing.
    pub fn endpoint_for_roll(&self, roll: u64) -> &Endpoint {
        let mut upper: u64 = 0;
        for entry in &self.entries {
            upper += u64::from(entry.weight);
            if roll < upper {
                return &entry.endpoint;
            }
        }
        // Rolls past the end land on the last entry; validate() guarantees one exists.
        &self.entries[self.entries.len() - 1].endpoint
    }
}
