//! The launch plan produced by a planner.

use std::collections::HashSet;

use retz_core::{Job, Offer};
use tracing::debug;

/// One job assigned to one offer. The job must fit entirely within that
/// offer.
#[derive(Debug, Clone)]
pub struct Launch {
    pub job: Job,
    pub offer_id: String,
}

/// What the dispatcher should do with the current offers: launch these
/// jobs, return those offers to the broker.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub launches: Vec<Launch>,
    pub to_cancel: Vec<String>,
}

impl Plan {
    /// First-fit pack `jobs` (already in launch order) into the offers.
    /// A job that fits no single offer is left queued for a later round;
    /// offers that end up with no job are cancelled.
    pub fn pack(jobs: Vec<Job>, offers: &[Offer]) -> Plan {
        let mut remaining: Vec<_> = offers.iter().map(|offer| offer.resources).collect();
        let mut assigned: HashSet<usize> = HashSet::new();
        let mut launches = Vec::new();

        for job in jobs {
            let slot = remaining
                .iter()
                .position(|capacity| job.resources.fits_in(capacity));
            match slot {
                Some(index) => {
                    remaining[index].subtract(&job.resources);
                    assigned.insert(index);
                    launches.push(Launch {
                        job,
                        offer_id: offers[index].id.clone(),
                    });
                }
                None => {
                    debug!("job {} fits no single offer; leaving it queued", job.id);
                }
            }
        }

        let to_cancel = offers
            .iter()
            .enumerate()
            .filter(|(index, _)| !assigned.contains(index))
            .map(|(_, offer)| offer.id.clone())
            .collect();

        Plan {
            launches,
            to_cancel,
        }
    }
}
