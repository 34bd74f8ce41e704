//! Donor directory abstraction.
//!
//! Donor lifecycle is owned by an external directory service; the engine only
//! reads snapshots through this trait. The directory boundary is responsible
//! for normalizing whatever field aliases its upstream uses into the one
//! canonical [`Donor`] shape.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::blood::BloodGroup;
use crate::domain::donor::Donor;
use crate::error::Result;

/// Read access to the donor directory.
#[async_trait]
pub trait DonorDirectory: Send + Sync {
    /// List donors, optionally pre-filtered by blood group.
    ///
    /// The group filter is an optimization hint only; the eligibility filter
    /// re-checks the group on every donor it sees.
    async fn list_donors(&self, blood_group: Option<BloodGroup>) -> Result<Vec<Donor>>;
}

/// In-memory directory for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryDirectory {
    donors: RwLock<Vec<Donor>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_donor(&self, donor: Donor) {
        self.donors.write().push(donor);
    }

    pub fn add_donors(&self, donors: impl IntoIterator<Item = Donor>) {
        self.donors.write().extend(donors);
    }
}

#[async_trait]
impl DonorDirectory for MemoryDirectory {
    async fn list_donors(&self, blood_group: Option<BloodGroup>) -> Result<Vec<Donor>> {
        let donors = self.donors.read();
        Ok(donors
            .iter()
            .filter(|d| blood_group.is_none_or(|g| d.blood_group == g))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::donor::DonorId;
    use uuid::Uuid;

    fn donor(group: BloodGroup) -> Donor {
        Donor {
            id: DonorId::from(Uuid::new_v4()),
            name: "Test".to_string(),
            blood_group: group,
            phone: None,
            last_donation: None,
        }
    }

    #[tokio::test]
    async fn test_group_filter() {
        let directory = MemoryDirectory::new();
        directory.add_donor(donor(BloodGroup::APositive));
        directory.add_donor(donor(BloodGroup::ONegative));

        let all = directory.list_donors(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_a = directory
            .list_donors(Some(BloodGroup::APositive))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].blood_group, BloodGroup::APositive);
    }
}
