use serde::{Deserialize, Serialize};

use crate::stored_object;

stored_object!(VehicleCatalogEntry, "vehicle_catalog", {
    make: String,
    model: String,
    year_start: u16,
    year_end: Option<u16>
});

impl VehicleCatalogEntry {
    pub fn matches_year(&self, year: u16) -> bool {
        match self.year_end {
            Some(end) => year >= self.year_start && year <= end,
            None => year >= self.year_start,
        }
    }
}

stored_object!(VehicleFitment, "vehicle_fitment", {
    vehicle_id: String,
    dtc_id: String,
    mention_text: String,
    chunk_id: String
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_year_respects_open_ended_range() {
        let entry = VehicleCatalogEntry {
            id: "v1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            make: "Toyota".into(),
            model: "Camry".into(),
            year_start: 2010,
            year_end: None,
        };
        assert!(entry.matches_year(2024));
        assert!(!entry.matches_year(2005));
    }

    #[test]
    fn matches_year_respects_closed_range() {
        let entry = VehicleCatalogEntry {
            id: "v2".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            make: "Honda".into(),
            model: "Civic".into(),
            year_start: 2015,
            year_end: Some(2018),
        };
        assert!(entry.matches_year(2016));
        assert!(!entry.matches_year(2019));
    }
}
