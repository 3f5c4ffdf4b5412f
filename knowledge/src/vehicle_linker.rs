//! Matches the vehicle mentions the Extract stage pulled out of a
//! document's chunks against the vehicle catalog, creating a catalog
//! entry on first sighting of a make/model/year combination and linking
//! each mention's DTC codes to it.

use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::refined::{DtcCode, VehicleMention};
use common::storage::types::vehicle::{VehicleCatalogEntry, VehicleFitment};

#[derive(Debug, Default, Clone, Copy)]
pub struct LinkStats {
    pub vehicles_created: u32,
    pub fitments_created: u32,
}

/// Processes every vehicle mention extracted from `document_id`'s chunks:
/// finds or creates the matching catalog vehicle, then links each of the
/// mention's related DTC codes to it via a `vehicle_fitment` row.
pub async fn link_vehicles_for_document(
    db: &SurrealDbClient,
    document_id: &str,
) -> Result<LinkStats, AppError> {
    let mut stats = LinkStats::default();

    let mentions: Vec<VehicleMention> = {
        let mut response = db
            .query(
                "SELECT * FROM refined_vehicle_mention WHERE chunk_id IN \
                 (SELECT id FROM chunk WHERE document_id = $document_id)",
            )
            .bind(("document_id", document_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    for mention in &mentions {
        let Some(vehicle_id) = find_or_create_vehicle(db, mention, &mut stats).await? else {
            continue;
        };

        for code in &mention.related_dtc_codes {
            let normalized = DtcCode::normalize_code(code);
            let existing_dtc: Option<DtcCode> = {
                let mut response = db
                    .query("SELECT * FROM refined_dtc_code WHERE code = $code LIMIT 1")
                    .bind(("code", normalized))
                    .await
                    .map_err(AppError::Database)?;
                response.take(0).map_err(AppError::Database)?
            };
            let Some(dtc) = existing_dtc else { continue };

            if link_fitment_exists(db, &vehicle_id, &dtc.id).await? {
                continue;
            }

            let now = chrono::Utc::now();
            db.store_item(VehicleFitment {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                updated_at: now,
                vehicle_id: vehicle_id.clone(),
                dtc_id: dtc.id.clone(),
                mention_text: format!("{} {}", mention.make, mention.model),
                chunk_id: mention.chunk_id.clone(),
            })
            .await?;
            stats.fitments_created += 1;
        }
    }

    Ok(stats)
}

/// Matches an existing catalog entry by make/model with the mention's year
/// falling inside its range; creates one when none matches and a year is
/// known. A mention with no year at all and no existing entry is skipped,
/// since there is nothing to disambiguate it against.
async fn find_or_create_vehicle(
    db: &SurrealDbClient,
    mention: &VehicleMention,
    stats: &mut LinkStats,
) -> Result<Option<String>, AppError> {
    let catalog: Vec<VehicleCatalogEntry> = db.get_all_stored_items().await.map_err(AppError::Database)?;
    let lower_make = mention.make.to_ascii_lowercase();
    let lower_model = mention.model.to_ascii_lowercase();

    let existing = catalog.iter().find(|v| {
        v.make.to_ascii_lowercase() == lower_make
            && v.model.to_ascii_lowercase() == lower_model
            && mention.year_start.is_none_or(|year| v.matches_year(year))
    });
    if let Some(vehicle) = existing {
        return Ok(Some(vehicle.id.clone()));
    }

    let Some(year_start) = mention.year_start else {
        return Ok(None);
    };

    let now = chrono::Utc::now();
    let entry = VehicleCatalogEntry {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now,
        updated_at: now,
        make: mention.make.trim().to_string(),
        model: mention.model.trim().to_string(),
        year_start,
        year_end: mention.year_end,
    };
    let id = entry.id.clone();
    db.store_item(entry).await?;
    stats.vehicles_created += 1;
    Ok(Some(id))
}

async fn link_fitment_exists(
    db: &SurrealDbClient,
    vehicle_id: &str,
    dtc_id: &str,
) -> Result<bool, AppError> {
    let existing: Option<VehicleFitment> = {
        let mut response = db
            .query("SELECT * FROM vehicle_fitment WHERE vehicle_id = $vehicle_id AND dtc_id = $dtc_id LIMIT 1")
            .bind(("vehicle_id", vehicle_id.to_string()))
            .bind(("dtc_id", dtc_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };
    Ok(existing.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::Chunk;

    async fn seed_chunk(db: &SurrealDbClient, id: &str, document_id: &str) {
        let now = chrono::Utc::now();
        db.store_item(Chunk {
            id: id.into(),
            created_at: now,
            updated_at: now,
            document_id: document_id.into(),
            chunk_index: 0,
            text: "On the 2016 Toyota Camry, check sensor wiring.".into(),
            start: 0,
            end: 10,
            embedding: None,
        })
        .await
        .expect("store chunk");
    }

    #[tokio::test]
    async fn matches_existing_catalog_entry_and_links_fitment() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        let now = chrono::Utc::now();

        seed_chunk(&db, "chunk-1", "doc-1").await;

        db.store_item(VehicleCatalogEntry {
            id: "vehicle-1".into(),
            created_at: now,
            updated_at: now,
            make: "Toyota".into(),
            model: "Camry".into(),
            year_start: 2015,
            year_end: Some(2017),
        })
        .await
        .expect("store vehicle");

        db.store_item(DtcCode {
            id: "dtc-1".into(),
            created_at: now,
            updated_at: now,
            code: "P0420".into(),
            description: "Catalyst efficiency".into(),
            category: "emissions".into(),
            severity: "moderate".into(),
            confidence: 0.0,
            source_count: 1,
        })
        .await
        .expect("store refined dtc code");

        db.store_item(VehicleMention {
            id: "mention-1".into(),
            created_at: now,
            updated_at: now,
            chunk_id: "chunk-1".into(),
            make: "Toyota".into(),
            model: "Camry".into(),
            year_start: Some(2016),
            year_end: None,
            related_dtc_codes: vec!["P0420".into()],
        })
        .await
        .expect("store mention");

        let stats = link_vehicles_for_document(&db, "doc-1")
            .await
            .expect("link vehicles");
        assert_eq!(stats.vehicles_created, 0);
        assert_eq!(stats.fitments_created, 1);

        let catalog: Vec<VehicleCatalogEntry> = db.get_all_stored_items().await.expect("catalog");
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn creates_catalog_entry_on_first_sighting() {
        let db = SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
            .await
            .expect("in-memory db");
        let now = chrono::Utc::now();

        seed_chunk(&db, "chunk-1", "doc-1").await;

        db.store_item(DtcCode {
            id: "dtc-1".into(),
            created_at: now,
            updated_at: now,
            code: "P0420".into(),
            description: "Catalyst efficiency".into(),
            category: "emissions".into(),
            severity: "moderate".into(),
            confidence: 0.0,
            source_count: 1,
        })
        .await
        .expect("store refined dtc code");

        db.store_item(VehicleMention {
            id: "mention-1".into(),
            created_at: now,
            updated_at: now,
            chunk_id: "chunk-1".into(),
            make: "Honda".into(),
            model: "Civic".into(),
            year_start: Some(2018),
            year_end: Some(2020),
            related_dtc_codes: vec!["P0420".into()],
        })
        .await
        .expect("store mention");

        let stats = link_vehicles_for_document(&db, "doc-1")
            .await
            .expect("link vehicles");
        assert_eq!(stats.vehicles_created, 1);
        assert_eq!(stats.fitments_created, 1);
    }
}
