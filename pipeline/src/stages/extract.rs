//! Pulls structured DTC knowledge out of the chunks an evaluation pass
//! judged relevant enough to be worth an LLM extraction call.

use std::time::Instant;

use serde::Deserialize;

use common::error::AppError;
use common::storage::types::chunk::{Chunk, ChunkEvaluation};
use common::storage::types::document::{Document, ProcessingStage};
use common::storage::types::refined::{
    Cause, DiagnosticStep, DtcChunkLink, DtcCode, Sensor, TsbReference, VehicleMention,
};

use crate::context::StageContext;
use crate::stages::{begin_stage, complete_stage, fail_stage, parse_json_with_fallbacks};

const STAGE_LABEL: &str = "extracting";
const MIN_RELEVANCE: f64 = 0.3;
const SYSTEM_PROMPT: &str = "You are an automotive diagnostics extraction engine. \
Given a chunk of technical text, extract DTC codes, causes, diagnostic steps, \
sensors, and TSB references. Respond with JSON only, matching exactly this shape: \
{\"dtc_codes\": [{\"code\": string, \"description\": string, \"category\": string, \"severity\": string}], \
\"causes\": [{\"dtc_code\": string, \"text\": string, \"likelihood\": number}], \
\"diagnostic_steps\": [{\"dtc_code\": string, \"step_order\": number, \"text\": string, \"tools\": [string], \"expected_values\": string|null}], \
\"sensors\": [{\"name\": string, \"sensor_type\": string, \"related_dtc_codes\": [string]}], \
\"tsb_references\": [{\"tsb_number\": string, \"dtc_code\": string|null, \"summary\": string}], \
\"vehicle_mentions\": [{\"make\": string, \"model\": string, \"year_start\": number|null, \"year_end\": number|null, \"related_dtc_codes\": [string]}]}. \
Return empty arrays for anything absent from the text.";

#[derive(Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    dtc_codes: Vec<RawDtcCode>,
    #[serde(default)]
    causes: Vec<RawCause>,
    #[serde(default)]
    diagnostic_steps: Vec<RawDiagnosticStep>,
    #[serde(default)]
    sensors: Vec<RawSensor>,
    #[serde(default)]
    tsb_references: Vec<RawTsb>,
    #[serde(default)]
    vehicle_mentions: Vec<RawVehicleMention>,
}

#[derive(Deserialize)]
struct RawDtcCode {
    code: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    severity: String,
}

#[derive(Deserialize)]
struct RawCause {
    dtc_code: String,
    text: String,
    #[serde(default)]
    likelihood: f64,
}

#[derive(Deserialize)]
struct RawDiagnosticStep {
    dtc_code: String,
    #[serde(default)]
    step_order: u32,
    text: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    expected_values: Option<String>,
}

#[derive(Deserialize)]
struct RawSensor {
    name: String,
    #[serde(default)]
    sensor_type: String,
    #[serde(default)]
    related_dtc_codes: Vec<String>,
}

#[derive(Deserialize)]
struct RawTsb {
    tsb_number: String,
    #[serde(default)]
    dtc_code: Option<String>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RawVehicleMention {
    make: String,
    model: String,
    #[serde(default)]
    year_start: Option<u16>,
    #[serde(default)]
    year_end: Option<u16>,
    #[serde(default)]
    related_dtc_codes: Vec<String>,
}

pub async fn run(ctx: &StageContext, document_id: &str) -> Result<(), AppError> {
    let document = ctx
        .db
        .get_item::<Document>(document_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

    let document = begin_stage(ctx, document, STAGE_LABEL, None).await?;

    let started_at = Instant::now();
    match extract_document(ctx, &document).await {
        Ok(()) => {
            complete_stage(
                ctx,
                document,
                STAGE_LABEL,
                started_at,
                ProcessingStage::Extracting,
            )
            .await?;
            Ok(())
        }
        Err(err) => {
            fail_stage(ctx, document, STAGE_LABEL, &err).await?;
            Err(err)
        }
    }
}

async fn extract_document(ctx: &StageContext, document: &Document) -> Result<(), AppError> {
    for chunk in extractable_chunks(ctx, &document.id).await? {
        let user_prompt = format!("Chunk:\n{}", chunk.text);
        let raw_response = ctx
            .llm
            .complete(SYSTEM_PROMPT, &user_prompt, true, 0.1)
            .await?;
        let Some(extraction) = parse_json_with_fallbacks::<RawExtraction>(&raw_response) else {
            tracing::warn!(chunk_id = %chunk.id, "unparseable extraction response, skipping chunk");
            continue;
        };

        let mut code_ids = std::collections::HashMap::new();
        for raw_dtc in &extraction.dtc_codes {
            let dtc_id = upsert_dtc_code(ctx, raw_dtc).await?;
            link_chunk(ctx, &dtc_id, &chunk.id).await?;
            code_ids.insert(raw_dtc.code.to_ascii_uppercase(), dtc_id);
        }

        for raw_cause in &extraction.causes {
            if let Some(dtc_id) = code_ids.get(&normalize_code(&raw_cause.dtc_code)) {
                insert_cause(ctx, dtc_id, &chunk.id, raw_cause).await?;
            }
        }

        for raw_step in &extraction.diagnostic_steps {
            if let Some(dtc_id) = code_ids.get(&normalize_code(&raw_step.dtc_code)) {
                insert_diagnostic_step(ctx, dtc_id, &chunk.id, raw_step).await?;
            }
        }

        for raw_sensor in &extraction.sensors {
            upsert_sensor(ctx, &chunk.id, raw_sensor).await?;
        }

        for raw_tsb in &extraction.tsb_references {
            let dtc_id = raw_tsb
                .dtc_code
                .as_ref()
                .and_then(|code| code_ids.get(&normalize_code(code)))
                .cloned();
            upsert_tsb(ctx, &chunk.id, dtc_id, raw_tsb).await?;
        }

        for raw_mention in &extraction.vehicle_mentions {
            insert_vehicle_mention(ctx, &chunk.id, raw_mention).await?;
        }
    }

    Ok(())
}

fn normalize_code(raw: &str) -> String {
    DtcCode::normalize_code(raw)
}

async fn extractable_chunks(ctx: &StageContext, document_id: &str) -> Result<Vec<Chunk>, AppError> {
    let chunks: Vec<Chunk> = ctx
        .db
        .query("SELECT * FROM chunk WHERE document_id = $document_id ORDER BY chunk_index ASC")
        .bind(("document_id", document_id.to_string()))
        .await
        .map_err(AppError::Database)?
        .take(0)
        .map_err(AppError::Database)?;

    let mut selected = Vec::new();
    for chunk in chunks {
        let evaluation: Option<ChunkEvaluation> = ctx.db.get_item(&chunk.id).await?;
        let relevant = evaluation
            .as_ref()
            .is_none_or(|e| e.relevance >= MIN_RELEVANCE);
        if relevant {
            selected.push(chunk);
        }
    }
    Ok(selected)
}

async fn upsert_dtc_code(ctx: &StageContext, raw: &RawDtcCode) -> Result<String, AppError> {
    let code = DtcCode::normalize_code(&raw.code);
    let existing: Option<DtcCode> = {
        let mut response = ctx
            .db
            .query("SELECT * FROM refined_dtc_code WHERE code = $code LIMIT 1")
            .bind(("code", code.clone()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let now = chrono::Utc::now();
    let dtc = match existing {
        Some(mut current) => {
            if current.description.is_empty() && !raw.description.is_empty() {
                current.description = raw.description.clone();
            }
            if current.category.is_empty() && !raw.category.is_empty() {
                current.category = raw.category.clone();
            }
            if current.severity.is_empty() && !raw.severity.is_empty() {
                current.severity = raw.severity.clone();
            }
            current.source_count = current.source_count.saturating_add(1);
            current.updated_at = now;
            current
        }
        None => DtcCode {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            code: code.clone(),
            description: raw.description.clone(),
            category: raw.category.clone(),
            severity: raw.severity.clone(),
            confidence: 0.0,
            source_count: 1,
        },
    };

    let id = dtc.id.clone();
    ctx.db.update_item(dtc).await?;
    Ok(id)
}

async fn link_chunk(ctx: &StageContext, dtc_id: &str, chunk_id: &str) -> Result<(), AppError> {
    let existing: Option<DtcChunkLink> = {
        let mut response = ctx
            .db
            .query(
                "SELECT * FROM refined_dtc_chunk_link WHERE dtc_id = $dtc_id AND chunk_id = $chunk_id LIMIT 1",
            )
            .bind(("dtc_id", dtc_id.to_string()))
            .bind(("chunk_id", chunk_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };
    if existing.is_some() {
        return Ok(());
    }

    let now = chrono::Utc::now();
    ctx.db
        .store_item(DtcChunkLink {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            dtc_id: dtc_id.to_string(),
            chunk_id: chunk_id.to_string(),
        })
        .await?;
    Ok(())
}

async fn insert_cause(
    ctx: &StageContext,
    dtc_id: &str,
    chunk_id: &str,
    raw: &RawCause,
) -> Result<(), AppError> {
    let now = chrono::Utc::now();
    ctx.db
        .store_item(Cause {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            dtc_id: dtc_id.to_string(),
            chunk_id: chunk_id.to_string(),
            text: raw.text.clone(),
            likelihood: raw.likelihood.clamp(0.0, 1.0),
        })
        .await?;
    Ok(())
}

async fn insert_diagnostic_step(
    ctx: &StageContext,
    dtc_id: &str,
    chunk_id: &str,
    raw: &RawDiagnosticStep,
) -> Result<(), AppError> {
    let now = chrono::Utc::now();
    ctx.db
        .store_item(DiagnosticStep {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            dtc_id: dtc_id.to_string(),
            chunk_id: chunk_id.to_string(),
            step_order: raw.step_order,
            text: raw.text.clone(),
            tools: raw.tools.clone(),
            expected_values: raw.expected_values.clone(),
        })
        .await?;
    Ok(())
}

async fn upsert_sensor(ctx: &StageContext, chunk_id: &str, raw: &RawSensor) -> Result<(), AppError> {
    let existing: Option<Sensor> = {
        let mut response = ctx
            .db
            .query(
                "SELECT * FROM refined_sensor WHERE name = $name AND sensor_type = $sensor_type LIMIT 1",
            )
            .bind(("name", raw.name.clone()))
            .bind(("sensor_type", raw.sensor_type.clone()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let now = chrono::Utc::now();
    let sensor = match existing {
        Some(mut current) => {
            for code in &raw.related_dtc_codes {
                let normalized = normalize_code(code);
                if !current.related_dtc_codes.contains(&normalized) {
                    current.related_dtc_codes.push(normalized);
                }
            }
            current.updated_at = now;
            current
        }
        None => Sensor {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: raw.name.clone(),
            sensor_type: raw.sensor_type.clone(),
            related_dtc_codes: raw
                .related_dtc_codes
                .iter()
                .map(|code| normalize_code(code))
                .collect(),
            chunk_id: chunk_id.to_string(),
        },
    };
    ctx.db.update_item(sensor).await?;
    Ok(())
}

async fn upsert_tsb(
    ctx: &StageContext,
    chunk_id: &str,
    dtc_id: Option<String>,
    raw: &RawTsb,
) -> Result<(), AppError> {
    let existing: Option<TsbReference> = {
        let mut response = ctx
            .db
            .query("SELECT * FROM refined_tsb_reference WHERE tsb_number = $tsb_number LIMIT 1")
            .bind(("tsb_number", raw.tsb_number.clone()))
            .await
            .map_err(AppError::Database)?;
        response.take(0).map_err(AppError::Database)?
    };

    let now = chrono::Utc::now();
    let tsb = match existing {
        Some(mut current) => {
            if current.dtc_id.is_none() {
                current.dtc_id = dtc_id;
            }
            if current.summary.is_empty() {
                current.summary = raw.summary.clone();
            }
            current.updated_at = now;
            current
        }
        None => TsbReference {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tsb_number: raw.tsb_number.clone(),
            dtc_id,
            chunk_id: chunk_id.to_string(),
            summary: raw.summary.clone(),
        },
    };
    ctx.db.update_item(tsb).await?;
    Ok(())
}

async fn insert_vehicle_mention(
    ctx: &StageContext,
    chunk_id: &str,
    raw: &RawVehicleMention,
) -> Result<(), AppError> {
    let now = chrono::Utc::now();
    ctx.db
        .store_item(VehicleMention {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id: chunk_id.to_string(),
            make: raw.make.clone(),
            model: raw.model.clone(),
            year_start: raw.year_start,
            year_end: raw.year_end,
            related_dtc_codes: raw
                .related_dtc_codes
                .iter()
                .map(|code| normalize_code(code))
                .collect(),
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_code_upcases_and_trims() {
        assert_eq!(normalize_code("  p0420 "), "P0420");
    }
}
