//! Postgres-backed dispensary store.
//!
//! Commits run inside SQL transactions with `SELECT ... FOR UPDATE` row
//! locks, which is the relational expression of the single-writer-per-vial
//! and single-writer-per-staged-dose contract.
//!
//! ## Error Mapping
//!
//! SQLx errors map to [`StoreError`] as follows:
//!
//! | PostgreSQL error code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `55P03` (lock not available) | `Timeout` | Row lock not acquired within `lock_timeout` |
//! | `23505` (unique violation) | `Conflict` | Duplicate id insert (concurrent writer) |
//! | other database errors | `Persistence` | Constraint/connection failures |
//! | pool timeout | `Timeout` | No connection available |
//! | decode failures | `Corrupt` | Stored row does not match the schema |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use rxcustody_audit::{DeaTransaction, DeaTransactionId, PatientSnapshot, TransactionSource};
use rxcustody_core::{PatientId, RecordId, UserId, Volume};
use rxcustody_dispensing::{
    Dispense, DispenseId, DoseStatus, SignatureStatus, StagedDose, StagedDoseId,
};
use rxcustody_vials::{DrugFilter, Vial, VialId, VialStatus};

use super::r#trait::{
    DiscardCommit, DispensaryStore, DispenseCommit, DispenseReceipt, StagingCommit, StoreError,
    StoreResult,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vials (
        id UUID PRIMARY KEY,
        external_id BIGINT NOT NULL,
        label TEXT NOT NULL,
        drug_name TEXT NOT NULL,
        controlled BOOLEAN NOT NULL,
        capacity_hundredths BIGINT NOT NULL CHECK (capacity_hundredths > 0),
        remaining_hundredths BIGINT NOT NULL
            CHECK (remaining_hundredths >= 0 AND remaining_hundredths <= capacity_hundredths),
        status TEXT NOT NULL,
        expiration DATE NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staged_doses (
        id UUID PRIMARY KEY,
        patient_id UUID,
        patient_name TEXT,
        dose_hundredths BIGINT NOT NULL,
        waste_hundredths BIGINT NOT NULL,
        unit_count INTEGER NOT NULL CHECK (unit_count >= 1),
        total_hundredths BIGINT NOT NULL,
        vial_id UUID,
        vial_label TEXT,
        staged_for DATE NOT NULL,
        status TEXT NOT NULL,
        dea_transaction_id UUID,
        dispense_id UUID,
        notes TEXT,
        staged_by UUID NOT NULL,
        staged_at TIMESTAMPTZ NOT NULL,
        version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispenses (
        id UUID PRIMARY KEY,
        vial_id UUID,
        patient_id UUID,
        total_hundredths BIGINT NOT NULL,
        waste_hundredths BIGINT NOT NULL,
        unit_count INTEGER NOT NULL,
        dose_per_unit_hundredths BIGINT NOT NULL,
        signature TEXT NOT NULL,
        prescriber TEXT,
        dispensed_by UUID NOT NULL,
        dispensed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dea_transactions (
        id UUID PRIMARY KEY,
        dispense_id UUID,
        vial_id UUID NOT NULL,
        patient_id UUID,
        patient_name TEXT,
        patient_address TEXT,
        patient_phone TEXT,
        drug_name TEXT NOT NULL,
        quantity_hundredths BIGINT NOT NULL,
        units INTEGER NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        notes TEXT NOT NULL,
        source TEXT NOT NULL,
        recorded_by UUID NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staged_doses_vial ON staged_doses (vial_id)",
    "CREATE INDEX IF NOT EXISTS idx_dispenses_vial ON dispenses (vial_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_dea_transactions_dispense
         ON dea_transactions (dispense_id) WHERE dispense_id IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_dea_transactions_vial ON dea_transactions (vial_id)",
];

/// Postgres-backed dispensary store.
///
/// Uses the SQLx connection pool (thread-safe, `Arc + Send + Sync`). All
/// multi-row commits run in a transaction; a failed commit rolls back
/// entirely, so callers never observe partial writes.
#[derive(Debug, Clone)]
pub struct PostgresDispensaryStore {
    pool: Arc<PgPool>,
}

impl PostgresDispensaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the four ledger tables and their indexes if absent.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn begin(&self, op: &str) -> StoreResult<Transaction<'_, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        // Bound lock waits so a contended row fails cleanly instead of
        // hanging the request.
        sqlx::query("SET LOCAL lock_timeout = '5s'")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        Ok(tx)
    }
}

fn map_sqlx_error(op: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("55P03") => StoreError::Timeout(format!("{op}: {db}")),
            Some("23505") => StoreError::Conflict(format!("{op}: {db}")),
            _ => StoreError::Persistence(format!("{op}: {db}")),
        },
        sqlx::Error::PoolTimedOut => StoreError::Timeout(format!("{op}: connection pool timed out")),
        _ => StoreError::Persistence(format!("{op}: {e}")),
    }
}

fn corrupt(e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn vial_status_to_str(status: VialStatus) -> &'static str {
    match status {
        VialStatus::Active => "active",
        VialStatus::Retired => "retired",
    }
}

fn vial_status_from_str(s: &str) -> StoreResult<VialStatus> {
    match s {
        "active" => Ok(VialStatus::Active),
        "retired" => Ok(VialStatus::Retired),
        other => Err(StoreError::Corrupt(format!("unknown vial status '{other}'"))),
    }
}

fn dose_status_from_str(s: &str) -> StoreResult<DoseStatus> {
    match s {
        "staged" => Ok(DoseStatus::Staged),
        "dispensed" => Ok(DoseStatus::Dispensed),
        "discarded" => Ok(DoseStatus::Discarded),
        other => Err(StoreError::Corrupt(format!("unknown dose status '{other}'"))),
    }
}

fn signature_to_str(status: SignatureStatus) -> &'static str {
    match status {
        SignatureStatus::Awaiting => "awaiting",
        SignatureStatus::Signed => "signed",
    }
}

fn signature_from_str(s: &str) -> StoreResult<SignatureStatus> {
    match s {
        "awaiting" => Ok(SignatureStatus::Awaiting),
        "signed" => Ok(SignatureStatus::Signed),
        other => Err(StoreError::Corrupt(format!(
            "unknown signature status '{other}'"
        ))),
    }
}

fn source_to_str(source: TransactionSource) -> &'static str {
    match source {
        TransactionSource::PrefillStaging => "prefill_staging",
        TransactionSource::Dispense => "dispense",
    }
}

fn source_from_str(s: &str) -> StoreResult<TransactionSource> {
    match s {
        "prefill_staging" => Ok(TransactionSource::PrefillStaging),
        "dispense" => Ok(TransactionSource::Dispense),
        other => Err(StoreError::Corrupt(format!(
            "unknown transaction source '{other}'"
        ))),
    }
}

fn vial_from_row(row: &PgRow) -> StoreResult<Vial> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    Ok(Vial {
        id: VialId::new(RecordId::from_uuid(row.try_get("id").map_err(corrupt)?)),
        external_id: row.try_get("external_id").map_err(corrupt)?,
        label: row.try_get("label").map_err(corrupt)?,
        drug_name: row.try_get("drug_name").map_err(corrupt)?,
        controlled: row.try_get("controlled").map_err(corrupt)?,
        capacity: Volume::from_hundredths(row.try_get("capacity_hundredths").map_err(corrupt)?),
        remaining: Volume::from_hundredths(row.try_get("remaining_hundredths").map_err(corrupt)?),
        status: vial_status_from_str(&status)?,
        expiration: row.try_get("expiration").map_err(corrupt)?,
        received_at: row.try_get("received_at").map_err(corrupt)?,
        version: row.try_get::<i64, _>("version").map_err(corrupt)? as u64,
    })
}

fn staged_dose_from_row(row: &PgRow) -> StoreResult<StagedDose> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    Ok(StagedDose {
        id: StagedDoseId::new(RecordId::from_uuid(row.try_get("id").map_err(corrupt)?)),
        patient_id: row
            .try_get::<Option<Uuid>, _>("patient_id")
            .map_err(corrupt)?
            .map(PatientId::from_uuid),
        patient_name: row.try_get("patient_name").map_err(corrupt)?,
        dose_volume: Volume::from_hundredths(row.try_get("dose_hundredths").map_err(corrupt)?),
        waste_volume: Volume::from_hundredths(row.try_get("waste_hundredths").map_err(corrupt)?),
        unit_count: row.try_get::<i32, _>("unit_count").map_err(corrupt)? as u32,
        total_volume: Volume::from_hundredths(row.try_get("total_hundredths").map_err(corrupt)?),
        vial_id: row
            .try_get::<Option<Uuid>, _>("vial_id")
            .map_err(corrupt)?
            .map(|u| VialId::new(RecordId::from_uuid(u))),
        vial_label: row.try_get("vial_label").map_err(corrupt)?,
        staged_for: row.try_get("staged_for").map_err(corrupt)?,
        status: dose_status_from_str(&status)?,
        dea_transaction_id: row
            .try_get::<Option<Uuid>, _>("dea_transaction_id")
            .map_err(corrupt)?
            .map(|u| DeaTransactionId::new(RecordId::from_uuid(u))),
        dispense_id: row
            .try_get::<Option<Uuid>, _>("dispense_id")
            .map_err(corrupt)?
            .map(|u| DispenseId::new(RecordId::from_uuid(u))),
        notes: row.try_get("notes").map_err(corrupt)?,
        staged_by: UserId::from_uuid(row.try_get("staged_by").map_err(corrupt)?),
        staged_at: row.try_get("staged_at").map_err(corrupt)?,
        version: row.try_get::<i64, _>("version").map_err(corrupt)? as u64,
    })
}

fn dispense_from_row(row: &PgRow) -> StoreResult<Dispense> {
    let signature: String = row.try_get("signature").map_err(corrupt)?;
    Ok(Dispense {
        id: DispenseId::new(RecordId::from_uuid(row.try_get("id").map_err(corrupt)?)),
        vial_id: row
            .try_get::<Option<Uuid>, _>("vial_id")
            .map_err(corrupt)?
            .map(|u| VialId::new(RecordId::from_uuid(u))),
        patient_id: row
            .try_get::<Option<Uuid>, _>("patient_id")
            .map_err(corrupt)?
            .map(PatientId::from_uuid),
        total_volume: Volume::from_hundredths(row.try_get("total_hundredths").map_err(corrupt)?),
        total_waste: Volume::from_hundredths(row.try_get("waste_hundredths").map_err(corrupt)?),
        unit_count: row.try_get::<i32, _>("unit_count").map_err(corrupt)? as u32,
        dose_per_unit: Volume::from_hundredths(
            row.try_get("dose_per_unit_hundredths").map_err(corrupt)?,
        ),
        signature: signature_from_str(&signature)?,
        prescriber: row.try_get("prescriber").map_err(corrupt)?,
        dispensed_by: UserId::from_uuid(row.try_get("dispensed_by").map_err(corrupt)?),
        dispensed_at: row.try_get("dispensed_at").map_err(corrupt)?,
    })
}

fn dea_transaction_from_row(row: &PgRow) -> StoreResult<DeaTransaction> {
    let source: String = row.try_get("source").map_err(corrupt)?;
    Ok(DeaTransaction {
        id: DeaTransactionId::new(RecordId::from_uuid(row.try_get("id").map_err(corrupt)?)),
        dispense_id: row
            .try_get::<Option<Uuid>, _>("dispense_id")
            .map_err(corrupt)?
            .map(RecordId::from_uuid),
        vial_id: VialId::new(RecordId::from_uuid(row.try_get("vial_id").map_err(corrupt)?)),
        patient: PatientSnapshot {
            patient_id: row
                .try_get::<Option<Uuid>, _>("patient_id")
                .map_err(corrupt)?
                .map(PatientId::from_uuid),
            name: row.try_get("patient_name").map_err(corrupt)?,
            address: row.try_get("patient_address").map_err(corrupt)?,
            phone: row.try_get("patient_phone").map_err(corrupt)?,
        },
        drug_name: row.try_get("drug_name").map_err(corrupt)?,
        quantity: Volume::from_hundredths(row.try_get("quantity_hundredths").map_err(corrupt)?),
        units: row.try_get::<i32, _>("units").map_err(corrupt)? as u32,
        recorded_at: row.try_get("recorded_at").map_err(corrupt)?,
        notes: row.try_get("notes").map_err(corrupt)?,
        source: source_from_str(&source)?,
        recorded_by: UserId::from_uuid(row.try_get("recorded_by").map_err(corrupt)?),
    })
}

async fn insert_dea_transaction_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: &DeaTransaction,
    op: &str,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dea_transactions (
            id, dispense_id, vial_id,
            patient_id, patient_name, patient_address, patient_phone,
            drug_name, quantity_hundredths, units, recorded_at, notes, source, recorded_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(entry.id.0.as_uuid())
    .bind(entry.dispense_id.map(|id| *id.as_uuid()))
    .bind(entry.vial_id.0.as_uuid())
    .bind(entry.patient.patient_id.map(|id| *id.as_uuid()))
    .bind(&entry.patient.name)
    .bind(&entry.patient.address)
    .bind(&entry.patient.phone)
    .bind(&entry.drug_name)
    .bind(entry.quantity.hundredths())
    .bind(entry.units as i32)
    .bind(entry.recorded_at)
    .bind(&entry.notes)
    .bind(source_to_str(entry.source))
    .bind(entry.recorded_by.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(op, e))?;
    Ok(())
}

/// Append a note line to an entry inside an open transaction. Returns
/// whether a row was actually annotated.
async fn annotate_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: DeaTransactionId,
    note: &str,
    op: &str,
) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE dea_transactions
        SET notes = CASE WHEN notes = '' THEN $2 ELSE notes || E'\n' || $2 END
        WHERE id = $1
        "#,
    )
    .bind(id.0.as_uuid())
    .bind(note)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(op, e))?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl DispensaryStore for PostgresDispensaryStore {
    #[instrument(skip(self, vial), fields(vial_id = %vial.id), err)]
    async fn insert_vial(&self, vial: Vial) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vials (
                id, external_id, label, drug_name, controlled,
                capacity_hundredths, remaining_hundredths, status,
                expiration, received_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(vial.id.0.as_uuid())
        .bind(vial.external_id)
        .bind(&vial.label)
        .bind(&vial.drug_name)
        .bind(vial.controlled)
        .bind(vial.capacity.hundredths())
        .bind(vial.remaining.hundredths())
        .bind(vial_status_to_str(vial.status))
        .bind(vial.expiration)
        .bind(vial.received_at)
        .bind(vial.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_vial", e))?;
        Ok(())
    }

    async fn vial(&self, id: VialId) -> StoreResult<Option<Vial>> {
        let row = sqlx::query("SELECT * FROM vials WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("vial", e))?;
        row.as_ref().map(vial_from_row).transpose()
    }

    async fn vials(&self) -> StoreResult<Vec<Vial>> {
        let rows = sqlx::query("SELECT * FROM vials ORDER BY external_id ASC, id ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("vials", e))?;
        rows.iter().map(vial_from_row).collect()
    }

    async fn select_eligible_vial(
        &self,
        filter: &DrugFilter,
        minimum: Volume,
        as_of: NaiveDate,
    ) -> StoreResult<Option<Vial>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM vials
            WHERE status = 'active'
              AND lower(drug_name) = lower($1)
              AND expiration >= $2
              AND remaining_hundredths >= $3
            ORDER BY expiration ASC, external_id ASC
            LIMIT 1
            "#,
        )
        .bind(&filter.drug_name)
        .bind(as_of)
        .bind(minimum.hundredths())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_eligible_vial", e))?;
        row.as_ref().map(vial_from_row).transpose()
    }

    async fn staged_dose(&self, id: StagedDoseId) -> StoreResult<Option<StagedDose>> {
        let row = sqlx::query("SELECT * FROM staged_doses WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("staged_dose", e))?;
        row.as_ref().map(staged_dose_from_row).transpose()
    }

    async fn staged_doses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<StagedDose>> {
        let rows = sqlx::query(
            "SELECT * FROM staged_doses WHERE vial_id = $1 ORDER BY staged_at ASC, id ASC",
        )
        .bind(vial_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("staged_doses_for_vial", e))?;
        rows.iter().map(staged_dose_from_row).collect()
    }

    async fn dispense_record(&self, id: DispenseId) -> StoreResult<Option<Dispense>> {
        let row = sqlx::query("SELECT * FROM dispenses WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dispense_record", e))?;
        row.as_ref().map(dispense_from_row).transpose()
    }

    async fn dispenses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<Dispense>> {
        let rows = sqlx::query(
            "SELECT * FROM dispenses WHERE vial_id = $1 ORDER BY dispensed_at ASC, id ASC",
        )
        .bind(vial_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dispenses_for_vial", e))?;
        rows.iter().map(dispense_from_row).collect()
    }

    async fn dea_transaction(&self, id: DeaTransactionId) -> StoreResult<Option<DeaTransaction>> {
        let row = sqlx::query("SELECT * FROM dea_transactions WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dea_transaction", e))?;
        row.as_ref().map(dea_transaction_from_row).transpose()
    }

    async fn dea_transactions_for_vial(
        &self,
        vial_id: VialId,
    ) -> StoreResult<Vec<DeaTransaction>> {
        let rows = sqlx::query(
            "SELECT * FROM dea_transactions WHERE vial_id = $1 ORDER BY recorded_at ASC, id ASC",
        )
        .bind(vial_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dea_transactions_for_vial", e))?;
        rows.iter().map(dea_transaction_from_row).collect()
    }

    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.id), err)]
    async fn record_dea_transaction(&self, transaction: DeaTransaction) -> StoreResult<()> {
        let mut tx = self.begin("record_dea_transaction").await?;
        insert_dea_transaction_tx(&mut tx, &transaction, "record_dea_transaction").await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_dea_transaction", e))
    }

    #[instrument(skip(self, note), fields(transaction_id = %id), err)]
    async fn annotate_dea_transaction(&self, id: DeaTransactionId, note: &str) -> StoreResult<()> {
        let mut tx = self.begin("annotate_dea_transaction").await?;
        if !annotate_tx(&mut tx, id, note, "annotate_dea_transaction").await? {
            return Err(StoreError::MissingRow(format!("dea transaction {id}")));
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("annotate_dea_transaction", e))
    }

    #[instrument(
        skip(self, commit),
        fields(vial_id = %commit.vial.id, staged_dose_id = %commit.staged_dose.id),
        err
    )]
    async fn commit_staging(&self, commit: StagingCommit) -> StoreResult<()> {
        let op = "commit_staging";
        let mut tx = self.begin(op).await?;

        // Row lock across the read-decide-write window.
        let row = sqlx::query("SELECT version FROM vials WHERE id = $1 FOR UPDATE")
            .bind(commit.vial.id.0.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        let current: i64 = match row {
            Some(row) => row.try_get("version").map_err(corrupt)?,
            None => return Err(StoreError::MissingRow(format!("vial {}", commit.vial.id))),
        };
        if current as u64 != commit.vial.version {
            return Err(StoreError::Conflict(format!(
                "vial {}: expected version {}, found {current}",
                commit.vial.id, commit.vial.version
            )));
        }

        sqlx::query(
            "UPDATE vials SET remaining_hundredths = $2, version = version + 1 WHERE id = $1",
        )
        .bind(commit.vial.id.0.as_uuid())
        .bind(commit.vial.remaining.hundredths())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        insert_dea_transaction_tx(&mut tx, &commit.transaction, op).await?;

        let dose = &commit.staged_dose;
        sqlx::query(
            r#"
            INSERT INTO staged_doses (
                id, patient_id, patient_name,
                dose_hundredths, waste_hundredths, unit_count, total_hundredths,
                vial_id, vial_label, staged_for, status,
                dea_transaction_id, dispense_id, notes, staged_by, staged_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(dose.id.0.as_uuid())
        .bind(dose.patient_id.map(|id| *id.as_uuid()))
        .bind(&dose.patient_name)
        .bind(dose.dose_volume.hundredths())
        .bind(dose.waste_volume.hundredths())
        .bind(dose.unit_count as i32)
        .bind(dose.total_volume.hundredths())
        .bind(dose.vial_id.map(|id| *id.0.as_uuid()))
        .bind(&dose.vial_label)
        .bind(dose.staged_for)
        .bind(dose.status.to_string())
        .bind(dose.dea_transaction_id.map(|id| *id.0.as_uuid()))
        .bind(dose.dispense_id.map(|id| *id.0.as_uuid()))
        .bind(&dose.notes)
        .bind(dose.staged_by.as_uuid())
        .bind(dose.staged_at)
        .bind(dose.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(op, e))
    }

    #[instrument(
        skip(self, commit),
        fields(staged_dose_id = %commit.staged_dose.id, dispense_id = %commit.dispense.id),
        err
    )]
    async fn commit_dispense(&self, commit: DispenseCommit) -> StoreResult<DispenseReceipt> {
        let op = "commit_dispense";
        let mut tx = self.begin(op).await?;

        let row = sqlx::query("SELECT version FROM staged_doses WHERE id = $1 FOR UPDATE")
            .bind(commit.staged_dose.id.0.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        let current: i64 = match row {
            Some(row) => row.try_get("version").map_err(corrupt)?,
            None => {
                return Err(StoreError::MissingRow(format!(
                    "staged dose {}",
                    commit.staged_dose.id
                )))
            }
        };
        if current as u64 != commit.staged_dose.version {
            return Err(StoreError::Conflict(format!(
                "staged dose {}: expected version {}, found {current}",
                commit.staged_dose.id, commit.staged_dose.version
            )));
        }

        let d = &commit.dispense;
        sqlx::query(
            r#"
            INSERT INTO dispenses (
                id, vial_id, patient_id,
                total_hundredths, waste_hundredths, unit_count, dose_per_unit_hundredths,
                signature, prescriber, dispensed_by, dispensed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(d.id.0.as_uuid())
        .bind(d.vial_id.map(|id| *id.0.as_uuid()))
        .bind(d.patient_id.map(|id| *id.as_uuid()))
        .bind(d.total_volume.hundredths())
        .bind(d.total_waste.hundredths())
        .bind(d.unit_count as i32)
        .bind(d.dose_per_unit.hundredths())
        .bind(signature_to_str(d.signature))
        .bind(&d.prescriber)
        .bind(d.dispensed_by.as_uuid())
        .bind(d.dispensed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        // Finalization entry: idempotent upsert keyed per dispense. The
        // merge fills empty snapshot fields only and never edits notes.
        let dea_transaction_id = match &commit.finalization {
            Some(candidate) => {
                let existing =
                    sqlx::query("SELECT id FROM dea_transactions WHERE dispense_id = $1 FOR UPDATE")
                        .bind(d.id.0.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error(op, e))?;
                match existing {
                    Some(row) => {
                        let id: Uuid = row.try_get("id").map_err(corrupt)?;
                        sqlx::query(
                            r#"
                            UPDATE dea_transactions
                            SET quantity_hundredths = $2,
                                units = $3,
                                recorded_at = $4,
                                patient_id = COALESCE(patient_id, $5),
                                patient_name = COALESCE(patient_name, $6),
                                patient_address = COALESCE(patient_address, $7),
                                patient_phone = COALESCE(patient_phone, $8),
                                drug_name = CASE WHEN drug_name = '' THEN $9 ELSE drug_name END
                            WHERE id = $1
                            "#,
                        )
                        .bind(id)
                        .bind(candidate.quantity.hundredths())
                        .bind(candidate.units as i32)
                        .bind(candidate.recorded_at)
                        .bind(candidate.patient.patient_id.map(|p| *p.as_uuid()))
                        .bind(&candidate.patient.name)
                        .bind(&candidate.patient.address)
                        .bind(&candidate.patient.phone)
                        .bind(&candidate.drug_name)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error(op, e))?;
                        Some(DeaTransactionId::new(RecordId::from_uuid(id)))
                    }
                    None => {
                        insert_dea_transaction_tx(&mut tx, candidate, op).await?;
                        Some(candidate.id)
                    }
                }
            }
            None => None,
        };

        if let Some((staging_id, note)) = &commit.supersede {
            if !annotate_tx(&mut tx, *staging_id, note, op).await? {
                tracing::warn!(
                    transaction = %staging_id,
                    "staging transaction missing; supersede annotation skipped"
                );
            }
        }

        let dose = &commit.staged_dose;
        sqlx::query(
            r#"
            UPDATE staged_doses
            SET status = $2, dispense_id = $3, version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(dose.id.0.as_uuid())
        .bind(dose.status.to_string())
        .bind(dose.dispense_id.map(|id| *id.0.as_uuid()))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(op, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
        Ok(DispenseReceipt { dea_transaction_id })
    }

    #[instrument(skip(self, commit), fields(staged_dose_id = %commit.staged_dose.id), err)]
    async fn commit_discard(&self, commit: DiscardCommit) -> StoreResult<()> {
        let op = "commit_discard";
        let mut tx = self.begin(op).await?;

        let row = sqlx::query("SELECT version FROM staged_doses WHERE id = $1 FOR UPDATE")
            .bind(commit.staged_dose.id.0.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        let current: i64 = match row {
            Some(row) => row.try_get("version").map_err(corrupt)?,
            None => {
                return Err(StoreError::MissingRow(format!(
                    "staged dose {}",
                    commit.staged_dose.id
                )))
            }
        };
        if current as u64 != commit.staged_dose.version {
            return Err(StoreError::Conflict(format!(
                "staged dose {}: expected version {}, found {current}",
                commit.staged_dose.id, commit.staged_dose.version
            )));
        }

        if let Some(vial) = &commit.vial {
            let row = sqlx::query("SELECT version FROM vials WHERE id = $1 FOR UPDATE")
                .bind(vial.id.0.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
            let current: i64 = match row {
                Some(row) => row.try_get("version").map_err(corrupt)?,
                None => return Err(StoreError::MissingRow(format!("vial {}", vial.id))),
            };
            if current as u64 != vial.version {
                return Err(StoreError::Conflict(format!(
                    "vial {}: expected version {}, found {current}",
                    vial.id, vial.version
                )));
            }
            sqlx::query(
                "UPDATE vials SET remaining_hundredths = $2, version = version + 1 WHERE id = $1",
            )
            .bind(vial.id.0.as_uuid())
            .bind(vial.remaining.hundredths())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        }

        if let Some((staging_id, note)) = &commit.void {
            if !annotate_tx(&mut tx, *staging_id, note, op).await? {
                tracing::warn!(
                    transaction = %staging_id,
                    "staging transaction missing; void annotation skipped"
                );
            }
        }

        sqlx::query("UPDATE staged_doses SET status = $2, version = version + 1 WHERE id = $1")
            .bind(commit.staged_dose.id.0.as_uuid())
            .bind(commit.staged_dose.status.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(op, e))
    }
}
