//! [`DeviceRepository`]: voting devices, kits and the global kit.
//!
//! Exactly one kit carries `is_global`; its membership is the full device
//! set. Every device insert or delete reconciles it inside the same
//! transaction, so no reader ever sees the two out of step.

use std::{collections::HashMap, sync::Arc};

use rusqlite::{Connection, OptionalExtension as _};

use certis_core::device::{
  DeviceId, DeviceKit, DeviceKitAssignment, DeviceKitUpdate, GLOBAL_KIT_NAME,
  GlobalKitSync, KitId, NewDeviceKit, NewVotingDevice, VotingDevice,
  VotingDeviceUpdate,
};

use crate::{Error, Result, error::constraint_error, schema::SchemaState};

/// Kits gained the `is_global` flag in this step.
pub(crate) const GLOBAL_KIT_STEP: u32 = 6;

const KIT_COLUMNS: &str = "id, name, is_default, is_global";

fn kit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceKit> {
  Ok(DeviceKit {
    id:         row.get(0)?,
    name:       row.get(1)?,
    is_default: row.get(2)?,
    is_global:  row.get(3)?,
  })
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VotingDevice> {
  Ok(VotingDevice {
    id:            row.get(0)?,
    name:          row.get(1)?,
    serial_number: row.get(2)?,
  })
}

fn global_kit_id(conn: &Connection) -> rusqlite::Result<Option<KitId>> {
  conn
    .query_row(
      "SELECT id FROM device_kits WHERE is_global = 1 ORDER BY id LIMIT 1",
      [],
      |row| row.get(0),
    )
    .optional()
}

/// The name for a new global kit. A user kit already holding
/// [`GLOBAL_KIT_NAME`] keeps it; the global kit then takes the first free
/// numbered variant.
fn free_global_kit_name(conn: &Connection) -> rusqlite::Result<String> {
  let taken = |name: &str| -> rusqlite::Result<bool> {
    Ok(
      conn
        .query_row(
          "SELECT 1 FROM device_kits WHERE name = ?1",
          rusqlite::params![name],
          |_| Ok(()),
        )
        .optional()?
        .is_some(),
    )
  };

  let mut name = GLOBAL_KIT_NAME.to_owned();
  let mut suffix = 2;
  while taken(&name)? {
    name = format!("{GLOBAL_KIT_NAME} ({suffix})");
    suffix += 1;
  }
  Ok(name)
}

/// Finds or creates the global kit and makes its membership equal the device
/// table. Must run inside the caller's transaction.
fn reconcile_global_kit(conn: &Connection) -> rusqlite::Result<GlobalKitSync> {
  let (kit_id, created) = match global_kit_id(conn)? {
    Some(id) => (id, false),
    None => {
      let name = free_global_kit_name(conn)?;
      conn.execute(
        "INSERT INTO device_kits (name, is_default, is_global) VALUES (?1, 0, 1)",
        rusqlite::params![name],
      )?;
      (conn.last_insert_rowid(), true)
    }
  };

  // Only one kit may carry the flag.
  conn.execute(
    "UPDATE device_kits SET is_global = 0 WHERE is_global = 1 AND id != ?1",
    rusqlite::params![kit_id],
  )?;

  let added = conn.execute(
    "INSERT INTO device_kit_assignments (kit_id, voting_device_id)
     SELECT ?1, v.id FROM voting_devices v
      WHERE NOT EXISTS (
        SELECT 1 FROM device_kit_assignments a
         WHERE a.kit_id = ?1 AND a.voting_device_id = v.id
      )",
    rusqlite::params![kit_id],
  )?;

  let removed = conn.execute(
    "DELETE FROM device_kit_assignments
      WHERE kit_id = ?1
        AND voting_device_id NOT IN (SELECT id FROM voting_devices)",
    rusqlite::params![kit_id],
  )?;

  Ok(GlobalKitSync { kit_id, created, added, removed })
}

fn log_sync(sync: &GlobalKitSync) {
  if sync.created || sync.added > 0 || sync.removed > 0 {
    tracing::debug!(
      kit_id = sync.kit_id,
      created = sync.created,
      added = sync.added,
      removed = sync.removed,
      "reconciled global kit"
    );
  }
}

/// Result of a kit mutation checked inside its transaction.
enum KitOutcome<T> {
  Done(T),
  Missing,
  Protected,
}

#[derive(Clone)]
pub struct DeviceRepository {
  conn:   tokio_rusqlite::Connection,
  schema: Arc<SchemaState>,
}

impl DeviceRepository {
  pub(crate) fn new(
    conn: tokio_rusqlite::Connection,
    schema: Arc<SchemaState>,
  ) -> Self {
    Self { conn, schema }
  }

  // ── Voting devices ────────────────────────────────────────────────────────

  pub async fn add_voting_device(&self, input: NewVotingDevice) -> Result<VotingDevice> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let NewVotingDevice { name, serial_number } = input;
    let (n, serial) = (name.clone(), serial_number.clone());

    let (id, sync) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO voting_devices (name, serial_number) VALUES (?1, ?2)",
          rusqlite::params![n, serial],
        )?;
        let id = tx.last_insert_rowid();
        let sync = reconcile_global_kit(&tx)?;
        tx.commit()?;
        Ok((id, sync))
      })
      .await
      .map_err(constraint_error("voting device", serial_number.clone()))?;

    log_sync(&sync);
    Ok(VotingDevice { id, name, serial_number })
  }

  /// Inserts every device whose serial is new and returns how many were
  /// inserted. Known serials are skipped silently.
  pub async fn bulk_add_voting_devices(
    &self,
    inputs: Vec<NewVotingDevice>,
  ) -> Result<usize> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let requested = inputs.len();

    let (inserted, sync) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO voting_devices (name, serial_number) VALUES (?1, ?2)",
          )?;
          for device in &inputs {
            inserted +=
              stmt.execute(rusqlite::params![device.name, device.serial_number])?;
          }
        }
        let sync = reconcile_global_kit(&tx)?;
        tx.commit()?;
        Ok((inserted, sync))
      })
      .await?;

    log_sync(&sync);
    tracing::info!(requested, inserted, "bulk-added voting devices");
    Ok(inserted)
  }

  pub async fn update_voting_device(
    &self,
    id: DeviceId,
    update: VotingDeviceUpdate,
  ) -> Result<VotingDevice> {
    let mut device = self
      .get_voting_device_by_id(id)
      .await?
      .ok_or(Error::NotFound { entity: "voting device", id })?;
    if let Some(name) = update.name {
      device.name = name;
    }
    if let Some(serial) = update.serial_number {
      device.serial_number = serial;
    }

    let (name, serial) = (device.name.clone(), device.serial_number.clone());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE voting_devices SET name = ?2, serial_number = ?3 WHERE id = ?1",
          rusqlite::params![id, name, serial],
        )?;
        Ok(())
      })
      .await
      .map_err(constraint_error("voting device", device.serial_number.clone()))?;

    Ok(device)
  }

  /// Deletes the device together with its kit and participant assignments.
  pub async fn delete_voting_device(&self, id: DeviceId) -> Result<()> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let (deleted, sync) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let deleted = tx.execute(
          "DELETE FROM voting_devices WHERE id = ?1",
          rusqlite::params![id],
        )?;
        let sync = reconcile_global_kit(&tx)?;
        tx.commit()?;
        Ok((deleted, sync))
      })
      .await?;

    log_sync(&sync);
    if deleted == 0 {
      return Err(Error::NotFound { entity: "voting device", id });
    }
    Ok(())
  }

  async fn query_devices(
    &self,
    sql: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<VotingDevice>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(sql)?;
          let rows = stmt
            .query_map(rusqlite::params_from_iter(params), device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  /// All devices, ordered by name then serial.
  pub async fn get_all_voting_devices(&self) -> Result<Vec<VotingDevice>> {
    self
      .query_devices(
        "SELECT id, name, serial_number FROM voting_devices
          ORDER BY name, serial_number",
        Vec::new(),
      )
      .await
  }

  pub async fn get_voting_device_by_id(&self, id: DeviceId) -> Result<Option<VotingDevice>> {
    Ok(
      self
        .query_devices(
          "SELECT id, name, serial_number FROM voting_devices WHERE id = ?1",
          vec![id.into()],
        )
        .await?
        .pop(),
    )
  }

  pub async fn get_voting_device_by_serial(
    &self,
    serial: &str,
  ) -> Result<Option<VotingDevice>> {
    Ok(
      self
        .query_devices(
          "SELECT id, name, serial_number FROM voting_devices WHERE serial_number = ?1",
          vec![serial.to_owned().into()],
        )
        .await?
        .pop(),
    )
  }

  /// Device id to serial number, as the scoring engine consumes it.
  pub async fn device_serial_map(&self) -> Result<HashMap<DeviceId, String>> {
    Ok(
      self
        .get_all_voting_devices()
        .await?
        .into_iter()
        .map(|d| (d.id, d.serial_number))
        .collect(),
    )
  }

  /// Brings the global kit in line with the device table.
  pub async fn reconcile_global_kit(&self) -> Result<GlobalKitSync> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let sync = self
      .conn
      .call(|conn| {
        let tx = conn.transaction()?;
        let sync = reconcile_global_kit(&tx)?;
        tx.commit()?;
        Ok(sync)
      })
      .await?;
    log_sync(&sync);
    Ok(sync)
  }

  // ── Kits ──────────────────────────────────────────────────────────────────

  /// Creating a default kit clears the flag on every other kit in the same
  /// transaction.
  pub async fn add_device_kit(&self, input: NewDeviceKit) -> Result<DeviceKit> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let NewDeviceKit { name, is_default } = input;
    let n = name.clone();

    let id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if is_default {
          tx.execute("UPDATE device_kits SET is_default = 0 WHERE is_default = 1", [])?;
        }
        tx.execute(
          "INSERT INTO device_kits (name, is_default, is_global) VALUES (?1, ?2, 0)",
          rusqlite::params![n, is_default],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
      })
      .await
      .map_err(constraint_error("device kit", name.clone()))?;

    Ok(DeviceKit { id, name, is_default, is_global: false })
  }

  async fn query_kits(
    &self,
    where_clause: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<Vec<DeviceKit>> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    Ok(
      self
        .conn
        .call(move |conn| {
          let mut stmt = conn.prepare(&format!(
            "SELECT {KIT_COLUMNS} FROM device_kits {where_clause} ORDER BY name"
          ))?;
          let rows = stmt
            .query_map(rusqlite::params_from_iter(params), kit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  pub async fn get_all_device_kits(&self) -> Result<Vec<DeviceKit>> {
    self.query_kits("", Vec::new()).await
  }

  pub async fn get_device_kit_by_id(&self, id: KitId) -> Result<Option<DeviceKit>> {
    Ok(self.query_kits("WHERE id = ?1", vec![id.into()]).await?.pop())
  }

  pub async fn get_default_device_kit(&self) -> Result<Option<DeviceKit>> {
    Ok(self.query_kits("WHERE is_default = 1", Vec::new()).await?.pop())
  }

  pub async fn get_global_device_kit(&self) -> Result<Option<DeviceKit>> {
    Ok(self.query_kits("WHERE is_global = 1", Vec::new()).await?.pop())
  }

  /// Renames a kit. The global kit keeps its name.
  pub async fn update_device_kit(
    &self,
    id: KitId,
    update: DeviceKitUpdate,
  ) -> Result<DeviceKit> {
    let mut kit = self
      .get_device_kit_by_id(id)
      .await?
      .ok_or(Error::NotFound { entity: "device kit", id })?;
    let Some(name) = update.name else {
      return Ok(kit);
    };
    if kit.is_global {
      return Err(Error::ProtectedKit);
    }

    let n = name.clone();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE device_kits SET name = ?2 WHERE id = ?1",
          rusqlite::params![id, n],
        )?;
        Ok(())
      })
      .await
      .map_err(constraint_error("device kit", name.clone()))?;

    kit.name = name;
    Ok(kit)
  }

  /// Deletes a kit and its assignments. The global kit is protected.
  pub async fn delete_device_kit(&self, id: KitId) -> Result<()> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let global: Option<bool> = tx
          .query_row(
            "SELECT is_global FROM device_kits WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
          )
          .optional()?;
        let outcome = match global {
          None => KitOutcome::Missing,
          Some(true) => KitOutcome::Protected,
          Some(false) => {
            tx.execute("DELETE FROM device_kits WHERE id = ?1", rusqlite::params![id])?;
            KitOutcome::Done(())
          }
        };
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    match outcome {
      KitOutcome::Done(()) => Ok(()),
      KitOutcome::Missing => Err(Error::NotFound { entity: "device kit", id }),
      KitOutcome::Protected => Err(Error::ProtectedKit),
    }
  }

  /// Makes `id` the only default kit. An unknown id changes nothing.
  pub async fn set_default_device_kit(&self, id: KitId) -> Result<()> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let found = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let exists = tx
          .query_row(
            "SELECT 1 FROM device_kits WHERE id = ?1",
            rusqlite::params![id],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !exists {
          return Ok(false);
        }
        tx.execute("UPDATE device_kits SET is_default = 0 WHERE is_default = 1", [])?;
        tx.execute(
          "UPDATE device_kits SET is_default = 1 WHERE id = ?1",
          rusqlite::params![id],
        )?;
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if !found {
      return Err(Error::NotFound { entity: "device kit", id });
    }
    Ok(())
  }

  // ── Kit membership ────────────────────────────────────────────────────────

  pub async fn assign_device_to_kit(
    &self,
    kit_id: KitId,
    voting_device_id: DeviceId,
  ) -> Result<DeviceKitAssignment> {
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO device_kit_assignments (kit_id, voting_device_id) VALUES (?1, ?2)",
          rusqlite::params![kit_id, voting_device_id],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(constraint_error(
        "kit assignment",
        format!("kit {kit_id} / device {voting_device_id}"),
      ))?;

    Ok(DeviceKitAssignment { id, kit_id, voting_device_id })
  }

  /// Removes a device from a kit. Membership of the global kit follows the
  /// device table and cannot be edited.
  pub async fn remove_device_from_kit(
    &self,
    kit_id: KitId,
    voting_device_id: DeviceId,
  ) -> Result<()> {
    self.schema.require(GLOBAL_KIT_STEP)?;
    let outcome = self
      .conn
      .call(move |conn| {
        let global: Option<bool> = conn
          .query_row(
            "SELECT is_global FROM device_kits WHERE id = ?1",
            rusqlite::params![kit_id],
            |row| row.get(0),
          )
          .optional()?;
        if global == Some(true) {
          return Ok(KitOutcome::Protected);
        }
        let removed = conn.execute(
          "DELETE FROM device_kit_assignments WHERE kit_id = ?1 AND voting_device_id = ?2",
          rusqlite::params![kit_id, voting_device_id],
        )?;
        Ok(if removed == 0 { KitOutcome::Missing } else { KitOutcome::Done(()) })
      })
      .await?;

    match outcome {
      KitOutcome::Done(()) => Ok(()),
      KitOutcome::Missing => Err(Error::NotFound {
        entity: "kit assignment",
        id:     voting_device_id,
      }),
      KitOutcome::Protected => Err(Error::ProtectedKit),
    }
  }

  pub async fn get_voting_devices_for_kit(&self, kit_id: KitId) -> Result<Vec<VotingDevice>> {
    self
      .query_devices(
        "SELECT v.id, v.name, v.serial_number
           FROM voting_devices v
           JOIN device_kit_assignments a ON a.voting_device_id = v.id
          WHERE a.kit_id = ?1
          ORDER BY v.name, v.serial_number",
        vec![kit_id.into()],
      )
      .await
  }

  pub async fn get_kits_for_voting_device(
    &self,
    voting_device_id: DeviceId,
  ) -> Result<Vec<DeviceKit>> {
    self
      .query_kits(
        "WHERE id IN (
           SELECT kit_id FROM device_kit_assignments WHERE voting_device_id = ?1
         )",
        vec![voting_device_id.into()],
      )
      .await
  }
}
