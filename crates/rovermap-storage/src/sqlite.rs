//! SQLite implementation of the [`DbDriver`] contract.
//!
//! # Storage layout
//!
//! Five tables are created on open (if missing):
//!
//! | table      | contents                                                    |
//! |------------|-------------------------------------------------------------|
//! | `nodes`    | node header, pose blob, word/3-D-word blobs, entry time     |
//! | `links`    | one row per directed link, keyed `(from_id, to_id)`         |
//! | `payloads` | compressed sensor blobs + calibration JSON per node         |
//! | `words`    | visual-word descriptors as little-endian f32 blobs          |
//! | `stats`    | end-of-run statistics; doubles as the session boundary      |
//!
//! Poses, keypoints and 3-D points are packed as little-endian f32 blobs
//! (NaN-safe, unlike JSON); calibration structs contain only finite floats
//! and are stored as JSON.  "Last session" queries key on the timestamp of
//! the most recent `stats` row: everything persisted at or after it belongs
//! to the previous run's working memory.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use rovermap_core::{
    CameraModel, KeyPoint, Link, LinkInfo, LinkKind, Quaternion, SensorPayload,
    StereoCameraModel, Transform, Vec3,
};

use crate::StorageError;
use crate::driver::{DbDriver, NodeInfo, NodeRecord, WordRecord};

// ────────────────────────────────────────────────────────────────────────────
// Blob packing
// ────────────────────────────────────────────────────────────────────────────

fn f32s_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_f32s(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn pose_to_blob(pose: &Option<Transform>) -> Option<Vec<u8>> {
    pose.as_ref().map(|t| {
        f32s_to_blob(&[
            t.translation.x,
            t.translation.y,
            t.translation.z,
            t.rotation.w,
            t.rotation.x,
            t.rotation.y,
            t.rotation.z,
        ])
    })
}

fn blob_to_pose(blob: Option<Vec<u8>>) -> Option<Transform> {
    let values = blob_to_f32s(&blob?);
    if values.len() != 7 {
        return None;
    }
    Some(Transform::new(
        Vec3::new(values[0], values[1], values[2]),
        Quaternion::new(values[3], values[4], values[5], values[6]),
    ))
}

fn words_to_blob(words: &[(i32, KeyPoint)]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(words.len() * 28);
    for (id, kp) in words {
        blob.extend_from_slice(&id.to_le_bytes());
        for v in [kp.x, kp.y, kp.size, kp.angle, kp.response] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        blob.extend_from_slice(&kp.octave.to_le_bytes());
    }
    blob
}

fn blob_to_words(blob: &[u8]) -> Vec<(i32, KeyPoint)> {
    blob.chunks_exact(28)
        .map(|c| {
            let f = |i: usize| f32::from_le_bytes([c[i], c[i + 1], c[i + 2], c[i + 3]]);
            let id = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let mut kp = KeyPoint::new(f(4), f(8), f(12));
            kp.angle = f(16);
            kp.response = f(20);
            kp.octave = i32::from_le_bytes([c[24], c[25], c[26], c[27]]);
            (id, kp)
        })
        .collect()
}

fn words3_to_blob(words3: &[(i32, Vec3)]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(words3.len() * 16);
    for (id, p) in words3 {
        blob.extend_from_slice(&id.to_le_bytes());
        for v in [p.x, p.y, p.z] {
            blob.extend_from_slice(&v.to_le_bytes());
        }
    }
    blob
}

fn blob_to_words3(blob: &[u8]) -> Vec<(i32, Vec3)> {
    blob.chunks_exact(16)
        .map(|c| {
            let f = |i: usize| f32::from_le_bytes([c[i], c[i + 1], c[i + 2], c[i + 3]]);
            (
                i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                Vec3::new(f(4), f(8), f(12)),
            )
        })
        .collect()
}

fn kind_to_i32(kind: LinkKind) -> i32 {
    match kind {
        LinkKind::Neighbor => 0,
        LinkKind::NeighborMerged => 1,
        LinkKind::GlobalClosure => 2,
        LinkKind::LocalSpaceClosure => 3,
        LinkKind::VirtualClosure => 4,
        LinkKind::Undef => 5,
    }
}

fn i32_to_kind(value: i32) -> LinkKind {
    match value {
        0 => LinkKind::Neighbor,
        1 => LinkKind::NeighborMerged,
        2 => LinkKind::GlobalClosure,
        3 => LinkKind::LocalSpaceClosure,
        4 => LinkKind::VirtualClosure,
        _ => LinkKind::Undef,
    }
}

/// Camera calibration of a payload, JSON-encoded as one column.
#[derive(serde::Serialize, serde::Deserialize)]
struct CalibRecord {
    camera_models: Vec<CameraModel>,
    stereo_model: Option<StereoCameraModel>,
}

// ────────────────────────────────────────────────────────────────────────────
// SqliteDriver
// ────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`DbDriver`].
pub struct SqliteDriver {
    conn: Option<Connection>,
    url: String,
    timestamp_update_enabled: bool,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            conn: None,
            url: String::new(),
            timestamp_update_enabled: true,
        }
    }

    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn.as_ref().ok_or(StorageError::NotConnected)
    }

    fn now(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Timestamp of the most recent statistics row, if any.
    fn last_session_marker(&self) -> Result<Option<String>, StorageError> {
        let marker = self
            .conn()?
            .query_row("SELECT MAX(time_enter) FROM stats", [], |row| {
                row.get::<_, Option<String>>(0)
            })?;
        Ok(marker)
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id         INTEGER NOT NULL PRIMARY KEY,
                map_id     INTEGER NOT NULL,
                weight     INTEGER NOT NULL,
                label      TEXT,
                stamp      REAL NOT NULL,
                pose       BLOB,
                words      BLOB NOT NULL,
                words3     BLOB NOT NULL,
                time_enter TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS links (
                from_id    INTEGER NOT NULL,
                to_id      INTEGER NOT NULL,
                kind       INTEGER NOT NULL,
                transform  BLOB,
                rot_info   REAL NOT NULL,
                trans_info REAL NOT NULL,
                user_data  BLOB NOT NULL,
                PRIMARY KEY (from_id, to_id)
            );
            CREATE TABLE IF NOT EXISTS payloads (
                node_id         INTEGER NOT NULL PRIMARY KEY,
                image           BLOB NOT NULL,
                depth_or_right  BLOB NOT NULL,
                scan            BLOB NOT NULL,
                user_data       BLOB NOT NULL,
                scan_max_points INTEGER NOT NULL,
                scan_max_range  REAL NOT NULL,
                calib           TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS words (
                id         INTEGER NOT NULL PRIMARY KEY,
                descriptor BLOB NOT NULL,
                time_enter TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stats (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                time_enter      TEXT NOT NULL,
                memory_size     INTEGER NOT NULL,
                last_node_id    INTEGER NOT NULL,
                dictionary_size INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_record(
        &self,
        id: i32,
        map_id: i32,
        weight: i32,
        label: Option<String>,
        stamp: f64,
        pose: Option<Vec<u8>>,
        words: Vec<u8>,
        words3: Vec<u8>,
    ) -> Result<NodeRecord, StorageError> {
        let links = self.load_links(id, None)?.into_values().collect();
        let payload = self.node_payload(id)?.unwrap_or_default();
        Ok(NodeRecord {
            id,
            map_id,
            weight,
            label: label.unwrap_or_default(),
            stamp,
            pose: blob_to_pose(pose),
            links,
            words: blob_to_words(&words),
            words3: blob_to_words3(&words3),
            payload,
        })
    }

    fn load_nodes_where(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<NodeRecord>, StorageError> {
        let sql = format!(
            "SELECT id, map_id, weight, label, stamp, pose, words, words3
             FROM nodes {where_clause} ORDER BY id ASC"
        );
        let mut stmt = self.conn()?.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<Vec<u8>>>(5)?,
                row.get::<_, Vec<u8>>(6)?,
                row.get::<_, Vec<u8>>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, map_id, weight, label, stamp, pose, words, words3) = row?;
            records.push(self.row_to_record(id, map_id, weight, label, stamp, pose, words, words3)?);
        }
        Ok(records)
    }
}

impl DbDriver for SqliteDriver {
    // ── connection ──────────────────────────────────────────────────────────

    fn open(&mut self, url: &str, overwrite: bool) -> Result<(), StorageError> {
        if self.conn.is_some() {
            self.close()?;
        }
        let conn = if url.is_empty() || url == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if overwrite && Path::new(url).exists() {
                info!(url, "overwriting existing database");
                let _ = std::fs::remove_file(url);
            }
            Connection::open(url)?
        };
        Self::init_schema(&conn)?;
        self.conn = Some(conn);
        self.url = url.to_string();
        self.timestamp_update_enabled = true;
        info!(url, "database opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
            debug!(url = %self.url, "database closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn set_timestamp_update_enabled(&mut self, enabled: bool) {
        self.timestamp_update_enabled = enabled;
    }

    // ── writes ──────────────────────────────────────────────────────────────

    fn save_node(&mut self, node: &NodeRecord) -> Result<(), StorageError> {
        let time_enter = {
            let conn = self.conn()?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT time_enter FROM nodes WHERE id = ?1",
                    params![node.id],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(previous) if !self.timestamp_update_enabled => previous,
                _ => self.now(),
            }
        };

        let calib = serde_json::to_string(&CalibRecord {
            camera_models: node.payload.camera_models.clone(),
            stereo_model: node.payload.stereo_model.clone(),
        })?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO nodes
                 (id, map_id, weight, label, stamp, pose, words, words3, time_enter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                node.id,
                node.map_id,
                node.weight,
                if node.label.is_empty() {
                    None
                } else {
                    Some(node.label.as_str())
                },
                node.stamp,
                pose_to_blob(&node.pose),
                words_to_blob(&node.words),
                words3_to_blob(&node.words3),
                time_enter,
            ],
        )?;

        conn.execute("DELETE FROM links WHERE from_id = ?1", params![node.id])?;
        for link in &node.links {
            conn.execute(
                "INSERT OR REPLACE INTO links
                     (from_id, to_id, kind, transform, rot_info, trans_info, user_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    link.from,
                    link.to,
                    kind_to_i32(link.kind),
                    pose_to_blob(&link.transform),
                    link.info.rotation,
                    link.info.translation,
                    link.user_data,
                ],
            )?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO payloads
                 (node_id, image, depth_or_right, scan, user_data,
                  scan_max_points, scan_max_range, calib)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                node.id,
                node.payload.image,
                node.payload.depth_or_right,
                node.payload.scan,
                node.payload.user_data,
                node.payload.scan_max_points,
                node.payload.scan_max_range,
                calib,
            ],
        )?;
        debug!(id = node.id, links = node.links.len(), "node persisted");
        Ok(())
    }

    fn save_word(&mut self, word: &WordRecord) -> Result<(), StorageError> {
        let time_enter = self.now();
        self.conn()?.execute(
            "INSERT OR REPLACE INTO words (id, descriptor, time_enter) VALUES (?1, ?2, ?3)",
            params![word.id, f32s_to_blob(&word.descriptor), time_enter],
        )?;
        Ok(())
    }

    fn add_statistics_after_run(
        &mut self,
        memory_size: usize,
        last_node_id: i32,
        dictionary_size: usize,
    ) -> Result<(), StorageError> {
        let time_enter = self.now();
        self.conn()?.execute(
            "INSERT INTO stats (time_enter, memory_size, last_node_id, dictionary_size)
             VALUES (?1, ?2, ?3, ?4)",
            params![time_enter, memory_size, last_node_id, dictionary_size],
        )?;
        Ok(())
    }

    // ── node reads ──────────────────────────────────────────────────────────

    fn load_last_nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        match self.last_session_marker()? {
            Some(marker) => self.load_nodes_where("WHERE time_enter >= ?1", &[&marker]),
            None => self.load_nodes_where("", &[]),
        }
    }

    fn all_node_ids(&self) -> Result<Vec<i32>, StorageError> {
        let mut stmt = self.conn()?.prepare("SELECT id FROM nodes ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i32>, _>>()?;
        Ok(ids)
    }

    fn load_nodes(&self, ids: &[i32]) -> Result<Vec<NodeRecord>, StorageError> {
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut found = self.load_nodes_where("WHERE id = ?1", &[&id])?;
            records.append(&mut found);
        }
        Ok(records)
    }

    fn node_info(&self, id: i32) -> Result<Option<NodeInfo>, StorageError> {
        let info = self
            .conn()?
            .query_row(
                "SELECT map_id, weight, label, stamp, pose FROM nodes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(NodeInfo {
                        id,
                        map_id: row.get(0)?,
                        weight: row.get(1)?,
                        label: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        stamp: row.get(3)?,
                        pose: blob_to_pose(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn node_words(&self, id: i32) -> Result<Vec<(i32, KeyPoint)>, StorageError> {
        let words = self
            .conn()?
            .query_row(
                "SELECT words FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(words.map(|blob| blob_to_words(&blob)).unwrap_or_default())
    }

    fn node_payload(&self, id: i32) -> Result<Option<SensorPayload>, StorageError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT image, depth_or_right, scan, user_data,
                        scan_max_points, scan_max_range, calib
                 FROM payloads WHERE node_id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, f64>(5)? as f32,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((image, depth_or_right, scan, user_data, scan_max_points, scan_max_range, calib)) =
            row
        else {
            return Ok(None);
        };
        let calib: CalibRecord = serde_json::from_str(&calib)?;
        Ok(Some(SensorPayload {
            image,
            depth_or_right,
            scan,
            user_data,
            scan_max_points,
            scan_max_range,
            camera_models: calib.camera_models,
            stereo_model: calib.stereo_model,
            ..Default::default()
        }))
    }

    fn node_id_by_label(&self, label: &str) -> Result<Option<i32>, StorageError> {
        let id = self
            .conn()?
            .query_row(
                "SELECT id FROM nodes WHERE label = ?1",
                params![label],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn all_labels(&self) -> Result<BTreeMap<i32, String>, StorageError> {
        let mut stmt = self
            .conn()?
            .prepare("SELECT id, label FROM nodes WHERE label IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i32>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut labels = BTreeMap::new();
        for row in rows {
            let (id, label) = row?;
            labels.insert(id, label);
        }
        Ok(labels)
    }

    fn last_node_id(&self) -> Result<i32, StorageError> {
        let id: Option<i32> = self
            .conn()?
            .query_row("SELECT MAX(id) FROM nodes", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    // ── link reads ──────────────────────────────────────────────────────────

    fn load_links(
        &self,
        id: i32,
        filter: Option<LinkKind>,
    ) -> Result<BTreeMap<i32, Link>, StorageError> {
        let mut stmt = self.conn()?.prepare(
            "SELECT to_id, kind, transform, rot_info, trans_info, user_data
             FROM links WHERE from_id = ?1",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, f64>(3)? as f32,
                row.get::<_, f64>(4)? as f32,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?;
        let mut links = BTreeMap::new();
        for row in rows {
            let (to, kind, transform, rot_info, trans_info, user_data) = row?;
            let kind = i32_to_kind(kind);
            if let Some(wanted) = filter
                && kind != wanted
            {
                continue;
            }
            let mut link = Link::new(id, to, kind, blob_to_pose(transform))
                .with_info(LinkInfo::new(rot_info, trans_info));
            link.user_data = user_data;
            links.insert(to, link);
        }
        Ok(links)
    }

    fn all_links(&self, ignore_null: bool) -> Result<Vec<(i32, Link)>, StorageError> {
        let mut stmt = self.conn()?.prepare(
            "SELECT from_id, to_id, kind, transform, rot_info, trans_info, user_data
             FROM links ORDER BY from_id, to_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
                row.get::<_, f64>(4)? as f32,
                row.get::<_, f64>(5)? as f32,
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;
        let mut links = Vec::new();
        for row in rows {
            let (from, to, kind, transform, rot_info, trans_info, user_data) = row?;
            let transform = blob_to_pose(transform);
            if ignore_null && transform.is_none() {
                continue;
            }
            let mut link = Link::new(from, to, i32_to_kind(kind), transform)
                .with_info(LinkInfo::new(rot_info, trans_info));
            link.user_data = user_data;
            links.push((from, link));
        }
        Ok(links)
    }

    // ── word reads ──────────────────────────────────────────────────────────

    fn load_words(&self, ids: &[i32]) -> Result<Vec<WordRecord>, StorageError> {
        let mut words = Vec::with_capacity(ids.len());
        let conn = self.conn()?;
        for &id in ids {
            let descriptor: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT descriptor FROM words WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(blob) = descriptor {
                words.push(WordRecord {
                    id,
                    descriptor: blob_to_f32s(&blob),
                });
            }
        }
        Ok(words)
    }

    fn load_last_words(&self) -> Result<Vec<WordRecord>, StorageError> {
        let (sql, marker) = match self.last_session_marker()? {
            Some(marker) => (
                "SELECT id, descriptor FROM words WHERE time_enter >= ?1 ORDER BY id",
                Some(marker),
            ),
            None => ("SELECT id, descriptor FROM words ORDER BY id", None),
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(WordRecord {
                id: row.get(0)?,
                descriptor: blob_to_f32s(&row.get::<_, Vec<u8>>(1)?),
            })
        };
        let rows = match &marker {
            Some(m) => stmt.query_map(params![m], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let words = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(words)
    }

    fn last_word_id(&self) -> Result<i32, StorageError> {
        let id: Option<i32> = self
            .conn()?
            .query_row("SELECT MAX(id) FROM words", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> SqliteDriver {
        let mut driver = SqliteDriver::new();
        driver.open(":memory:", false).unwrap();
        driver
    }

    fn sample_node(id: i32) -> NodeRecord {
        NodeRecord {
            id,
            map_id: 0,
            weight: 3,
            label: format!("node{id}"),
            stamp: 12.5,
            pose: Some(Transform::from_translation(Vec3::new(1.0, 2.0, 3.0))),
            links: vec![
                Link::new(id, id + 1, LinkKind::Neighbor, Some(Transform::identity())),
                Link::new(id, id - 1, LinkKind::GlobalClosure, None),
            ],
            words: vec![(4, KeyPoint::new(10.0, 20.0, 3.0))],
            words3: vec![(4, Vec3::new(0.1, 0.2, 0.3)), (5, Vec3::nan())],
            payload: SensorPayload {
                image: vec![1, 2, 3],
                user_data: vec![9],
                scan_max_points: 100,
                scan_max_range: 8.0,
                ..Default::default()
            },
        }
    }

    // ── node roundtrip ──────────────────────────────────────────────────────

    #[test]
    fn node_roundtrip() {
        let mut driver = open_memory();
        let node = sample_node(7);
        driver.save_node(&node).unwrap();

        let loaded = driver.load_nodes(&[7]).unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, 7);
        assert_eq!(got.label, "node7");
        assert_eq!(got.weight, 3);
        assert_eq!(got.links.len(), 2);
        assert_eq!(got.words, node.words);
        // NaN 3-D point survives the blob roundtrip.
        assert!(!got.words3[1].1.is_finite());
        assert_eq!(got.payload.image, vec![1, 2, 3]);
        let pose = got.pose.unwrap();
        assert!((pose.translation.y - 2.0).abs() < 1e-5);
    }

    #[test]
    fn node_info_and_labels() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(3)).unwrap();

        let info = driver.node_info(3).unwrap().unwrap();
        assert_eq!(info.label, "node3");
        assert_eq!(info.weight, 3);

        assert_eq!(driver.node_id_by_label("node3").unwrap(), Some(3));
        assert_eq!(driver.node_id_by_label("ghost").unwrap(), None);
        assert_eq!(driver.all_labels().unwrap()[&3], "node3");
    }

    #[test]
    fn missing_node_is_none() {
        let driver = open_memory();
        assert!(driver.node_info(99).unwrap().is_none());
        assert!(driver.load_nodes(&[99]).unwrap().is_empty());
        assert!(driver.node_payload(99).unwrap().is_none());
    }

    // ── links ───────────────────────────────────────────────────────────────

    #[test]
    fn load_links_filters_by_kind() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(7)).unwrap();

        let all = driver.load_links(7, None).unwrap();
        assert_eq!(all.len(), 2);

        let neighbors = driver.load_links(7, Some(LinkKind::Neighbor)).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert!(neighbors.contains_key(&8));
    }

    #[test]
    fn all_links_can_ignore_null_transforms() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(7)).unwrap();

        assert_eq!(driver.all_links(false).unwrap().len(), 2);
        let non_null = driver.all_links(true).unwrap();
        assert_eq!(non_null.len(), 1);
        assert_eq!(non_null[0].1.kind, LinkKind::Neighbor);
    }

    // ── words ───────────────────────────────────────────────────────────────

    #[test]
    fn word_roundtrip_and_last_id() {
        let mut driver = open_memory();
        driver
            .save_word(&WordRecord {
                id: 11,
                descriptor: vec![0.5, -1.5, 2.0],
            })
            .unwrap();
        let words = driver.load_words(&[11, 99]).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].descriptor, vec![0.5, -1.5, 2.0]);
        assert_eq!(driver.last_word_id().unwrap(), 11);
    }

    // ── session boundary ────────────────────────────────────────────────────

    #[test]
    fn last_nodes_keys_on_statistics_marker() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(1)).unwrap();
        driver.add_statistics_after_run(1, 1, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        driver.save_node(&sample_node(2)).unwrap();
        driver.save_node(&sample_node(3)).unwrap();

        let last = driver.load_last_nodes().unwrap();
        let ids: Vec<i32> = last.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn last_nodes_without_marker_returns_all() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(1)).unwrap();
        driver.save_node(&sample_node(2)).unwrap();
        assert_eq!(driver.load_last_nodes().unwrap().len(), 2);
    }

    #[test]
    fn last_words_keys_on_statistics_marker() {
        let mut driver = open_memory();
        driver
            .save_word(&WordRecord {
                id: 1,
                descriptor: vec![0.0],
            })
            .unwrap();
        driver.add_statistics_after_run(1, 1, 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        driver
            .save_word(&WordRecord {
                id: 2,
                descriptor: vec![1.0],
            })
            .unwrap();
        let words = driver.load_last_words().unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].id, 2);
    }

    // ── timestamps ──────────────────────────────────────────────────────────

    #[test]
    fn disabled_timestamp_update_preserves_entry_time() {
        let mut driver = open_memory();
        driver.save_node(&sample_node(1)).unwrap();
        let t0: String = driver
            .conn()
            .unwrap()
            .query_row("SELECT time_enter FROM nodes WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        driver.set_timestamp_update_enabled(false);
        driver.save_node(&sample_node(1)).unwrap();
        let t1: String = driver
            .conn()
            .unwrap()
            .query_row("SELECT time_enter FROM nodes WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(t0, t1, "time_enter must be preserved");

        driver.set_timestamp_update_enabled(true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        driver.save_node(&sample_node(1)).unwrap();
        let t2: String = driver
            .conn()
            .unwrap()
            .query_row("SELECT time_enter FROM nodes WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_ne!(t0, t2, "time_enter must refresh when enabled");
    }

    #[test]
    fn disconnected_driver_errors() {
        let mut driver = SqliteDriver::new();
        assert!(matches!(
            driver.save_node(&sample_node(1)),
            Err(StorageError::NotConnected)
        ));
        assert!(!driver.is_connected());
    }
}
