//! Detected faces and people (named face clusters).
//!
//! `photos.face_count` and `people.face_count` are denormalized counters.
//! Every write that adds, removes or moves a face adjusts them in the same
//! transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{now, Database};
use crate::error::{Error, Result};

/// Bounding box for a detected face
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A detected face in a photo
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub person_id: Option<i64>,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Detector output for one face, before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

/// A person (named face cluster) owned by a user
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub face_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const FACE_COLUMNS: &str =
    "f.id, f.photo_id, f.person_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, f.confidence, f.embedding, f.created_at";

const PERSON_COLUMNS: &str = "id, user_id, name, face_count, created_at, updated_at";

impl Database {
    /// Reject embeddings of the wrong length or with non-finite values.
    pub fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim() {
            return Err(Error::invalid(
                "embedding",
                format!(
                    "expected {} dimensions, got {}",
                    self.embedding_dim(),
                    embedding.len()
                ),
            ));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::invalid("embedding", "contains NaN or infinite values"));
        }
        Ok(())
    }

    // ========================================================================
    // Faces
    // ========================================================================

    pub fn get_face(&self, face_id: i64) -> Result<Face> {
        let face = self
            .conn()
            .query_row(
                &format!("SELECT {FACE_COLUMNS} FROM faces f WHERE f.id = ?"),
                [face_id],
                row_to_face,
            )
            .optional()?;
        face.ok_or_else(|| Error::not_found("face", face_id))
    }

    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces f WHERE f.photo_id = ? ORDER BY f.id"
        ))?;
        let faces = stmt
            .query_map([photo_id], row_to_face)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn faces_for_person(&self, person_id: i64) -> Result<Vec<Face>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces f WHERE f.person_id = ? ORDER BY f.id"
        ))?;
        let faces = stmt
            .query_map([person_id], row_to_face)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Remove one face, keeping the photo and person counters in step.
    pub fn delete_face(&self, face_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (photo_id, person_id) = face_owner(&tx, face_id)?;

        tx.execute("DELETE FROM faces WHERE id = ?", [face_id])?;
        tx.execute(
            "UPDATE photos SET face_count = face_count - 1 WHERE id = ?",
            [photo_id],
        )?;
        if let Some(person_id) = person_id {
            adjust_person_count(&tx, person_id, -1)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // People management
    // ========================================================================

    pub fn create_person(&self, user_id: i64, name: &str) -> Result<Person> {
        let ts = now();
        let person = self.conn().query_row(
            &format!(
                "INSERT INTO people (user_id, name, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING {PERSON_COLUMNS}"
            ),
            params![user_id, name, ts, ts],
            row_to_person,
        )?;
        Ok(person)
    }

    pub fn get_person(&self, person_id: i64) -> Result<Person> {
        let person = self
            .conn()
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM people WHERE id = ?"),
                [person_id],
                row_to_person,
            )
            .optional()?;
        person.ok_or_else(|| Error::not_found("person", person_id))
    }

    /// A user's people, largest cluster first
    pub fn list_people(&self, user_id: i64) -> Result<Vec<Person>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERSON_COLUMNS} FROM people WHERE user_id = ? ORDER BY face_count DESC, name, id"
        ))?;
        let people = stmt
            .query_map([user_id], row_to_person)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(people)
    }

    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE people SET name = ?, updated_at = ? WHERE id = ?",
            params![name, now(), person_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("person", person_id));
        }
        Ok(())
    }

    /// Delete a person; their faces become unassigned.
    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("UPDATE faces SET person_id = NULL WHERE person_id = ?", [person_id])?;
        let removed = tx.execute("DELETE FROM people WHERE id = ?", [person_id])?;
        if removed == 0 {
            return Err(Error::not_found("person", person_id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Assign (or reassign) a face. The previous person's count drops and the
    /// new person's count rises in the same transaction.
    pub fn assign_face_to_person(&self, face_id: i64, person_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (_, previous) = face_owner(&tx, face_id)?;

        let person_exists = tx
            .query_row("SELECT 1 FROM people WHERE id = ?", [person_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !person_exists {
            return Err(Error::not_found("person", person_id));
        }
        if previous == Some(person_id) {
            return Ok(());
        }

        tx.execute(
            "UPDATE faces SET person_id = ? WHERE id = ?",
            params![person_id, face_id],
        )?;
        if let Some(previous) = previous {
            adjust_person_count(&tx, previous, -1)?;
        }
        adjust_person_count(&tx, person_id, 1)?;
        tx.commit()?;
        Ok(())
    }

    /// Detach a face from its person. Unassigned faces are left as they are.
    pub fn unassign_face(&self, face_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (_, previous) = face_owner(&tx, face_id)?;
        if let Some(previous) = previous {
            tx.execute("UPDATE faces SET person_id = NULL WHERE id = ?", [face_id])?;
            adjust_person_count(&tx, previous, -1)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// `(photo_id, person_id)` of a face.
fn face_owner(conn: &Connection, face_id: i64) -> Result<(i64, Option<i64>)> {
    conn.query_row(
        "SELECT photo_id, person_id FROM faces WHERE id = ?",
        [face_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| Error::not_found("face", face_id))
}

fn adjust_person_count(conn: &Connection, person_id: i64, delta: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE people SET face_count = face_count + ?, updated_at = ? WHERE id = ?",
        params![delta, now(), person_id],
    )?;
    Ok(())
}

/// Insert one face row. The caller owns the transaction and the photo counter.
pub(crate) fn insert_face(
    conn: &Connection,
    photo_id: i64,
    face: &NewFace,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        r#"
        INSERT INTO faces (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            photo_id,
            face.bbox.x,
            face.bbox.y,
            face.bbox.width,
            face.bbox.height,
            face.confidence,
            embedding_to_bytes(&face.embedding),
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Drop every face of a photo, releasing their people. The caller resets the
/// photo counter.
pub(crate) fn delete_faces_of_photo(conn: &Connection, photo_id: i64) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        UPDATE people
        SET face_count = face_count
            - (SELECT COUNT(*) FROM faces WHERE faces.person_id = people.id AND faces.photo_id = ?1)
        WHERE id IN (SELECT person_id FROM faces WHERE photo_id = ?1 AND person_id IS NOT NULL)
        "#,
        [photo_id],
    )?;
    conn.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])
}

/// Map a row selected with [`FACE_COLUMNS`] starting at `offset`.
pub(crate) fn face_from_row(row: &rusqlite::Row, offset: usize) -> rusqlite::Result<Face> {
    let bytes: Vec<u8> = row.get(offset + 8)?;
    Ok(Face {
        id: row.get(offset)?,
        photo_id: row.get(offset + 1)?,
        person_id: row.get(offset + 2)?,
        bbox: BoundingBox {
            x: row.get(offset + 3)?,
            y: row.get(offset + 4)?,
            width: row.get(offset + 5)?,
            height: row.get(offset + 6)?,
        },
        confidence: row.get(offset + 7)?,
        embedding: bytes_to_embedding(&bytes),
        created_at: row.get(offset + 9)?,
    })
}

fn row_to_face(row: &rusqlite::Row) -> rusqlite::Result<Face> {
    face_from_row(row, 0)
}

fn row_to_person(row: &rusqlite::Row) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        face_count: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Convert f32 embedding to little-endian bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
