//! Persons, classes and class membership.

use crate::error::{Result, StoreError};
use crate::models::{from_millis, to_millis, Class, NewClass, NewPerson, Person};
use crate::{new_id, Store};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

const PERSON_COLUMNS: &str = "id, display_name, is_active, created_at";
const CLASS_COLUMNS: &str = "id, code, name, instructor, is_active, created_at";

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        display_name: row.get(1)?,
        is_active: row.get(2)?,
        created_at: from_millis(row.get(3)?)?,
    })
}

fn class_from_row(row: &Row<'_>) -> rusqlite::Result<Class> {
    Ok(Class {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        instructor: row.get(3)?,
        is_active: row.get(4)?,
        created_at: from_millis(row.get(5)?)?,
    })
}

pub(crate) fn person_exists(conn: &Connection, person_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM persons WHERE id = ?1", [person_id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

pub(crate) fn class_exists(conn: &Connection, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?1", [class_id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

pub(crate) fn active_member_count(conn: &Connection, class_id: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM class_members m JOIN persons p ON p.id = m.person_id
         WHERE m.class_id = ?1 AND p.is_active = 1",
        [class_id],
        |row| row.get(0),
    )
}

impl Store {
    /// Create a person and their class memberships in one transaction.
    pub async fn create_person(&self, new: NewPerson) -> Result<Person> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if person_exists(&tx, &new.id)? {
                return Err(StoreError::AlreadyExists {
                    kind: "person",
                    id: new.id,
                });
            }
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO persons (id, display_name, is_active, created_at) VALUES (?1, ?2, 1, ?3)",
                params![new.id, new.display_name, to_millis(created_at)],
            )?;
            for class_id in &new.class_ids {
                if !class_exists(&tx, class_id)? {
                    return Err(StoreError::not_found("class", class_id.clone()));
                }
                tx.execute(
                    "INSERT OR IGNORE INTO class_members (class_id, person_id) VALUES (?1, ?2)",
                    params![class_id, new.id],
                )?;
            }
            let person = tx.query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = ?1"),
                [&new.id],
                person_from_row,
            )?;
            tx.commit()?;
            tracing::info!(person = %person.id, classes = new.class_ids.len(), "person created");
            Ok(person)
        })
        .await
    }

    pub async fn get_person(&self, person_id: &str) -> Result<Option<Person>> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = ?1"),
                    [&person_id],
                    person_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_persons(&self) -> Result<Vec<Person>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PERSON_COLUMNS} FROM persons ORDER BY display_name, id"
            ))?;
            let persons = stmt
                .query_map([], person_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(persons)
        })
        .await
    }

    /// Inactive persons stay enrolled but no longer count toward roster size.
    pub async fn set_person_active(&self, person_id: &str, active: bool) -> Result<()> {
        let person_id = person_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE persons SET is_active = ?2 WHERE id = ?1",
                params![person_id, active],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("person", person_id));
            }
            Ok(())
        })
        .await
    }

    pub async fn create_class(&self, new: NewClass) -> Result<Class> {
        self.with_conn(move |conn| {
            let taken = conn
                .query_row("SELECT 1 FROM classes WHERE code = ?1", [&new.code], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                return Err(StoreError::AlreadyExists {
                    kind: "class",
                    id: new.code,
                });
            }
            let class = Class {
                id: new_id(),
                code: new.code,
                name: new.name,
                instructor: new.instructor,
                is_active: true,
                created_at: Utc::now(),
            };
            conn.execute(
                "INSERT INTO classes (id, code, name, instructor, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![class.id, class.code, class.name, class.instructor, to_millis(class.created_at)],
            )?;
            tracing::info!(class = %class.id, code = %class.code, "class created");
            Ok(class)
        })
        .await
    }

    pub async fn get_class(&self, class_id: &str) -> Result<Option<Class>> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = ?1"),
                    [&class_id],
                    class_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn get_class_by_code(&self, code: &str) -> Result<Option<Class>> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {CLASS_COLUMNS} FROM classes WHERE code = ?1"),
                    [&code],
                    class_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn add_to_class(&self, class_id: &str, person_id: &str) -> Result<()> {
        let (class_id, person_id) = (class_id.to_string(), person_id.to_string());
        self.with_conn(move |conn| {
            if !class_exists(conn, &class_id)? {
                return Err(StoreError::not_found("class", class_id));
            }
            if !person_exists(conn, &person_id)? {
                return Err(StoreError::not_found("person", person_id));
            }
            conn.execute(
                "INSERT OR IGNORE INTO class_members (class_id, person_id) VALUES (?1, ?2)",
                params![class_id, person_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Returns whether a membership was actually removed.
    pub async fn remove_from_class(&self, class_id: &str, person_id: &str) -> Result<bool> {
        let (class_id, person_id) = (class_id.to_string(), person_id.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM class_members WHERE class_id = ?1 AND person_id = ?2",
                params![class_id, person_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn is_member(&self, class_id: &str, person_id: &str) -> Result<bool> {
        let (class_id, person_id) = (class_id.to_string(), person_id.to_string());
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM class_members WHERE class_id = ?1 AND person_id = ?2",
                    params![class_id, person_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    pub async fn count_active_members(&self, class_id: &str) -> Result<u32> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| Ok(active_member_count(conn, &class_id)?)).await
    }

    pub async fn class_members(&self, class_id: &str) -> Result<Vec<Person>> {
        let class_id = class_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.display_name, p.is_active, p.created_at
                 FROM class_members m JOIN persons p ON p.id = m.person_id
                 WHERE m.class_id = ?1 ORDER BY p.display_name, p.id",
            )?;
            let persons = stmt
                .query_map([&class_id], person_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(persons)
        })
        .await
    }
}
