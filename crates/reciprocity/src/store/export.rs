//! CSV exports.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::source::{Collection, Entity};

const BOM: &str = "\u{feff}";

#[derive(Debug, Serialize, Deserialize)]
struct ExportRow {
    username: String,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    profile_url: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

/// Write a collection as UTF-8 CSV with a byte-order mark.
pub fn write_collection_csv<W: Write>(
    mut writer: W,
    collection: &Collection,
    profile_url_base: &str,
) -> Result<(), StoreError> {
    writer.write_all(BOM.as_bytes())?;
    let mut csv = csv::Writer::from_writer(writer);
    for entity in &collection.entities {
        csv.serialize(ExportRow {
            username: entity.id.clone(),
            full_name: entity.display_name.clone(),
            profile_url: format!("{profile_url_base}{}", entity.id),
            avatar_url: entity.avatar_ref.clone(),
        })?;
    }
    if collection.is_empty() {
        csv.write_record(["username", "full_name", "profile_url", "avatar_url"])?;
    }
    csv.flush()?;
    Ok(())
}

/// Read a collection written by [`write_collection_csv`].
///
/// Files without an `avatar_url` column load with no avatars.
pub fn read_collection<R: Read>(mut reader: R) -> Result<Collection, StoreError> {
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    let body = content.strip_prefix(BOM).unwrap_or(&content);

    let mut csv = csv::Reader::from_reader(body.as_bytes());
    let mut entities = Vec::new();
    for row in csv.deserialize::<ExportRow>() {
        let row = row?;
        if row.username.is_empty() {
            continue;
        }
        let mut entity = Entity::new(row.username, row.full_name);
        entity.avatar_ref = row.avatar_url.filter(|url| !url.is_empty());
        entities.push(entity);
    }
    let count = entities.len() as u64;
    Ok(Collection::new(entities, Some(count)))
}
