use super::{pair_key, ComparisonResult};
use crate::error::Error;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct CsvRow<'a> {
    left_id: &'a str,
    right_id: &'a str,
    size_left: u64,
    size_right: u64,
    match_count: u32,
    similarity: String,
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    left_id: &'a str,
    right_id: &'a str,
    size_left: u64,
    size_right: u64,
    match_count: u32,
    similarity: f64,
}

/// Header row plus one line per result, in the order given.
pub(super) fn to_csv(sorted: &[&ComparisonResult]) -> Result<Vec<u8>, Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if sorted.is_empty() {
        writer.write_record([
            "left_id",
            "right_id",
            "size_left",
            "size_right",
            "match_count",
            "similarity",
        ])?;
    }
    for result in sorted {
        writer.serialize(CsvRow {
            left_id: &result.left_id,
            right_id: &result.right_id,
            size_left: result.left_size,
            size_right: result.right_size,
            match_count: result.match_count,
            similarity: format!("{:.6}", result.similarity),
        })?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Serialization(e.to_string()))
}

pub(super) fn to_json(sorted: &[&ComparisonResult]) -> Result<Vec<u8>, Error> {
    let entries: BTreeMap<String, JsonEntry> = sorted
        .iter()
        .map(|result| {
            (
                pair_key(&result.left_id, &result.right_id),
                JsonEntry {
                    left_id: &result.left_id,
                    right_id: &result.right_id,
                    size_left: result.left_size,
                    size_right: result.right_size,
                    match_count: result.match_count,
                    similarity: result.similarity,
                },
            )
        })
        .collect();
    let mut bytes = serde_json::to_vec_pretty(&entries)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(left: &str, right: &str, similarity: f64) -> ComparisonResult {
        ComparisonResult {
            left_id: left.to_string(),
            right_id: right.to_string(),
            left_size: 1,
            right_size: 2,
            match_count: 3,
            similarity,
        }
    }

    #[test]
    fn test_csv_columns_and_order() {
        let a = result("Images/a.png", "Images/b.png", 0.875);
        let b = result("Images/a.png", "Images/c.png", 0.125);
        let text = String::from_utf8(to_csv(&[&a, &b]).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "left_id,right_id,size_left,size_right,match_count,similarity",
                "Images/a.png,Images/b.png,1,2,3,0.875000",
                "Images/a.png,Images/c.png,1,2,3,0.125000",
            ]
        );
    }

    #[test]
    fn test_empty_csv_still_has_header() {
        let text = String::from_utf8(to_csv(&[]).unwrap()).unwrap();
        assert_eq!(text.trim_end(), "left_id,right_id,size_left,size_right,match_count,similarity");
    }

    #[test]
    fn test_json_is_keyed_by_pair() {
        let a = result("x", "y", 0.5);
        let value: serde_json::Value = serde_json::from_slice(&to_json(&[&a]).unwrap()).unwrap();
        let entry = &value[pair_key("x", "y")];
        assert_eq!(entry["left_id"], "x");
        assert_eq!(entry["similarity"], 0.5);
    }
}
