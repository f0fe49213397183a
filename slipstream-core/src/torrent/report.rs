//! Rendering of torrent listings for the `info` query.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TorrentInfo;

/// Output format for torrent listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Plain,
}

/// Renders torrents restricted to `fields` (all fields when `None`).
///
/// Unknown field names are skipped. Plain output is one comma separated line
/// per torrent, preceded by a header line when `include_field_names` is set.
///
/// # Errors
///
/// - `serde_json::Error` - A record could not be converted to JSON
pub fn format_torrent_info(
    torrents: &[TorrentInfo],
    fields: Option<&[String]>,
    include_field_names: bool,
    format: OutputFormat,
) -> Result<String, serde_json::Error> {
    let rows = torrents
        .iter()
        .map(|torrent| select_fields(torrent, fields))
        .collect::<Result<Vec<_>, _>>()?;

    match format {
        OutputFormat::Plain => {
            let mut lines = Vec::with_capacity(rows.len() + 1);
            if include_field_names && let Some(first) = rows.first() {
                let header: Vec<&str> = first.iter().map(|(name, _)| name.as_str()).collect();
                lines.push(header.join(","));
            }
            for row in &rows {
                let values: Vec<String> = row.iter().map(|(_, value)| plain_value(value)).collect();
                lines.push(values.join(","));
            }
            Ok(lines.join("\n"))
        }
        OutputFormat::Json => {
            let rendered: Vec<Value> = rows
                .into_iter()
                .map(|row| {
                    if include_field_names {
                        Value::Object(row.into_iter().collect::<Map<String, Value>>())
                    } else {
                        Value::Array(row.into_iter().map(|(_, value)| value).collect())
                    }
                })
                .collect();
            serde_json::to_string_pretty(&rendered)
        }
    }
}

/// Flattens `["name", "state,ratio"]` into `["name", "state", "ratio"]`.
pub fn flatten_fields(fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .flat_map(|field| field.split(','))
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}

fn select_fields(
    torrent: &TorrentInfo,
    fields: Option<&[String]>,
) -> Result<Vec<(String, Value)>, serde_json::Error> {
    let Value::Object(mut object) = serde_json::to_value(torrent)? else {
        return Ok(Vec::new());
    };

    Ok(match fields {
        None => object.into_iter().collect(),
        Some(fields) => fields
            .iter()
            .filter_map(|field| object.remove(field).map(|value| (field.clone(), value)))
            .collect(),
    })
}

fn plain_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
