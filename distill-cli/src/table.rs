/// Table formatting for records and statistics using comfy-table

use chrono::{DateTime, SecondsFormat, Utc};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use distill_api::{Record, Statistics, Verdict};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

fn format_limit(value: u64) -> String {
    if value == 0 {
        "∞".to_string()
    } else {
        value.to_string()
    }
}

/// One row per record
pub fn format_records_table(records: &[Record]) -> String {
    if records.is_empty() {
        return "No urls found".to_string();
    }

    let mut table = new_table();
    table.set_header(vec![
        Cell::new("id"),
        Cell::new("url"),
        Cell::new("hits"),
        Cell::new("limit"),
        Cell::new("recorded on"),
        Cell::new("expires on"),
    ]);
    for record in records {
        table.add_row(vec![
            Cell::new(&record.id),
            Cell::new(&record.redirect_url),
            Cell::new(record.hits),
            Cell::new(format_limit(record.resolve_limit)),
            Cell::new(format_time(Some(record.recorded_on))),
            Cell::new(format_time(record.expires_on)),
        ]);
    }
    table.to_string()
}

/// Every field of one record, with its current state
pub fn format_record_table(record: &Record, verdict: Option<Verdict>) -> String {
    let state = verdict.map_or_else(|| "active".to_string(), |v| v.to_string());
    let optional = |url: &str| {
        if url.is_empty() {
            "-".to_string()
        } else {
            url.to_string()
        }
    };

    let mut table = new_table();
    table.set_header(vec![Cell::new("field"), Cell::new("value")]);
    let rows = [
        ("id", record.id.clone()),
        ("url", record.redirect_url.clone()),
        ("state", state),
        ("recorded on", format_time(Some(record.recorded_on))),
        ("active from", format_time(Some(record.active_from))),
        ("expires on", format_time(record.expires_on)),
        ("ttl (s)", record.ttl.to_string()),
        ("hits", record.hits.to_string()),
        (
            "resolutions",
            format!("{} / {}", record.resolve_count, format_limit(record.resolve_limit)),
        ),
        ("expired url", optional(&record.expired_redirect_url)),
        ("exhausted url", optional(&record.exhausted_redirect_url)),
        ("inactive url", optional(&record.inactive_redirect_url)),
    ];
    for (field, value) in rows {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    }
    table.to_string()
}

pub fn format_stats_table(stats: &Statistics) -> String {
    let mut table = new_table();
    table.set_header(vec![Cell::new("counter"), Cell::new("value")]);
    table.add_row(vec![Cell::new("urls"), Cell::new(stats.urls)]);
    table.add_row(vec![Cell::new("gets"), Cell::new(stats.gets)]);
    table.add_row(vec![Cell::new("gets expired"), Cell::new(stats.gets_expired)]);
    table.add_row(vec![Cell::new("upserts"), Cell::new(stats.upserts)]);
    table.add_row(vec![Cell::new("deletes"), Cell::new(stats.deletes)]);
    table.add_row(vec![
        Cell::new("last request"),
        Cell::new(format_time(stats.last_request)),
    ]);
    table.to_string()
}
