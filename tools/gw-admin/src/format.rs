//! Human-readable rendering of stream state.

use std::time::Duration;

use shared_bus::StreamInfo;

/// Format a number with thousand separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, c);
    }
    result
}

/// Format a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a retention age in the largest whole unit.
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0 => "unlimited".to_string(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

fn limit(value: Option<u64>, render: impl Fn(u64) -> String) -> String {
    value.map_or_else(|| "unlimited".to_string(), render)
}

/// One line per stream.
pub fn stream_table(streams: &[StreamInfo]) -> String {
    let mut out = format!(
        "{:<16} {:<48} {:>12} {:>12}\n",
        "STREAM", "SUBJECTS", "MESSAGES", "SIZE"
    );
    for info in streams {
        out.push_str(&format!(
            "{:<16} {:<48} {:>12} {:>12}\n",
            info.name,
            info.subjects.join(", "),
            format_number(info.stats.messages),
            format_bytes(info.stats.bytes),
        ));
    }
    out
}

/// Full configuration and state of one stream.
pub fn stream_details(info: &StreamInfo) -> String {
    let stats = &info.stats;
    let mut out = String::new();
    out.push_str(&format!("Stream:        {}\n", info.name));
    if let Some(description) = &info.description {
        out.push_str(&format!("Description:   {description}\n"));
    }
    out.push_str(&format!("Subjects:      {}\n", info.subjects.join(", ")));
    out.push_str(&format!("Storage:       {:?}\n", info.storage));
    out.push_str(&format!("Retention:     {:?}\n", info.retention));
    out.push_str(&format!("Max age:       {}\n", format_age(info.max_age)));
    out.push_str(&format!("Max bytes:     {}\n", limit(info.max_bytes, format_bytes)));
    out.push_str(&format!("Max messages:  {}\n", limit(info.max_messages, format_number)));
    out.push_str(&format!(
        "Max msg size:  {}\n",
        limit(info.max_message_size.map(u64::from), format_bytes)
    ));
    out.push_str(&format!("Replicas:      {}\n", info.replicas));
    out.push_str(&format!("Messages:      {}\n", format_number(stats.messages)));
    out.push_str(&format!("Size:          {}\n", format_bytes(stats.bytes)));
    out.push_str(&format!(
        "Sequences:     {}..={}\n",
        stats.first_sequence, stats.last_sequence
    ));
    out.push_str(&format!("Consumers:     {}\n", stats.consumer_count));
    if let Some(last) = stats.last_timestamp {
        out.push_str(&format!("Last message:  {}\n", last.to_rfc3339()));
    }
    out
}
